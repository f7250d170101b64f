//! LABELLED_BY derivation.
//!
//! Sources are combined in a fixed order:
//!
//! 1. `aria-labelledby` id tokens resolved in the node's scope, in attribute order,
//! 2. `<label>` elements labelling the node, in tree order of the labels, only
//!    when no explicit target resolved,
//! 3. the first `<figcaption>` child of a `<figure>`.
//!
//! A target listed twice keeps its first position.

use std::collections::HashMap;

use super::DeriveContext;
use crate::registry::NodeId;
use crate::store::EdgeMap;

/// Tags a `<label>` without `for` can label when they are its descendant.
fn is_labelable(tag: &str, input_type: Option<&str>) -> bool {
    match tag {
        "input" => !input_type.is_some_and(|t| t.eq_ignore_ascii_case("hidden")),
        "select" | "textarea" | "button" | "meter" | "output" | "progress" => true,
        _ => false,
    }
}

/// The element each `<label>` labels, grouped by labelled node.
fn label_sources(ctx: &DeriveContext<'_>) -> HashMap<NodeId, Vec<NodeId>> {
    let mut sources: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for (label, node) in ctx.nodes() {
        if node.tag() != Some("label") {
            continue;
        }
        let target = match node.attribute("for") {
            Some(for_id) => ctx.resolve(for_id.trim(), node.scope()),
            None => ctx
                .registry
                .subtree_preorder(label)
                .into_iter()
                .skip(1)
                .find(|&id| {
                    ctx.registry.node(id).is_some_and(|n| {
                        n.tag()
                            .is_some_and(|tag| is_labelable(tag, n.attribute("type")))
                    })
                }),
        };
        if let Some(target) = target {
            sources.entry(target).or_default().push(label);
        }
    }
    sources
}

pub(crate) fn derive(ctx: &DeriveContext<'_>) -> EdgeMap {
    let implicit = label_sources(ctx);
    let mut edges = EdgeMap::new();

    for (id, node) in ctx.nodes() {
        let mut targets = node
            .attribute("aria-labelledby")
            .map(|list| ctx.resolve_list(list, node.scope()))
            .unwrap_or_default();

        if targets.is_empty() {
            if let Some(labels) = implicit.get(&id) {
                targets.extend(labels.iter().copied());
            }
        }

        if node.tag() == Some("figure") {
            let caption = node.children().iter().copied().find(|&child| {
                ctx.registry
                    .node(child)
                    .is_some_and(|c| c.tag() == Some("figcaption"))
            });
            if let Some(caption) = caption {
                if !targets.contains(&caption) {
                    targets.push(caption);
                }
            }
        }

        if !targets.is_empty() {
            edges.insert(id, targets);
        }
    }
    edges
}
