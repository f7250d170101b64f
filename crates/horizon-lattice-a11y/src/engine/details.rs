//! DETAILS derivation.
//!
//! `aria-details` wins whenever one of its tokens resolves to a live node.
//! Otherwise a popover invoker gets the popover it targets, provided that:
//!
//! - `popovertargetaction` is not `hide`,
//! - the target is a popover that is currently showing,
//! - the target is reachable from the invoker's tree scope,
//! - the target is not the invoker's next accessible sibling.
//!
//! The `popoverTargetElement` IDL property takes precedence over the
//! `popovertarget` attribute.

use super::DeriveContext;
use crate::registry::{AccessibleNode, NodeId};
use crate::store::EdgeMap;

/// Whether a node can invoke a popover.
fn is_popover_invoker(node: &AccessibleNode) -> bool {
    match node.tag() {
        Some("button") => true,
        Some("input") => node.attribute("type").is_some_and(|t| {
            ["button", "submit", "reset", "image"]
                .iter()
                .any(|kind| t.eq_ignore_ascii_case(kind))
        }),
        _ => false,
    }
}

fn popover_target(ctx: &DeriveContext<'_>, id: NodeId, node: &AccessibleNode) -> Option<NodeId> {
    if !is_popover_invoker(node) {
        return None;
    }
    let hides = node
        .attribute("popovertargetaction")
        .is_some_and(|action| action.trim().eq_ignore_ascii_case("hide"));
    if hides {
        return None;
    }

    let explicit = ctx.content.get(node.content()).and_then(|c| c.popover_target());
    let target = match explicit {
        Some(element) => {
            let reachable = ctx.content.contains(element)
                && ctx
                    .content
                    .scope_encloses(ctx.content.scope_of(element), node.scope());
            if !reachable {
                return None;
            }
            ctx.registry.node_for_content(element)?
        }
        None => ctx.resolve(node.attribute("popovertarget")?.trim(), node.scope())?,
    };

    // Only exposed popovers are showing ones; a non-popover target is ignored.
    let target_node = ctx.registry.node(target)?;
    if target_node.attribute("popover").is_none() {
        return None;
    }
    if ctx.registry.next_sibling(id) == Some(target) {
        return None;
    }
    Some(target)
}

pub(crate) fn derive(ctx: &DeriveContext<'_>) -> EdgeMap {
    let mut edges = EdgeMap::new();
    for (id, node) in ctx.nodes() {
        let explicit = node
            .attribute("aria-details")
            .map(|list| ctx.resolve_list(list, node.scope()))
            .unwrap_or_default();
        if !explicit.is_empty() {
            edges.insert(id, explicit);
            continue;
        }
        if let Some(target) = popover_target(ctx, id, node) {
            edges.insert(id, vec![target]);
        }
    }
    edges
}
