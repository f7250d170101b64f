//! Bringing the accessible tree in line with the content mirror.
//!
//! Reconciliation walks the exposed layout in preorder. Content that already
//! has a live node keeps it, moving it under its new parent if needed, so a
//! remove followed by a re-insert of the same handle preserves identity.
//! Content without a node gets a fresh one. Nodes whose content is no longer
//! exposed are shut down; they are retired once relations have been derived.

use std::collections::{HashMap, HashSet};

use crate::content::{ContentHandle, ContentTree};
use crate::error::Result;
use crate::logging::targets;
use crate::registry::{NodeId, NodeRegistry, NodeSeed};

/// What a reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Nodes created.
    pub created: usize,
    /// Nodes moved to a new parent.
    pub moved: usize,
    /// Nodes put into pending shutdown.
    pub shut_down: usize,
}

pub(crate) fn reconcile(content: &ContentTree, registry: &mut NodeRegistry) -> Result<ReconcileStats> {
    let layout = content.exposed_layout();
    let exposed: HashSet<ContentHandle> = layout.iter().map(|entry| entry.handle).collect();
    let mut stats = ReconcileStats::default();
    let mut child_order: Vec<(NodeId, Vec<NodeId>)> = Vec::new();
    let mut slot_of: HashMap<NodeId, usize> = HashMap::new();

    for entry in &layout {
        let Some(node) = content.get(entry.handle) else {
            continue;
        };

        let Some(parent_handle) = entry.parent else {
            if let Some(root) = registry.root() {
                registry.sync(root, node.attributes(), entry.scope)?;
            }
            continue;
        };
        let Some(parent) = registry.node_for_content(parent_handle) else {
            tracing::warn!(
                target: targets::ENGINE,
                handle = %entry.handle,
                parent = %parent_handle,
                "exposed content has no accessible parent"
            );
            continue;
        };

        let id = match registry.node_for_content(entry.handle) {
            Some(id) => {
                let current_parent = registry.node(id).and_then(|n| n.parent());
                if current_parent != Some(parent) {
                    registry.reparent(id, parent, usize::MAX)?;
                    stats.moved += 1;
                }
                registry.sync(id, node.attributes(), entry.scope)?;
                id
            }
            None => {
                stats.created += 1;
                registry.create_node(
                    entry.handle,
                    parent,
                    usize::MAX,
                    NodeSeed {
                        kind: node.kind().clone(),
                        attributes: node.attributes().clone(),
                        scope: entry.scope,
                    },
                )?
            }
        };

        let slot = *slot_of.entry(parent).or_insert_with(|| {
            child_order.push((parent, Vec::new()));
            child_order.len() - 1
        });
        child_order[slot].1.push(id);
    }

    for id in registry.preorder() {
        if !registry.is_alive(id) {
            continue;
        }
        let gone = registry
            .node(id)
            .is_some_and(|node| !exposed.contains(&node.content()));
        if gone {
            stats.shut_down += registry.begin_shutdown(id)?.len();
        }
    }

    for (parent, order) in child_order {
        registry.arrange_children(parent, order)?;
    }

    tracing::debug!(
        target: targets::ENGINE,
        created = stats.created,
        moved = stats.moved,
        shut_down = stats.shut_down,
        "reconciled accessible tree"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{AttributeMap, ContentDescriptor, ContentKind, Scope};

    fn h(n: u64) -> ContentHandle {
        ContentHandle(n)
    }

    fn setup(document: ContentDescriptor) -> (ContentTree, NodeRegistry) {
        let content = ContentTree::new(document);
        let mut registry = NodeRegistry::new();
        registry
            .create_root(
                content.root(),
                NodeSeed {
                    kind: ContentKind::Document,
                    attributes: AttributeMap::new(),
                    scope: Scope::Document,
                },
            )
            .unwrap();
        reconcile(&content, &mut registry).unwrap();
        (content, registry)
    }

    fn handles(content_registry: &NodeRegistry) -> Vec<ContentHandle> {
        content_registry
            .preorder()
            .into_iter()
            .filter_map(|id| content_registry.node(id).map(|n| n.content()))
            .collect()
    }

    #[test]
    fn test_initial_build() {
        let (_, registry) = setup(
            ContentDescriptor::document(h(1))
                .with_child(ContentDescriptor::element(h(2), "div").with_child(ContentDescriptor::text(h(3))))
                .with_child(ContentDescriptor::element(h(4), "p")),
        );
        assert_eq!(handles(&registry), vec![h(1), h(2), h(3), h(4)]);
    }

    #[test]
    fn test_move_keeps_identity() {
        let (mut content, mut registry) = setup(
            ContentDescriptor::document(h(1))
                .with_child(ContentDescriptor::element(h(2), "div"))
                .with_child(ContentDescriptor::element(h(3), "div").with_child(ContentDescriptor::element(h(4), "input"))),
        );
        let input = registry.node_for_content(h(4)).unwrap();

        content.remove(h(4)).unwrap();
        content
            .insert(h(2), 0, ContentDescriptor::element(h(4), "input"))
            .unwrap();
        let stats = reconcile(&content, &mut registry).unwrap();

        assert_eq!(stats.moved, 1);
        assert_eq!(stats.created, 0);
        assert_eq!(registry.node_for_content(h(4)), Some(input));
        let div = registry.node_for_content(h(2)).unwrap();
        assert_eq!(registry.node(input).unwrap().parent(), Some(div));
    }

    #[test]
    fn test_hidden_content_shut_down() {
        let (mut content, mut registry) = setup(
            ContentDescriptor::document(h(1)).with_child(
                ContentDescriptor::element(h(2), "figure")
                    .with_child(ContentDescriptor::element(h(3), "figcaption")),
            ),
        );
        let caption = registry.node_for_content(h(3)).unwrap();
        content.set_attribute(h(3), "hidden", Some(String::new())).unwrap();
        let stats = reconcile(&content, &mut registry).unwrap();
        assert_eq!(stats.shut_down, 1);
        assert!(!registry.is_alive(caption));

        registry.retire_pending();
        content.set_attribute(h(3), "hidden", None).unwrap();
        reconcile(&content, &mut registry).unwrap();
        let again = registry.node_for_content(h(3)).unwrap();
        assert_ne!(again, caption);
    }

    #[test]
    fn test_reorder_siblings() {
        let (mut content, mut registry) = setup(
            ContentDescriptor::document(h(1))
                .with_child(ContentDescriptor::element(h(2), "p"))
                .with_child(ContentDescriptor::element(h(3), "p")),
        );
        content.remove(h(2)).unwrap();
        content.insert(h(1), 1, ContentDescriptor::element(h(2), "p")).unwrap();
        reconcile(&content, &mut registry).unwrap();
        assert_eq!(handles(&registry), vec![h(1), h(3), h(2)]);
    }
}
