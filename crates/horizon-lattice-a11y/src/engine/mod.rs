//! The incremental relation engine.
//!
//! [`RelationEngine`] owns the content mirror and the node registry. It
//! applies one [`ChangeBatch`] at a time:
//!
//! 1. the batch is applied to the content mirror,
//! 2. the accessible tree is reconciled when the batch changed structure,
//! 3. relation kinds touched by the batch are re-derived,
//! 4. nodes shut down during the batch are retired,
//! 5. the new snapshot is committed and the resulting events dispatched.
//!
//! Forward kinds are derived from content; their reverse kinds are always
//! rebuilt from the forward table in the same step, so a committed snapshot
//! never holds an edge without its mirror. Kinds the batch did not touch
//! share their table with the previous snapshot.

mod details;
mod grouping;
mod labels;
mod links;
mod reconcile;

use std::collections::HashMap;
use std::sync::Arc;

pub use reconcile::ReconcileStats;

use crate::config::CacheConfig;
use crate::content::{ContentDescriptor, ContentHandle, ContentTree, Scope};
use crate::dispatch::{diff, Dispatcher};
use crate::error::{CacheError, Result};
use crate::logging::{span_names, targets};
use crate::observer::{ChangeBatch, ChangeEvent};
use crate::registry::{AccessibleNode, NodeId, NodeRegistry, NodeSeed};
use crate::relation::{KindSet, RelationKind};
use crate::store::{EdgeMap, NodeInfo, RelationStore, Snapshot, Version};

/// Relation kinds whose derivation reads an attribute.
///
/// `hidden` and `popover` change which nodes are exposed and are handled as
/// structural changes instead.
pub fn kinds_for_attribute(name: &str) -> KindSet {
    use RelationKind::*;
    match name {
        "id" | "role" | "type" => KindSet::ALL,
        "aria-labelledby" | "for" => [LabelledBy].into_iter().collect(),
        "name" => [MemberOf, LinksTo].into_iter().collect(),
        "aria-details" | "popovertarget" | "popovertargetaction" => {
            [Details].into_iter().collect()
        }
        "href" => [LinksTo].into_iter().collect(),
        _ => KindSet::EMPTY,
    }
}

/// Attribute changes that can alter which content nodes are exposed.
fn is_structural_attribute(content: &ContentTree, node: ContentHandle, name: &str) -> bool {
    match name {
        "hidden" | "popover" | "slot" => true,
        // Renaming a slot moves light children between slots.
        "name" => content.get(node).and_then(|n| n.kind().tag()) == Some("slot"),
        _ => false,
    }
}

/// Read-only view handed to the per-kind derivations.
pub(crate) struct DeriveContext<'a> {
    pub(crate) registry: &'a NodeRegistry,
    pub(crate) content: &'a ContentTree,
    preorder: &'a [NodeId],
}

impl<'a> DeriveContext<'a> {
    /// Live nodes in tree order.
    pub(crate) fn nodes(&self) -> impl Iterator<Item = (NodeId, &'a AccessibleNode)> + '_ {
        let registry = self.registry;
        self.preorder
            .iter()
            .filter_map(move |&id| registry.node(id).map(|node| (id, node)))
    }

    /// Resolve one id token in a scope.
    pub(crate) fn resolve(&self, dom_id: &str, scope: Scope) -> Option<NodeId> {
        self.registry.lookup_by_content_key(dom_id, scope)
    }

    /// Resolve a whitespace separated id list, dropping unresolved tokens and
    /// repeated targets.
    pub(crate) fn resolve_list(&self, list: &str, scope: Scope) -> Vec<NodeId> {
        let mut targets = Vec::new();
        for token in list.split_ascii_whitespace() {
            if let Some(id) = self.resolve(token, scope) {
                if !targets.contains(&id) {
                    targets.push(id);
                }
            }
        }
        targets
    }

    /// The nearest ancestor matching `predicate`.
    pub(crate) fn nearest_ancestor(
        &self,
        id: NodeId,
        predicate: impl Fn(&AccessibleNode) -> bool,
    ) -> Option<NodeId> {
        let mut current = self.registry.node(id)?.parent();
        while let Some(ancestor) = current {
            let node = self.registry.node(ancestor)?;
            if predicate(node) {
                return Some(ancestor);
            }
            current = node.parent();
        }
        None
    }

    /// Build a reverse table. Sources are visited in tree order, so every
    /// reverse target list is in tree order as well.
    pub(crate) fn reverse(&self, forward: &EdgeMap) -> EdgeMap {
        let mut reverse = EdgeMap::new();
        for &source in self.preorder {
            let Some(targets) = forward.get(&source) else {
                continue;
            };
            for &target in targets {
                reverse.entry(target).or_default().push(source);
            }
        }
        reverse
    }
}

#[derive(Debug, Default)]
struct BatchEffects {
    structural: bool,
    dirty: KindSet,
    touched: Vec<ContentHandle>,
    replaced: Vec<ContentHandle>,
}

/// Applies change batches and publishes relation snapshots.
pub struct RelationEngine {
    content: ContentTree,
    registry: NodeRegistry,
    store: Arc<RelationStore>,
    dispatcher: Arc<Dispatcher>,
    verify_invariants: bool,
    last_reconcile: Option<ReconcileStats>,
}

impl RelationEngine {
    /// Build the accessible tree for `document` and commit its first snapshot.
    ///
    /// No events are dispatched for the initial build.
    pub fn new(
        document: ContentDescriptor,
        store: Arc<RelationStore>,
        dispatcher: Arc<Dispatcher>,
        config: &CacheConfig,
    ) -> Result<Self> {
        let content = ContentTree::new(document);
        let root = content.root();
        let root_node = content.get(root).ok_or(CacheError::UnknownContent(root))?;
        let mut registry = NodeRegistry::new();
        registry.create_root(
            root,
            NodeSeed {
                kind: root_node.kind().clone(),
                attributes: root_node.attributes().clone(),
                scope: Scope::Document,
            },
        )?;

        let mut engine = Self {
            content,
            registry,
            store,
            dispatcher,
            verify_invariants: config.verify_invariants,
            last_reconcile: None,
        };
        engine.last_reconcile = Some(reconcile::reconcile(&engine.content, &mut engine.registry)?);
        let tables = engine.derive(KindSet::ALL, &Snapshot::empty());
        let (snapshot, _) = engine.verify(engine.build_snapshot(tables));
        let version = engine.store.commit(snapshot);
        tracing::debug!(
            target: targets::ENGINE,
            %version,
            nodes = engine.registry.len(),
            "built initial accessible tree"
        );
        Ok(engine)
    }

    /// Build an engine with its own store and dispatcher and default settings.
    pub fn with_defaults(document: ContentDescriptor) -> Result<Self> {
        let config = CacheConfig::default();
        Self::new(
            document,
            Arc::new(RelationStore::new(config.retained_versions)),
            Arc::new(Dispatcher::new()),
            &config,
        )
    }

    /// The snapshot store this engine commits to.
    pub fn store(&self) -> &Arc<RelationStore> {
        &self.store
    }

    /// The dispatcher this engine notifies.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The node registry.
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// The content mirror.
    pub fn content(&self) -> &ContentTree {
        &self.content
    }

    /// What the most recent structural batch did to the accessible tree.
    pub fn last_reconcile(&self) -> Option<ReconcileStats> {
        self.last_reconcile
    }

    /// Apply one batch, commit the resulting snapshot and dispatch its events.
    ///
    /// Events addressing unknown content are logged and skipped; the rest of
    /// the batch still applies. An empty batch still commits a version.
    #[tracing::instrument(
        skip(self, batch),
        target = "horizon_lattice_a11y::engine",
        level = "trace",
        fields(cycle = batch.cycle, events = batch.events.len())
    )]
    pub fn apply_batch(&mut self, batch: ChangeBatch) -> Result<Version> {
        let mut effects = BatchEffects::default();
        for event in batch.events {
            self.apply_event(event, &mut effects);
        }

        for &handle in &effects.replaced {
            if let Some(id) = self.registry.node_for_content(handle) {
                self.registry.begin_shutdown(id)?;
            }
        }

        if effects.structural {
            effects.dirty = KindSet::ALL;
            let _span = tracing::debug_span!(target: targets::ENGINE, span_names::RECONCILE).entered();
            self.last_reconcile = Some(reconcile::reconcile(&self.content, &mut self.registry)?);
        } else {
            for &handle in &effects.touched {
                self.sync_content(handle)?;
            }
        }

        let previous = self.store.snapshot();
        let tables = self.derive(effects.dirty, &previous);
        let retired = self.registry.retire_pending();
        let (snapshot, healed) = self.verify(self.build_snapshot(tables));
        if healed {
            effects.dirty = KindSet::ALL;
        }

        let version = self.store.commit(snapshot);
        let next = self.store.snapshot();
        let events = diff(&previous, &next, effects.dirty);
        tracing::debug!(
            target: targets::ENGINE,
            %version,
            cycle = batch.cycle,
            retired = retired.len(),
            events = events.len(),
            "applied batch"
        );

        let _span = tracing::trace_span!(target: targets::ENGINE, span_names::DISPATCH).entered();
        self.dispatcher.dispatch(&events);
        Ok(version)
    }

    fn apply_event(&mut self, event: ChangeEvent, effects: &mut BatchEffects) {
        let outcome = match event {
            ChangeEvent::Inserted {
                parent,
                index,
                subtree,
            } => {
                effects.structural = true;
                self.content
                    .insert(parent, index, subtree)
                    .map(|replaced| effects.replaced.extend(replaced))
            }
            ChangeEvent::Removed { node } => {
                effects.structural = true;
                self.content.remove(node).map(drop)
            }
            ChangeEvent::AttributeChanged { node, name, value } => {
                effects.structural |= is_structural_attribute(&self.content, node, &name);
                effects.dirty.extend(kinds_for_attribute(&name));
                let outcome = self.content.set_attribute(node, &name, value);
                if outcome.is_ok() {
                    effects.touched.push(node);
                }
                outcome
            }
            ChangeEvent::PopoverTargetChanged { node, target } => {
                effects.dirty.insert_with_reverse(RelationKind::Details);
                self.content.set_popover_target(node, target)
            }
            ChangeEvent::PopoverToggled { node, showing } => {
                effects.structural = true;
                self.content.set_popover_showing(node, showing)
            }
        };
        if let Err(err) = outcome {
            tracing::warn!(target: targets::ENGINE, %err, "skipping change to unknown content");
        }
    }

    fn sync_content(&mut self, handle: ContentHandle) -> Result<()> {
        let Some(id) = self.registry.node_for_content(handle) else {
            return Ok(());
        };
        let Some(node) = self.content.get(handle) else {
            return Ok(());
        };
        let scope = self.content.scope_of(handle);
        self.registry.sync(id, node.attributes(), scope)?;
        Ok(())
    }

    /// Derive the tables of `dirty` kinds, sharing the others with `previous`.
    fn derive(&self, dirty: KindSet, previous: &Snapshot) -> [Arc<EdgeMap>; RelationKind::COUNT] {
        use RelationKind::*;

        let _span = tracing::trace_span!(target: targets::ENGINE, span_names::DERIVE).entered();
        let mut tables: [Arc<EdgeMap>; RelationKind::COUNT] =
            std::array::from_fn(|i| previous.edge_table(RelationKind::ALL[i]).clone());
        if dirty.is_empty() {
            return tables;
        }

        let preorder = self.registry.preorder();
        let ctx = DeriveContext {
            registry: &self.registry,
            content: &self.content,
            preorder: &preorder,
        };

        if dirty.contains(LabelledBy) || dirty.contains(LabelFor) {
            let forward = labels::derive(&ctx);
            tables[LabelFor.index()] = Arc::new(ctx.reverse(&forward));
            tables[LabelledBy.index()] = Arc::new(forward);
        }
        if dirty.contains(MemberOf) {
            tables[MemberOf.index()] = Arc::new(grouping::derive(&ctx));
        }
        if dirty.contains(Details) || dirty.contains(DetailsFor) {
            let forward = details::derive(&ctx);
            tables[DetailsFor.index()] = Arc::new(ctx.reverse(&forward));
            tables[Details.index()] = Arc::new(forward);
        }
        if dirty.contains(LinksTo) {
            tables[LinksTo.index()] = Arc::new(links::derive(&ctx));
        }

        tracing::trace!(target: targets::ENGINE, ?dirty, nodes = preorder.len(), "derived relations");
        tables
    }

    fn build_snapshot(&self, tables: [Arc<EdgeMap>; RelationKind::COUNT]) -> Snapshot {
        let nodes: HashMap<NodeId, NodeInfo> = self
            .registry
            .preorder()
            .into_iter()
            .enumerate()
            .filter_map(|(order, id)| {
                let node = self.registry.node(id)?;
                Some((
                    id,
                    NodeInfo {
                        content: node.content(),
                        tag: node.tag().map(str::to_string),
                        dom_id: node.dom_id().map(str::to_string),
                        role: node.role(),
                        scope: node.scope(),
                        parent: node.parent(),
                        children: node.children().to_vec(),
                        order,
                    },
                ))
            })
            .collect();
        Snapshot::new(self.registry.root(), nodes, tables)
    }

    /// Check a snapshot before commit. A broken snapshot is logged and
    /// replaced by a full recomputation. Returns whether that happened.
    fn verify(&self, snapshot: Snapshot) -> (Snapshot, bool) {
        if !self.verify_invariants {
            return (snapshot, false);
        }
        let violations = snapshot.check_invariants();
        if violations.is_empty() {
            return (snapshot, false);
        }
        for violation in &violations {
            tracing::error!(target: targets::ENGINE, %violation, "relation invariant violated");
        }
        let healed = self.build_snapshot(self.derive(KindSet::ALL, &Snapshot::empty()));
        let remaining = healed.check_invariants();
        debug_assert!(
            remaining.is_empty(),
            "invariants still violated after full recomputation: {remaining:?}"
        );
        (healed, true)
    }
}

impl std::fmt::Debug for RelationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationEngine")
            .field("content_nodes", &self.content.len())
            .field("accessible_nodes", &self.registry.len())
            .field("version", &self.store.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::ChangeEvent;
    use crate::role::AccessibleRole;

    fn h(n: u64) -> ContentHandle {
        ContentHandle(n)
    }

    fn batch(events: Vec<ChangeEvent>) -> ChangeBatch {
        ChangeBatch { cycle: 1, events }
    }

    fn set_attr(node: u64, name: &str, value: Option<&str>) -> ChangeEvent {
        ChangeEvent::AttributeChanged {
            node: h(node),
            name: name.to_string(),
            value: value.map(str::to_string),
        }
    }

    fn node(engine: &RelationEngine, handle: u64) -> NodeId {
        engine.registry().node_for_content(h(handle)).unwrap()
    }

    fn query(engine: &RelationEngine, kind: RelationKind, handle: u64) -> Option<Vec<NodeId>> {
        engine.store().query(kind, node(engine, handle), None).unwrap()
    }

    #[test]
    fn test_kinds_for_attribute() {
        assert_eq!(kinds_for_attribute("id"), KindSet::ALL);
        assert!(kinds_for_attribute("for").contains(RelationKind::LabelFor));
        assert!(kinds_for_attribute("name").contains(RelationKind::MemberOf));
        assert!(kinds_for_attribute("popovertarget").contains(RelationKind::DetailsFor));
        assert!(kinds_for_attribute("class").is_empty());
    }

    #[test]
    fn test_initial_labels() {
        let engine = RelationEngine::with_defaults(
            ContentDescriptor::document(h(1))
                .with_child(ContentDescriptor::element(h(2), "label").with_attr("for", "i"))
                .with_child(ContentDescriptor::element(h(3), "input").with_attr("id", "i")),
        )
        .unwrap();
        assert_eq!(engine.store().version(), Version::INITIAL.next());
        assert_eq!(query(&engine, RelationKind::LabelledBy, 3), Some(vec![node(&engine, 2)]));
        assert_eq!(query(&engine, RelationKind::LabelFor, 2), Some(vec![node(&engine, 3)]));
        assert_eq!(query(&engine, RelationKind::LabelledBy, 2), None);
        assert_eq!(query(&engine, RelationKind::Details, 3), Some(vec![]));
    }

    #[test]
    fn test_explicit_labels_suppress_label_elements() {
        let mut engine = RelationEngine::with_defaults(
            ContentDescriptor::document(h(1))
                .with_child(ContentDescriptor::element(h(2), "label").with_attr("for", "i"))
                .with_child(ContentDescriptor::element(h(3), "span").with_attr("id", "s"))
                .with_child(ContentDescriptor::element(h(4), "input").with_attr("id", "i")),
        )
        .unwrap();
        engine
            .apply_batch(batch(vec![set_attr(4, "aria-labelledby", Some("missing s s"))]))
            .unwrap();
        assert_eq!(query(&engine, RelationKind::LabelledBy, 4), Some(vec![node(&engine, 3)]));
        assert_eq!(query(&engine, RelationKind::LabelFor, 2), None);

        engine
            .apply_batch(batch(vec![set_attr(4, "aria-labelledby", Some("missing"))]))
            .unwrap();
        assert_eq!(query(&engine, RelationKind::LabelledBy, 4), Some(vec![node(&engine, 2)]));
    }

    #[test]
    fn test_role_change_updates_grouping() {
        let mut engine = RelationEngine::with_defaults(
            ContentDescriptor::document(h(1)).with_child(
                ContentDescriptor::element(h(2), "div")
                    .with_attr("role", "radiogroup")
                    .with_child(ContentDescriptor::element(h(3), "div").with_attr("role", "radio"))
                    .with_child(ContentDescriptor::element(h(4), "div")),
            ),
        )
        .unwrap();
        assert_eq!(query(&engine, RelationKind::MemberOf, 3), Some(vec![node(&engine, 3)]));

        engine.apply_batch(batch(vec![set_attr(4, "role", Some("radio"))])).unwrap();
        assert_eq!(
            engine.registry().node(node(&engine, 4)).unwrap().role(),
            AccessibleRole::RadioButton
        );
        let members = vec![node(&engine, 3), node(&engine, 4)];
        assert_eq!(query(&engine, RelationKind::MemberOf, 3), Some(members.clone()));
        assert_eq!(query(&engine, RelationKind::MemberOf, 4), Some(members));
    }

    #[test]
    fn test_unrelated_kinds_share_tables() {
        let mut engine = RelationEngine::with_defaults(
            ContentDescriptor::document(h(1))
                .with_child(ContentDescriptor::element(h(2), "a").with_attr("href", "#t"))
                .with_child(ContentDescriptor::element(h(3), "p").with_attr("id", "t")),
        )
        .unwrap();
        let before = engine.store().snapshot();
        engine
            .apply_batch(batch(vec![set_attr(3, "aria-labelledby", Some("x"))]))
            .unwrap();
        let after = engine.store().snapshot();
        assert!(Arc::ptr_eq(
            before.edge_table(RelationKind::LinksTo),
            after.edge_table(RelationKind::LinksTo)
        ));
        assert_eq!(after.targets(RelationKind::LinksTo, node(&engine, 2)), &[node(&engine, 3)]);
    }

    #[test]
    fn test_unknown_content_skipped() {
        let mut engine = RelationEngine::with_defaults(
            ContentDescriptor::document(h(1))
                .with_child(ContentDescriptor::element(h(2), "label").with_attr("for", "i"))
                .with_child(ContentDescriptor::element(h(3), "input")),
        )
        .unwrap();
        let version = engine
            .apply_batch(batch(vec![
                set_attr(99, "id", Some("x")),
                set_attr(3, "id", Some("i")),
            ]))
            .unwrap();
        assert_eq!(version.value(), 2);
        assert_eq!(query(&engine, RelationKind::LabelledBy, 3), Some(vec![node(&engine, 2)]));
    }

    #[test]
    fn test_identity_conflict_replaces_node() {
        let mut engine = RelationEngine::with_defaults(
            ContentDescriptor::document(h(1))
                .with_child(ContentDescriptor::element(h(2), "div"))
                .with_child(ContentDescriptor::element(h(3), "input")),
        )
        .unwrap();
        let old = node(&engine, 3);
        engine
            .apply_batch(batch(vec![ChangeEvent::Inserted {
                parent: h(2),
                index: 0,
                subtree: ContentDescriptor::element(h(3), "input"),
            }]))
            .unwrap();
        let new = node(&engine, 3);
        assert_ne!(old, new);
        assert_eq!(engine.last_reconcile().unwrap().created, 1);
        assert!(!engine.store().snapshot().contains(old));
        assert!(engine.store().snapshot().check_invariants().is_empty());
    }
}
