//! Shared fixtures for relation cache integration tests.

#![allow(dead_code)]

use std::collections::HashMap;

use horizon_lattice_a11y::{
    CacheEvent, ContentDescriptor, ContentHandle, DocumentObserver, EventStream, NodeId,
    RelationEngine, RelationKind, Snapshot, Version,
};

/// Allocates content handles and remembers the handle of every element
/// created with an `id` attribute.
#[derive(Debug)]
pub struct Doc {
    next: u64,
    ids: HashMap<String, ContentHandle>,
}

impl Doc {
    pub const ROOT: ContentHandle = ContentHandle(1);

    pub fn new() -> Self {
        Self {
            next: 1,
            ids: HashMap::new(),
        }
    }

    fn allocate(&mut self) -> ContentHandle {
        self.next += 1;
        ContentHandle(self.next)
    }

    /// An element with attributes.
    pub fn el(&mut self, tag: &str, attrs: &[(&str, &str)]) -> ContentDescriptor {
        let handle = self.allocate();
        let mut descriptor = ContentDescriptor::element(handle, tag);
        for &(name, value) in attrs {
            if name == "id" {
                self.ids.insert(value.to_string(), handle);
            }
            descriptor = descriptor.with_attr(name, value);
        }
        descriptor
    }

    /// A text leaf.
    pub fn text(&mut self) -> ContentDescriptor {
        ContentDescriptor::text(self.allocate())
    }

    /// A shadow root.
    pub fn shadow_root(&mut self) -> ContentDescriptor {
        ContentDescriptor::shadow_root(self.allocate())
    }

    /// The handle of the element created with `id`.
    pub fn h(&self, id: &str) -> ContentHandle {
        *self
            .ids
            .get(id)
            .unwrap_or_else(|| panic!("no element was created with id {id:?}"))
    }
}

/// A synchronous engine driven through a [`DocumentObserver`].
pub struct Fixture {
    pub doc: Doc,
    pub engine: RelationEngine,
    pub observer: DocumentObserver,
    pub events: EventStream,
}

impl Fixture {
    pub fn new(doc: Doc, children: Vec<ContentDescriptor>) -> Self {
        let document = ContentDescriptor::document(Doc::ROOT).with_children(children);
        let engine = RelationEngine::with_defaults(document).expect("initial build");
        let events = engine.dispatcher().subscribe();
        Self {
            doc,
            engine,
            observer: DocumentObserver::new(),
            events,
        }
    }

    /// Close the current cycle and apply it. Returns the new version, or the
    /// current one if the cycle normalized to nothing.
    pub fn commit(&mut self) -> Version {
        let version = match self.observer.end_cycle() {
            Some(batch) => self.engine.apply_batch(batch).expect("apply batch"),
            None => self.engine.store().version(),
        };
        self.assert_invariants();
        version
    }

    /// Close the cycle, apply it and return the events it produced.
    pub fn commit_events(&mut self) -> Vec<CacheEvent> {
        self.events.drain();
        self.commit();
        self.events.drain()
    }

    pub fn snapshot(&self) -> std::sync::Arc<Snapshot> {
        self.engine.store().snapshot()
    }

    pub fn assert_invariants(&self) {
        let violations = self.snapshot().check_invariants();
        assert!(violations.is_empty(), "invariant violations: {violations:?}");
    }

    /// The live node for a content handle.
    pub fn try_node_of(&self, handle: ContentHandle) -> Option<NodeId> {
        self.snapshot().node_for_content(handle)
    }

    /// The live node for the element created with `id`.
    pub fn node(&self, id: &str) -> NodeId {
        self.try_node(id)
            .unwrap_or_else(|| panic!("element {id:?} is not exposed"))
    }

    pub fn try_node(&self, id: &str) -> Option<NodeId> {
        self.try_node_of(self.doc.h(id))
    }

    pub fn relation(&self, kind: RelationKind, id: &str) -> Option<Vec<NodeId>> {
        self.engine
            .store()
            .query(kind, self.node(id), None)
            .expect("query relation")
    }

    /// Relation targets as DOM ids, or `<tag>` for targets without one.
    pub fn relation_ids(&self, kind: RelationKind, id: &str) -> Option<Vec<String>> {
        let snapshot = self.snapshot();
        self.relation(kind, id).map(|targets| {
            targets
                .into_iter()
                .map(|target| {
                    let info = snapshot.node(target).expect("target in snapshot");
                    info.dom_id
                        .clone()
                        .unwrap_or_else(|| format!("<{}>", info.tag.as_deref().unwrap_or("?")))
                })
                .collect()
        })
    }

    pub fn set_attr(&self, handle: ContentHandle, name: &str, value: Option<&str>) {
        let old = self
            .engine
            .content()
            .get(handle)
            .and_then(|node| node.attribute(name))
            .map(str::to_string);
        self.observer
            .on_attribute_changed(handle, name, old.as_deref(), value);
    }

    pub fn set_attr_id(&self, id: &str, name: &str, value: Option<&str>) {
        self.set_attr(self.doc.h(id), name, value);
    }

    pub fn remove(&self, handle: ContentHandle) {
        self.observer.on_subtree_removed(handle);
    }

    pub fn insert(&self, parent: ContentHandle, index: usize, subtree: ContentDescriptor) {
        self.observer.on_subtree_inserted(parent, subtree, index);
    }

    /// Index of `handle` among its parent's content children.
    pub fn child_index(&self, handle: ContentHandle) -> usize {
        let content = self.engine.content();
        let parent = content
            .get(handle)
            .and_then(|node| node.parent())
            .expect("content has a parent");
        content
            .get(parent)
            .and_then(|node| node.children().iter().position(|&c| c == handle))
            .expect("content is a child of its parent")
    }
}

pub fn ids(list: &[&str]) -> Option<Vec<String>> {
    Some(list.iter().map(|s| s.to_string()).collect())
}
