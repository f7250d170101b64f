//! Accessible node registry.
//!
//! Owns accessible-node identity, parent/child links and lifecycle, plus the
//! lookup indexes the relation engine resolves references through.
//!
//! # Key Types
//!
//! - [`NodeId`] - Generational handle for an accessible node
//! - [`AccessibleNode`] - Per-node data
//! - [`NodeRegistry`] - Arena owning every node
//!
//! # Lifecycle
//!
//! A node is [`Lifecycle::Alive`] from creation until the engine decides it
//! is gone. [`NodeRegistry::begin_shutdown`] detaches it and hides it from
//! every lookup, which lets the engine tear down relation edges in the same
//! batch. [`NodeRegistry::retire_node`] then frees the arena slot. A retired
//! `NodeId` is never reused for a different node.

use std::cmp::Ordering;
use std::collections::HashMap;

use slotmap::{new_key_type, SlotMap};

use crate::content::{AttributeMap, ContentHandle, ContentKind, Scope};
use crate::error::{CacheError, Result};
use crate::logging::targets;
use crate::role::AccessibleRole;

new_key_type! {
    /// A stable identifier for an accessible node.
    ///
    /// `NodeId`s survive moves of the underlying content and become invalid
    /// once the node is retired.
    pub struct NodeId;
}

impl NodeId {
    /// Convert the NodeId to a raw u64 value.
    ///
    /// The raw value can be converted back using [`NodeId::from_raw`].
    #[inline]
    pub fn as_raw(self) -> u64 {
        use slotmap::Key;
        self.data().as_ffi()
    }

    /// Create a NodeId from a raw u64 value.
    ///
    /// This does not check whether the node exists in any registry.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self::from(slotmap::KeyData::from_ffi(raw))
    }
}

/// Lifecycle state of an accessible node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Part of the accessible tree.
    Alive,
    /// Detached and scheduled for retirement at the end of the batch.
    PendingShutdown,
    /// Retired, or never known to this registry.
    Dead,
}

/// Content-side data used to create or refresh a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSeed {
    /// Content kind.
    pub kind: ContentKind,
    /// Attributes of the content node.
    pub attributes: AttributeMap,
    /// The tree scope of the content node.
    pub scope: Scope,
}

/// An accessible node.
#[derive(Debug, Clone)]
pub struct AccessibleNode {
    content: ContentHandle,
    kind: ContentKind,
    role: AccessibleRole,
    attributes: AttributeMap,
    scope: Scope,
    lifecycle: Lifecycle,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl AccessibleNode {
    /// The content node this accessible node mirrors.
    pub fn content(&self) -> ContentHandle {
        self.content
    }

    /// Content kind.
    pub fn kind(&self) -> &ContentKind {
        &self.kind
    }

    /// Tag name for elements.
    pub fn tag(&self) -> Option<&str> {
        self.kind.tag()
    }

    /// Computed role.
    pub fn role(&self) -> AccessibleRole {
        self.role
    }

    /// All attributes.
    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    /// A single attribute value.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// The DOM id, if present and non-empty.
    pub fn dom_id(&self) -> Option<&str> {
        self.attribute("id").filter(|id| !id.is_empty())
    }

    /// Tree scope.
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Parent node.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in tree order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Whether this is a native `<input type=radio>`.
    pub fn is_native_radio(&self) -> bool {
        self.tag() == Some("input")
            && self
                .attribute("type")
                .is_some_and(|t| t.eq_ignore_ascii_case("radio"))
    }
}

/// The arena of accessible nodes.
///
/// The registry is owned by the relation engine and mutated only on the
/// engine's thread; readers use committed snapshots instead.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: SlotMap<NodeId, AccessibleNode>,
    by_content: HashMap<ContentHandle, NodeId>,
    by_dom_id: HashMap<(Scope, String), Vec<NodeId>>,
    root: Option<NodeId>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The document root node.
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Number of nodes in the arena, including pending ones.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get a node.
    pub fn node(&self, id: NodeId) -> Option<&AccessibleNode> {
        self.nodes.get(id)
    }

    /// Lifecycle state of a node.
    pub fn lifecycle(&self, id: NodeId) -> Lifecycle {
        self.nodes
            .get(id)
            .map_or(Lifecycle::Dead, |node| node.lifecycle)
    }

    /// Whether a node is alive.
    pub fn is_alive(&self, id: NodeId) -> bool {
        self.lifecycle(id) == Lifecycle::Alive
    }

    /// The live node mirroring a content handle.
    pub fn node_for_content(&self, content: ContentHandle) -> Option<NodeId> {
        self.by_content.get(&content).copied()
    }

    /// Create the document root node.
    pub fn create_root(&mut self, content: ContentHandle, seed: NodeSeed) -> Result<NodeId> {
        if let Some(existing) = self.root {
            return Err(CacheError::duplicate(content, existing));
        }
        let id = self.insert_node(content, None, seed)?;
        self.root = Some(id);
        Ok(id)
    }

    /// Create a node under `parent` at `index` (clamped to the child count).
    ///
    /// Fails with [`CacheError::DuplicateIdentity`] if `content` is already
    /// mirrored by a live node.
    #[tracing::instrument(skip(self, seed), target = "horizon_lattice_a11y::registry", level = "trace")]
    pub fn create_node(
        &mut self,
        content: ContentHandle,
        parent: NodeId,
        index: usize,
        seed: NodeSeed,
    ) -> Result<NodeId> {
        if !self.is_alive(parent) {
            return Err(CacheError::UnknownNode(parent));
        }
        let id = self.insert_node(content, Some(parent), seed)?;
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            let index = index.min(parent_node.children.len());
            parent_node.children.insert(index, id);
        }
        Ok(id)
    }

    fn insert_node(
        &mut self,
        content: ContentHandle,
        parent: Option<NodeId>,
        seed: NodeSeed,
    ) -> Result<NodeId> {
        if let Some(&existing) = self.by_content.get(&content) {
            return Err(CacheError::duplicate(content, existing));
        }
        let NodeSeed {
            kind,
            attributes,
            scope,
        } = seed;
        let role = AccessibleRole::derive(&kind, &attributes);
        let id = self.nodes.insert(AccessibleNode {
            content,
            kind,
            role,
            attributes,
            scope,
            lifecycle: Lifecycle::Alive,
            parent,
            children: Vec::new(),
        });
        self.by_content.insert(content, id);
        self.index_dom_id(id);
        tracing::trace!(target: targets::REGISTRY, ?id, %content, role = role.name(), "created node");
        Ok(id)
    }

    /// Detach a subtree and mark it pending shutdown.
    ///
    /// Pending nodes disappear from every lookup immediately, so the content
    /// handles can be mirrored again in the same batch. Returns the affected
    /// nodes in preorder.
    pub fn begin_shutdown(&mut self, id: NodeId) -> Result<Vec<NodeId>> {
        let node = self.nodes.get(id).ok_or(CacheError::UnknownNode(id))?;
        if node.lifecycle != Lifecycle::Alive {
            return Ok(Vec::new());
        }
        if let Some(parent) = node.parent {
            if let Some(parent_node) = self.nodes.get_mut(parent) {
                parent_node.children.retain(|&c| c != id);
            }
        }
        if self.root == Some(id) {
            self.root = None;
        }

        let subtree = self.subtree_preorder(id);
        for &node_id in &subtree {
            self.unindex(node_id);
            if let Some(node) = self.nodes.get_mut(node_id) {
                node.lifecycle = Lifecycle::PendingShutdown;
            }
        }
        if let Some(node) = self.nodes.get_mut(id) {
            node.parent = None;
        }
        tracing::trace!(target: targets::REGISTRY, ?id, count = subtree.len(), "shutdown begun");
        Ok(subtree)
    }

    /// Free a node and its subtree.
    ///
    /// Live nodes are shut down first. The relation engine calls this only
    /// after every edge touching the subtree was removed.
    pub fn retire_node(&mut self, id: NodeId) -> Result<()> {
        if !self.nodes.contains_key(id) {
            return Err(CacheError::UnknownNode(id));
        }
        self.begin_shutdown(id)?;
        for node_id in self.subtree_preorder(id) {
            self.nodes.remove(node_id);
        }
        tracing::trace!(target: targets::REGISTRY, ?id, "retired node");
        Ok(())
    }

    /// Retire every node left pending shutdown.
    pub fn retire_pending(&mut self) -> Vec<NodeId> {
        let pending: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.lifecycle == Lifecycle::PendingShutdown)
            .map(|(id, _)| id)
            .collect();
        for &id in &pending {
            self.nodes.remove(id);
        }
        pending
    }

    /// Resolve a DOM id within a tree scope.
    ///
    /// Like `getElementById`, the first live match in tree order wins.
    pub fn lookup_by_content_key(&self, dom_id: &str, scope: Scope) -> Option<NodeId> {
        if dom_id.is_empty() {
            return None;
        }
        let candidates = self.by_dom_id.get(&(scope, dom_id.to_string()))?;
        candidates
            .iter()
            .copied()
            .filter(|&id| self.is_alive(id))
            .min_by(|&a, &b| self.tree_order(a, b))
    }

    /// Move `child` under `new_parent` at `index`, keeping its identity.
    pub fn reparent(&mut self, child: NodeId, new_parent: NodeId, index: usize) -> Result<()> {
        if !self.is_alive(child) {
            return Err(CacheError::UnknownNode(child));
        }
        if !self.is_alive(new_parent) {
            return Err(CacheError::UnknownNode(new_parent));
        }
        if self.is_ancestor_of(child, new_parent) {
            return Err(CacheError::CircularParentage);
        }

        let old_parent = self.nodes.get(child).and_then(|n| n.parent);
        if let Some(old) = old_parent.and_then(|p| self.nodes.get_mut(p)) {
            old.children.retain(|&c| c != child);
        }
        if let Some(node) = self.nodes.get_mut(child) {
            node.parent = Some(new_parent);
        }
        if let Some(parent_node) = self.nodes.get_mut(new_parent) {
            let index = index.min(parent_node.children.len());
            parent_node.children.insert(index, child);
        }
        tracing::trace!(target: targets::REGISTRY, ?child, ?new_parent, index, "reparented node");
        Ok(())
    }

    /// Replace the child order of `parent`.
    ///
    /// `order` must be a permutation of the current children. Returns whether
    /// the order changed.
    pub fn arrange_children(&mut self, parent: NodeId, order: Vec<NodeId>) -> Result<bool> {
        let node = self
            .nodes
            .get_mut(parent)
            .ok_or(CacheError::UnknownNode(parent))?;
        if node.children == order {
            return Ok(false);
        }
        debug_assert_eq!(node.children.len(), order.len());
        node.children = order;
        Ok(true)
    }

    /// Refresh the attributes and scope of a node.
    ///
    /// Re-indexes the DOM id and recomputes the role. Returns whether anything
    /// changed.
    pub fn sync(&mut self, id: NodeId, attributes: &AttributeMap, scope: Scope) -> Result<bool> {
        let node = self.nodes.get(id).ok_or(CacheError::UnknownNode(id))?;
        if node.attributes == *attributes && node.scope == scope {
            return Ok(false);
        }
        self.unindex_dom_id(id);
        if let Some(node) = self.nodes.get_mut(id) {
            node.attributes.clone_from(attributes);
            node.scope = scope;
            node.role = AccessibleRole::derive(&node.kind, &node.attributes);
        }
        self.index_dom_id(id);
        Ok(true)
    }

    fn index_dom_id(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        if let Some(dom_id) = node.dom_id() {
            self.by_dom_id
                .entry((node.scope, dom_id.to_string()))
                .or_default()
                .push(id);
        }
    }

    fn unindex_dom_id(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        let Some(dom_id) = node.dom_id() else {
            return;
        };
        let key = (node.scope, dom_id.to_string());
        if let Some(ids) = self.by_dom_id.get_mut(&key) {
            ids.retain(|&other| other != id);
            if ids.is_empty() {
                self.by_dom_id.remove(&key);
            }
        }
    }

    fn unindex(&mut self, id: NodeId) {
        self.unindex_dom_id(id);
        if let Some(node) = self.nodes.get(id) {
            if self.by_content.get(&node.content) == Some(&id) {
                self.by_content.remove(&node.content);
            }
        }
    }

    fn is_ancestor_of(&self, potential_ancestor: NodeId, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(current_id) = current {
            if current_id == potential_ancestor {
                return true;
            }
            current = self.nodes.get(current_id).and_then(|n| n.parent);
        }
        false
    }

    /// All ancestors of a node from immediate parent to root.
    pub fn ancestors(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let node = self.nodes.get(id).ok_or(CacheError::UnknownNode(id))?;
        let mut result = Vec::new();
        let mut current = node.parent;
        while let Some(current_id) = current {
            result.push(current_id);
            current = self.nodes.get(current_id).and_then(|n| n.parent);
        }
        Ok(result)
    }

    /// The next sibling in tree order.
    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.nodes.get(id)?.parent?;
        let siblings = &self.nodes.get(parent)?.children;
        let pos = siblings.iter().position(|&c| c == id)?;
        siblings.get(pos + 1).copied()
    }

    /// Every live node in tree preorder.
    pub fn preorder(&self) -> Vec<NodeId> {
        self.root
            .map(|root| self.subtree_preorder(root))
            .unwrap_or_default()
    }

    /// A subtree in preorder.
    pub fn subtree_preorder(&self, id: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(current) {
                result.push(current);
                stack.extend(node.children.iter().rev());
            }
        }
        result
    }

    /// Compare two nodes by tree (preorder) position.
    pub fn tree_order(&self, a: NodeId, b: NodeId) -> Ordering {
        self.tree_path(a).cmp(&self.tree_path(b))
    }

    fn tree_path(&self, id: NodeId) -> Vec<usize> {
        let mut path = Vec::new();
        let mut current = id;
        while let Some(parent) = self.nodes.get(current).and_then(|n| n.parent) {
            let index = self
                .nodes
                .get(parent)
                .and_then(|p| p.children.iter().position(|&c| c == current))
                .unwrap_or(usize::MAX);
            path.push(index);
            current = parent;
        }
        path.reverse();
        path
    }
}
