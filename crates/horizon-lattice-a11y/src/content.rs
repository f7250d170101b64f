//! Mirror of the host document's content tree.
//!
//! The relation engine never reads the host document directly. It keeps its
//! own normalized copy, patched from [`ChangeEvent`](crate::observer::ChangeEvent)s,
//! so that content which is currently hidden (a `hidden` subtree, a closed
//! popover) can be exposed again later with fresh accessible identity.
//!
//! # Exposure
//!
//! Content is exposed to the accessible tree when it and every ancestor:
//!
//! - has no `hidden` attribute,
//! - is not a `popover` that is not showing,
//! - is not light-DOM content of a shadow host.
//!
//! Shadow roots are transparent: their children become accessible children of
//! the shadow host.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{CacheError, Result};
use crate::logging::targets;

/// Host-provided handle identifying a content node.
///
/// Handles are assigned by the document model and stay stable while the
/// content node exists, including across moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHandle(pub u64);

impl fmt::Display for ContentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Sparse attribute storage, keyed by lower-case attribute name.
pub type AttributeMap = BTreeMap<String, String>;

/// The kind of a content node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentKind {
    /// The document root.
    Document,
    /// An element with a lower-case tag name.
    Element {
        /// Tag name.
        tag: String,
    },
    /// A text run.
    Text,
    /// A shadow root attached to its parent element.
    ShadowRoot,
}

impl ContentKind {
    /// The tag name for elements.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::Element { tag } => Some(tag),
            _ => None,
        }
    }
}

/// A tree scope: the document or a shadow root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Scope {
    /// The document scope.
    #[default]
    Document,
    /// The scope of the given shadow root.
    Shadow(ContentHandle),
}

/// A content subtree handed over by the document model.
///
/// Used for the initial document and for [`SubtreeInserted`] notifications.
///
/// [`SubtreeInserted`]: crate::observer::RawMutation::SubtreeInserted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDescriptor {
    /// The handle of the subtree root.
    pub handle: ContentHandle,
    /// The kind of the subtree root.
    pub kind: ContentKind,
    /// Attributes of the subtree root.
    pub attributes: AttributeMap,
    /// Whether the node is a popover currently in the showing state.
    pub popover_showing: bool,
    /// The `popoverTargetElement` IDL property.
    pub popover_target: Option<ContentHandle>,
    /// Children in document order. A [`ContentKind::ShadowRoot`] child is the
    /// element's shadow root.
    pub children: Vec<ContentDescriptor>,
}

impl ContentDescriptor {
    fn new(handle: ContentHandle, kind: ContentKind) -> Self {
        Self {
            handle,
            kind,
            attributes: AttributeMap::new(),
            popover_showing: false,
            popover_target: None,
            children: Vec::new(),
        }
    }

    /// A document root.
    pub fn document(handle: ContentHandle) -> Self {
        Self::new(handle, ContentKind::Document)
    }

    /// An element. The tag is lower-cased.
    pub fn element(handle: ContentHandle, tag: impl AsRef<str>) -> Self {
        Self::new(
            handle,
            ContentKind::Element {
                tag: tag.as_ref().to_ascii_lowercase(),
            },
        )
    }

    /// A text run.
    pub fn text(handle: ContentHandle) -> Self {
        Self::new(handle, ContentKind::Text)
    }

    /// A shadow root.
    pub fn shadow_root(handle: ContentHandle) -> Self {
        Self::new(handle, ContentKind::ShadowRoot)
    }

    /// Set an attribute. The name is lower-cased.
    pub fn with_attr(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.attributes
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Append a child.
    pub fn with_child(mut self, child: ContentDescriptor) -> Self {
        self.children.push(child);
        self
    }

    /// Append several children.
    pub fn with_children(mut self, children: impl IntoIterator<Item = ContentDescriptor>) -> Self {
        self.children.extend(children);
        self
    }

    /// Mark a popover as showing.
    pub fn showing(mut self) -> Self {
        self.popover_showing = true;
        self
    }

    /// Set the `popoverTargetElement` IDL property.
    pub fn with_popover_target(mut self, target: ContentHandle) -> Self {
        self.popover_target = Some(target);
        self
    }

    /// All handles of this subtree in preorder.
    pub fn handles(&self) -> Vec<ContentHandle> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(desc) = stack.pop() {
            out.push(desc.handle);
            stack.extend(desc.children.iter().rev());
        }
        out
    }
}

/// A mirrored content node.
#[derive(Debug, Clone)]
pub struct ContentNode {
    kind: ContentKind,
    attributes: AttributeMap,
    popover_showing: bool,
    popover_target: Option<ContentHandle>,
    parent: Option<ContentHandle>,
    children: Vec<ContentHandle>,
}

impl ContentNode {
    /// The node kind.
    pub fn kind(&self) -> &ContentKind {
        &self.kind
    }

    /// All attributes.
    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    /// A single attribute value.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// The `popoverTargetElement` IDL property.
    pub fn popover_target(&self) -> Option<ContentHandle> {
        self.popover_target
    }

    /// Whether a popover is showing.
    pub fn popover_showing(&self) -> bool {
        self.popover_showing
    }

    /// Parent handle.
    pub fn parent(&self) -> Option<ContentHandle> {
        self.parent
    }

    /// Child handles in document order.
    pub fn children(&self) -> &[ContentHandle] {
        &self.children
    }

    fn is_hidden(&self) -> bool {
        self.attributes.contains_key("hidden")
            || (self.attributes.contains_key("popover") && !self.popover_showing)
    }
}

/// One exposed node of the layout computed by [`ContentTree::exposed_layout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposedEntry {
    /// The content node.
    pub handle: ContentHandle,
    /// The content node that is its accessible parent.
    pub parent: Option<ContentHandle>,
    /// The tree scope the node lives in.
    pub scope: Scope,
}

/// The engine's mirror of the host content tree.
#[derive(Debug, Clone)]
pub struct ContentTree {
    nodes: HashMap<ContentHandle, ContentNode>,
    root: ContentHandle,
}

impl ContentTree {
    /// Build a mirror from the initial document.
    pub fn new(document: ContentDescriptor) -> Self {
        let root = document.handle;
        let mut tree = Self {
            nodes: HashMap::new(),
            root,
        };
        tree.insert_descriptor(document, None);
        tree
    }

    /// The document root handle.
    pub fn root(&self) -> ContentHandle {
        self.root
    }

    /// Look up a node.
    pub fn get(&self, handle: ContentHandle) -> Option<&ContentNode> {
        self.nodes.get(&handle)
    }

    /// Whether a node is mirrored.
    pub fn contains(&self, handle: ContentHandle) -> bool {
        self.nodes.contains_key(&handle)
    }

    /// Number of mirrored nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the mirror is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a subtree under `parent` at `index` (clamped to the child count).
    ///
    /// A handle that is already mirrored is an identity conflict: the earlier
    /// node and its subtree are dropped and the new subtree wins. Returns the
    /// conflicting handles.
    pub fn insert(
        &mut self,
        parent: ContentHandle,
        index: usize,
        descriptor: ContentDescriptor,
    ) -> Result<Vec<ContentHandle>> {
        if !self.nodes.contains_key(&parent) {
            return Err(CacheError::UnknownContent(parent));
        }

        let mut replaced = Vec::new();
        for handle in descriptor.handles() {
            if self.nodes.contains_key(&handle) {
                tracing::error!(
                    target: targets::ENGINE,
                    %handle,
                    "content handle inserted while still mirrored; replacing earlier node"
                );
                self.remove(handle)?;
                replaced.push(handle);
            }
        }
        // The conflict may have taken the parent with it.
        if !self.nodes.contains_key(&parent) {
            return Err(CacheError::UnknownContent(parent));
        }

        let handle = descriptor.handle;
        self.insert_descriptor(descriptor, Some(parent));
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            let index = index.min(parent_node.children.len());
            parent_node.children.insert(index, handle);
        }
        Ok(replaced)
    }

    fn insert_descriptor(&mut self, descriptor: ContentDescriptor, parent: Option<ContentHandle>) {
        let mut pending = vec![(descriptor, parent)];
        while let Some((descriptor, parent)) = pending.pop() {
            let ContentDescriptor {
                handle,
                kind,
                attributes,
                popover_showing,
                popover_target,
                children,
            } = descriptor;
            let child_handles = children.iter().map(|c| c.handle).collect();
            self.nodes.insert(
                handle,
                ContentNode {
                    kind,
                    attributes,
                    popover_showing,
                    popover_target,
                    parent,
                    children: child_handles,
                },
            );
            pending.extend(children.into_iter().map(|child| (child, Some(handle))));
        }
    }

    /// Remove a subtree, returning the removed handles in preorder.
    ///
    /// The document root cannot be removed.
    pub fn remove(&mut self, handle: ContentHandle) -> Result<Vec<ContentHandle>> {
        if handle == self.root {
            tracing::warn!(target: targets::ENGINE, %handle, "ignoring removal of the document root");
            return Ok(Vec::new());
        }
        let parent = self
            .nodes
            .get(&handle)
            .ok_or(CacheError::UnknownContent(handle))?
            .parent;
        if let Some(parent_node) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent_node.children.retain(|&c| c != handle);
        }

        let mut removed = Vec::new();
        let mut stack = vec![handle];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                removed.push(current);
                stack.extend(node.children.iter().rev());
            }
        }
        Ok(removed)
    }

    /// Set or clear an attribute.
    pub fn set_attribute(
        &mut self,
        handle: ContentHandle,
        name: &str,
        value: Option<String>,
    ) -> Result<()> {
        let node = self.node_mut(handle)?;
        match value {
            Some(value) => {
                node.attributes.insert(name.to_string(), value);
            }
            None => {
                node.attributes.remove(name);
            }
        }
        Ok(())
    }

    /// Set the `popoverTargetElement` IDL property.
    pub fn set_popover_target(
        &mut self,
        handle: ContentHandle,
        target: Option<ContentHandle>,
    ) -> Result<()> {
        self.node_mut(handle)?.popover_target = target;
        Ok(())
    }

    /// Set the popover showing state.
    pub fn set_popover_showing(&mut self, handle: ContentHandle, showing: bool) -> Result<()> {
        self.node_mut(handle)?.popover_showing = showing;
        Ok(())
    }

    fn node_mut(&mut self, handle: ContentHandle) -> Result<&mut ContentNode> {
        self.nodes
            .get_mut(&handle)
            .ok_or(CacheError::UnknownContent(handle))
    }

    /// The tree scope containing `handle`.
    ///
    /// A shadow root is in its own scope.
    pub fn scope_of(&self, handle: ContentHandle) -> Scope {
        let mut current = Some(handle);
        while let Some(h) = current {
            let Some(node) = self.nodes.get(&h) else {
                break;
            };
            if node.kind == ContentKind::ShadowRoot {
                return Scope::Shadow(h);
            }
            current = node.parent;
        }
        Scope::Document
    }

    /// The scope enclosing `scope`, or `None` for the document scope.
    pub fn enclosing_scope(&self, scope: Scope) -> Option<Scope> {
        match scope {
            Scope::Document => None,
            Scope::Shadow(root) => {
                let host = self.nodes.get(&root).and_then(|n| n.parent)?;
                Some(self.scope_of(host))
            }
        }
    }

    /// Whether `outer` is `inner` or one of its enclosing scopes.
    pub fn scope_encloses(&self, outer: Scope, inner: Scope) -> bool {
        let mut current = Some(inner);
        while let Some(scope) = current {
            if scope == outer {
                return true;
            }
            current = self.enclosing_scope(scope);
        }
        false
    }

    /// The exposed content nodes in accessible tree preorder.
    ///
    /// The first entry is always the document root. A shadow host lays out
    /// its shadow tree instead of its light children. A `<slot>` is
    /// transparent: the light children assigned to it take its place, or its
    /// own children when nothing is assigned.
    pub fn exposed_layout(&self) -> Vec<ExposedEntry> {
        let mut out = Vec::with_capacity(self.nodes.len());
        out.push(ExposedEntry {
            handle: self.root,
            parent: None,
            scope: Scope::Document,
        });

        let mut stack = vec![LayoutStep::Expand {
            node: self.root,
            parent: self.root,
            scope: Scope::Document,
        }];
        while let Some(step) = stack.pop() {
            match step {
                LayoutStep::Expand {
                    node,
                    parent,
                    scope,
                } => {
                    let Some(content) = self.nodes.get(&node) else {
                        continue;
                    };
                    if let Some(shadow) = self.shadow_root_of(content) {
                        stack.push(LayoutStep::Expand {
                            node: shadow,
                            parent,
                            scope: Scope::Shadow(shadow),
                        });
                        continue;
                    }
                    for &child in content.children.iter().rev() {
                        stack.push(LayoutStep::Visit {
                            node: child,
                            parent,
                            scope,
                        });
                    }
                }
                LayoutStep::Visit {
                    node,
                    parent,
                    scope,
                } => {
                    let Some(content) = self.nodes.get(&node) else {
                        continue;
                    };
                    if matches!(content.kind, ContentKind::ShadowRoot | ContentKind::Document)
                        || content.is_hidden()
                    {
                        continue;
                    }
                    if let Scope::Shadow(shadow) = scope {
                        if content.kind.tag() == Some("slot") {
                            let assigned = self.assigned_nodes(shadow, node);
                            if assigned.is_empty() {
                                stack.push(LayoutStep::Expand {
                                    node,
                                    parent,
                                    scope,
                                });
                            } else {
                                let light_scope = self.enclosing_scope(scope).unwrap_or_default();
                                for &light in assigned.iter().rev() {
                                    stack.push(LayoutStep::Visit {
                                        node: light,
                                        parent,
                                        scope: light_scope,
                                    });
                                }
                            }
                            continue;
                        }
                    }
                    out.push(ExposedEntry {
                        handle: node,
                        parent: Some(parent),
                        scope,
                    });
                    stack.push(LayoutStep::Expand {
                        node,
                        parent: node,
                        scope,
                    });
                }
            }
        }
        out
    }

    fn shadow_root_of(&self, node: &ContentNode) -> Option<ContentHandle> {
        node.children
            .iter()
            .copied()
            .find(|c| matches!(self.nodes.get(c), Some(n) if n.kind == ContentKind::ShadowRoot))
    }

    /// Light children of the shadow host that are assigned to `slot`.
    ///
    /// Elements go to the slot named by their `slot` attribute, text to the
    /// default slot. Only the first slot of a name in tree order receives
    /// content.
    pub fn assigned_nodes(&self, shadow: ContentHandle, slot: ContentHandle) -> Vec<ContentHandle> {
        let name = self
            .nodes
            .get(&slot)
            .and_then(|n| n.attribute("name"))
            .unwrap_or("");
        if self.first_slot(shadow, name) != Some(slot) {
            return Vec::new();
        }
        let Some(host) = self
            .nodes
            .get(&shadow)
            .and_then(|n| n.parent)
            .and_then(|h| self.nodes.get(&h))
        else {
            return Vec::new();
        };
        host.children
            .iter()
            .copied()
            .filter(|c| match self.nodes.get(c) {
                Some(n) => match n.kind {
                    ContentKind::Element { .. } => n.attribute("slot").unwrap_or("") == name,
                    ContentKind::Text => name.is_empty(),
                    _ => false,
                },
                None => false,
            })
            .collect()
    }

    /// The first `<slot>` named `name` in a shadow tree.
    fn first_slot(&self, shadow: ContentHandle, name: &str) -> Option<ContentHandle> {
        let mut stack = vec![shadow];
        while let Some(handle) = stack.pop() {
            let Some(node) = self.nodes.get(&handle) else {
                continue;
            };
            if node.kind.tag() == Some("slot") && node.attribute("name").unwrap_or("") == name {
                return Some(handle);
            }
            // Nested shadow trees have slots of their own.
            stack.extend(node.children.iter().rev().copied().filter(
                |c| !matches!(self.nodes.get(c), Some(n) if n.kind == ContentKind::ShadowRoot),
            ));
        }
        None
    }
}

#[derive(Debug, Clone, Copy)]
enum LayoutStep {
    /// Lay out the children of `node` under `parent`.
    Expand {
        node: ContentHandle,
        parent: ContentHandle,
        scope: Scope,
    },
    /// Expose `node` under `parent` unless it is skipped.
    Visit {
        node: ContentHandle,
        parent: ContentHandle,
        scope: Scope,
    },
}
