//! Versioned relation snapshots.
//!
//! Each batch applied by the relation engine produces one immutable
//! [`Snapshot`] that is committed to the [`RelationStore`] as a new
//! [`Version`]. Readers clone an `Arc<Snapshot>` under a short read lock and
//! then query it without holding any lock, so they are never blocked by the
//! engine building the next version. Per-kind edge tables are reference
//! counted and shared between versions when a batch did not touch them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::content::{ContentHandle, Scope};
use crate::error::{CacheError, Result};
use crate::logging::targets;
use crate::registry::NodeId;
use crate::relation::RelationKind;
use crate::role::AccessibleRole;

/// A committed snapshot version. Versions increase by one per commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version(u64);

impl Version {
    /// The version of an empty store, before the first commit.
    pub const INITIAL: Self = Self(0);

    /// The following version.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The raw version number.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Per-node data carried by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// The mirrored content node.
    pub content: ContentHandle,
    /// Tag name, for elements.
    pub tag: Option<String>,
    /// DOM id, if any.
    pub dom_id: Option<String>,
    /// Computed role.
    pub role: AccessibleRole,
    /// Tree scope.
    pub scope: Scope,
    /// Parent node.
    pub parent: Option<NodeId>,
    /// Children in tree order.
    pub children: Vec<NodeId>,
    /// Preorder position in the accessible tree.
    pub order: usize,
}

/// Targets of one relation kind, keyed by source node.
pub type EdgeMap = HashMap<NodeId, Vec<NodeId>>;

/// An immutable, internally consistent view of the accessible tree and its
/// relations.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: Version,
    root: Option<NodeId>,
    nodes: Arc<HashMap<NodeId, NodeInfo>>,
    by_content: Arc<HashMap<ContentHandle, NodeId>>,
    edges: [Arc<EdgeMap>; RelationKind::COUNT],
}

impl Snapshot {
    /// An empty snapshot.
    pub fn empty() -> Self {
        Self::new(None, HashMap::new(), Default::default())
    }

    /// Assemble a snapshot from its parts. The version is assigned on commit.
    pub fn new(
        root: Option<NodeId>,
        nodes: HashMap<NodeId, NodeInfo>,
        edges: [Arc<EdgeMap>; RelationKind::COUNT],
    ) -> Self {
        let by_content = nodes.iter().map(|(&id, info)| (info.content, id)).collect();
        Self {
            version: Version::INITIAL,
            root,
            nodes: Arc::new(nodes),
            by_content: Arc::new(by_content),
            edges,
        }
    }

    /// The committed version of this snapshot.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The document root.
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Number of accessible nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the snapshot has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether a node is live in this snapshot.
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    /// Per-node data.
    pub fn node(&self, node: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&node)
    }

    /// The node mirroring a content handle.
    pub fn node_for_content(&self, content: ContentHandle) -> Option<NodeId> {
        self.by_content.get(&content).copied()
    }

    /// The first node in tree order with the given DOM id, in any scope.
    pub fn find_by_dom_id(&self, dom_id: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, info)| info.dom_id.as_deref() == Some(dom_id))
            .min_by_key(|(_, info)| info.order)
            .map(|(&id, _)| id)
    }

    /// Every node in tree preorder.
    pub fn nodes_in_tree_order(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort_by_key(|id| self.nodes.get(id).map_or(usize::MAX, |info| info.order));
        ids
    }

    /// The edge table of a relation kind.
    pub fn edge_table(&self, kind: RelationKind) -> &Arc<EdgeMap> {
        &self.edges[kind.index()]
    }

    /// Targets of `(kind, node)`; empty when there are none.
    pub fn targets(&self, kind: RelationKind, node: NodeId) -> &[NodeId] {
        self.edges[kind.index()]
            .get(&node)
            .map_or(&[], Vec::as_slice)
    }

    /// Query a relation.
    ///
    /// Returns [`CacheError::UnknownNode`] when `node` is not live in this
    /// snapshot. An empty result is `None` or `Some(vec![])` depending on
    /// [`RelationKind::is_nullable`].
    pub fn query(&self, kind: RelationKind, node: NodeId) -> Result<Option<Vec<NodeId>>> {
        if !self.contains(node) {
            return Err(CacheError::UnknownNode(node));
        }
        let targets = self.targets(kind, node);
        if targets.is_empty() && kind.is_nullable() {
            Ok(None)
        } else {
            Ok(Some(targets.to_vec()))
        }
    }

    /// Total number of edges of a kind.
    pub fn edge_count(&self, kind: RelationKind) -> usize {
        self.edges[kind.index()].values().map(Vec::len).sum()
    }

    /// Check every structural and relation invariant.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        for (&id, info) in self.nodes.iter() {
            if let Some(parent) = info.parent {
                let linked = self
                    .nodes
                    .get(&parent)
                    .is_some_and(|p| p.children.contains(&id));
                if !linked {
                    violations.push(InvariantViolation::TreeMismatch { node: id });
                }
            } else if self.root != Some(id) {
                violations.push(InvariantViolation::TreeMismatch { node: id });
            }
            for child in &info.children {
                let linked = self
                    .nodes
                    .get(child)
                    .is_some_and(|c| c.parent == Some(id));
                if !linked {
                    violations.push(InvariantViolation::TreeMismatch { node: *child });
                }
            }
        }

        for kind in RelationKind::ALL {
            for (&source, targets) in self.edges[kind.index()].iter() {
                let mut seen = HashSet::new();
                for &target in targets {
                    if !self.contains(source) || !self.contains(target) {
                        violations.push(InvariantViolation::Dangling {
                            kind,
                            from: source,
                            to: target,
                        });
                        continue;
                    }
                    if !seen.insert(target) {
                        violations.push(InvariantViolation::DuplicateTarget {
                            kind,
                            from: source,
                            to: target,
                        });
                    }
                    if let Some(reverse) = kind.reverse() {
                        let mirrored = self.targets(reverse, target).contains(&source);
                        if !mirrored {
                            violations.push(InvariantViolation::Asymmetric {
                                kind,
                                from: source,
                                to: target,
                            });
                        }
                    }
                    if kind == RelationKind::MemberOf
                        && self.targets(RelationKind::MemberOf, target) != targets.as_slice()
                    {
                        violations.push(InvariantViolation::PeerSetMismatch {
                            node: source,
                            peer: target,
                        });
                    }
                }
                if kind == RelationKind::MemberOf && !targets.contains(&source) {
                    violations.push(InvariantViolation::PeerSetMismatch {
                        node: source,
                        peer: source,
                    });
                }
            }
        }

        violations
    }
}

/// A broken snapshot invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    /// A reversible edge without its mirror.
    #[error("{kind} edge {from:?} -> {to:?} has no reverse edge")]
    Asymmetric {
        kind: RelationKind,
        from: NodeId,
        to: NodeId,
    },
    /// An edge endpoint that is not in the snapshot.
    #[error("{kind} edge {from:?} -> {to:?} references a node missing from the snapshot")]
    Dangling {
        kind: RelationKind,
        from: NodeId,
        to: NodeId,
    },
    /// The same target listed twice for one source.
    #[error("{kind} edge {from:?} -> {to:?} is listed more than once")]
    DuplicateTarget {
        kind: RelationKind,
        from: NodeId,
        to: NodeId,
    },
    /// Group members that disagree about the peer set.
    #[error("member_of peer sets of {node:?} and {peer:?} differ")]
    PeerSetMismatch { node: NodeId, peer: NodeId },
    /// Parent and child links that disagree.
    #[error("parent/child links of {node:?} are inconsistent")]
    TreeMismatch { node: NodeId },
}

struct StoreState {
    current: Arc<Snapshot>,
    // Oldest first; the back is always `current`.
    history: VecDeque<Arc<Snapshot>>,
}

/// Concurrency-safe versioned snapshot store.
///
/// Single writer, many readers. The write lock is only held to swap the
/// current snapshot pointer.
pub struct RelationStore {
    state: RwLock<StoreState>,
    retained: usize,
    committed: Mutex<Version>,
    commit_signal: Condvar,
}

impl RelationStore {
    /// Create a store holding an empty snapshot at [`Version::INITIAL`].
    ///
    /// `retained` is the number of versions kept for `as_of` queries,
    /// at least one.
    pub fn new(retained: usize) -> Self {
        let current = Arc::new(Snapshot::empty());
        Self {
            state: RwLock::new(StoreState {
                current: current.clone(),
                history: VecDeque::from([current]),
            }),
            retained: retained.max(1),
            committed: Mutex::new(Version::INITIAL),
            commit_signal: Condvar::new(),
        }
    }

    /// The latest committed snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.state.read().current.clone()
    }

    /// The latest committed version.
    pub fn version(&self) -> Version {
        self.state.read().current.version
    }

    /// The oldest retained version.
    pub fn oldest_version(&self) -> Version {
        let state = self.state.read();
        state
            .history
            .front()
            .map_or(state.current.version, |s| s.version)
    }

    /// A retained snapshot by version.
    pub fn snapshot_at(&self, version: Version) -> Result<Arc<Snapshot>> {
        let state = self.state.read();
        state
            .history
            .iter()
            .find(|s| s.version == version)
            .cloned()
            .ok_or_else(|| CacheError::VersionUnavailable {
                requested: version,
                oldest: state
                    .history
                    .front()
                    .map_or(state.current.version, |s| s.version),
                latest: state.current.version,
            })
    }

    /// Publish a snapshot as the next version.
    #[tracing::instrument(skip(self, snapshot), target = "horizon_lattice_a11y::store", level = "trace")]
    pub fn commit(&self, mut snapshot: Snapshot) -> Version {
        let version = {
            let mut state = self.state.write();
            let version = state.current.version.next();
            snapshot.version = version;
            let snapshot = Arc::new(snapshot);
            state.current = snapshot.clone();
            state.history.push_back(snapshot);
            while state.history.len() > self.retained {
                state.history.pop_front();
            }
            version
        };

        *self.committed.lock() = version;
        self.commit_signal.notify_all();
        tracing::debug!(target: targets::STORE, %version, "committed snapshot");
        version
    }

    /// Query a relation in the latest or a retained version.
    pub fn query(
        &self,
        kind: RelationKind,
        node: NodeId,
        as_of: Option<Version>,
    ) -> Result<Option<Vec<NodeId>>> {
        let snapshot = match as_of {
            Some(version) => self.snapshot_at(version)?,
            None => self.snapshot(),
        };
        snapshot.query(kind, node)
    }

    /// Block until `version` (or a later one) is committed.
    ///
    /// Returns the latest snapshot, or
    /// [`CacheError::TimeoutWaitingForCommit`] when `timeout` expires first.
    pub fn wait_for_version(&self, version: Version, timeout: Duration) -> Result<Arc<Snapshot>> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut committed = self.committed.lock();
        while *committed < version {
            if self
                .commit_signal
                .wait_until(&mut committed, deadline)
                .timed_out()
                && *committed < version
            {
                return Err(CacheError::timeout(start.elapsed()));
            }
        }
        drop(committed);
        Ok(self.snapshot())
    }
}

impl Default for RelationStore {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_RETAINED_VERSIONS)
    }
}

impl fmt::Debug for RelationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("RelationStore")
            .field("version", &state.current.version)
            .field("retained", &self.retained)
            .field("history_len", &state.history.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(RelationStore: Send, Sync);
static_assertions::assert_impl_all!(Snapshot: Send, Sync);
