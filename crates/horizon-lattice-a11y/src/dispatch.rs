//! Change notifications.
//!
//! After every commit the dispatcher compares the previous and the new
//! snapshot and emits ordered events:
//!
//! 1. [`CacheEventKind::NodeHidden`] for removed subtree roots, in old tree order,
//! 2. [`CacheEventKind::NodeShown`] for inserted subtree roots,
//! 3. [`CacheEventKind::Reorder`] for parents whose child list changed,
//! 4. [`CacheEventKind::RelationsChanged`] for nodes whose relations changed,
//!
//! the last three in new tree order. Events are dispatched only after their
//! version is published, so a consumer that reacts to an event by querying
//! the store sees at least that version.
//!
//! Consumers either connect a callback (invoked on the cache worker thread)
//! or subscribe an [`EventStream`] and wait on it from any thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};

use crate::content::ContentHandle;
use crate::error::{CacheError, Result};
use crate::logging::targets;
use crate::registry::NodeId;
use crate::relation::{KindSet, RelationKind};
use crate::store::{Snapshot, Version};

new_key_type! {
    /// Identifier returned when connecting a listener.
    pub struct ListenerId;
}

/// What changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEventKind {
    /// A subtree root left the accessible tree.
    NodeHidden {
        /// The removed node; no longer queryable.
        node: NodeId,
        /// Its content node.
        content: ContentHandle,
        /// Its former parent.
        parent: Option<NodeId>,
    },
    /// A subtree root entered the accessible tree.
    NodeShown {
        /// The new node.
        node: NodeId,
        /// Its content node.
        content: ContentHandle,
        /// Its parent.
        parent: Option<NodeId>,
    },
    /// The child list of a node changed.
    Reorder {
        /// The parent.
        node: NodeId,
        /// Its content node.
        content: ContentHandle,
    },
    /// One or more relations of a node changed.
    RelationsChanged {
        /// The node.
        node: NodeId,
        /// Its content node.
        content: ContentHandle,
        /// The changed relation kinds.
        kinds: KindSet,
    },
}

/// A change notification for one committed version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    /// The version that introduced the change.
    pub version: Version,
    /// What changed.
    pub kind: CacheEventKind,
}

impl CacheEvent {
    /// The node the event is about.
    pub fn node(&self) -> NodeId {
        match self.kind {
            CacheEventKind::NodeHidden { node, .. }
            | CacheEventKind::NodeShown { node, .. }
            | CacheEventKind::Reorder { node, .. }
            | CacheEventKind::RelationsChanged { node, .. } => node,
        }
    }

    /// The content node the event is about.
    pub fn content(&self) -> ContentHandle {
        match self.kind {
            CacheEventKind::NodeHidden { content, .. }
            | CacheEventKind::NodeShown { content, .. }
            | CacheEventKind::Reorder { content, .. }
            | CacheEventKind::RelationsChanged { content, .. } => content,
        }
    }

    /// Whether this is a hide event.
    pub fn is_hide(&self) -> bool {
        matches!(self.kind, CacheEventKind::NodeHidden { .. })
    }

    /// Whether this is a show event.
    pub fn is_show(&self) -> bool {
        matches!(self.kind, CacheEventKind::NodeShown { .. })
    }

    /// Whether this is a reorder event.
    pub fn is_reorder(&self) -> bool {
        matches!(self.kind, CacheEventKind::Reorder { .. })
    }

    /// Whether this reports a change of `kind`.
    pub fn changes_relation(&self, kind: RelationKind) -> bool {
        matches!(self.kind, CacheEventKind::RelationsChanged { kinds, .. } if kinds.contains(kind))
    }
}

/// Compute the ordered events leading from `prev` to `next`.
///
/// Only the kinds in `dirty` are compared for relation changes.
pub fn diff(prev: &Snapshot, next: &Snapshot, dirty: KindSet) -> Vec<CacheEvent> {
    let version = next.version();
    let mut events = Vec::new();

    for id in prev.nodes_in_tree_order() {
        if next.contains(id) {
            continue;
        }
        let Some(info) = prev.node(id) else { continue };
        let root_of_removal = info.parent.is_some_and(|parent| next.contains(parent));
        if root_of_removal {
            events.push(CacheEvent {
                version,
                kind: CacheEventKind::NodeHidden {
                    node: id,
                    content: info.content,
                    parent: info.parent,
                },
            });
        }
    }

    let order = next.nodes_in_tree_order();
    for &id in &order {
        if prev.contains(id) {
            continue;
        }
        let Some(info) = next.node(id) else { continue };
        let root_of_insertion = info.parent.map_or(true, |parent| prev.contains(parent));
        if root_of_insertion {
            events.push(CacheEvent {
                version,
                kind: CacheEventKind::NodeShown {
                    node: id,
                    content: info.content,
                    parent: info.parent,
                },
            });
        }
    }

    for &id in &order {
        let (Some(old), Some(new)) = (prev.node(id), next.node(id)) else {
            continue;
        };
        if old.children != new.children {
            events.push(CacheEvent {
                version,
                kind: CacheEventKind::Reorder {
                    node: id,
                    content: new.content,
                },
            });
        }
    }

    if !dirty.is_empty() {
        for &id in &order {
            if !prev.contains(id) {
                continue;
            }
            let mut kinds = KindSet::EMPTY;
            for kind in dirty.iter() {
                if prev.targets(kind, id) != next.targets(kind, id) {
                    kinds.insert(kind);
                }
            }
            if !kinds.is_empty() {
                if let Some(info) = next.node(id) {
                    events.push(CacheEvent {
                        version,
                        kind: CacheEventKind::RelationsChanged {
                            node: id,
                            content: info.content,
                            kinds,
                        },
                    });
                }
            }
        }
    }

    events
}

type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Fans committed events out to listeners and subscribers.
pub struct Dispatcher {
    listeners: Mutex<SlotMap<ListenerId, Listener>>,
    subscribers: Mutex<Vec<Sender<CacheEvent>>>,
}

impl Dispatcher {
    /// Create a dispatcher with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(SlotMap::with_key()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Connect a callback invoked for every event, on the dispatching thread.
    pub fn connect<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let id = self.listeners.lock().insert(Arc::new(listener));
        tracing::trace!(target: targets::DISPATCH, ?id, "connected listener");
        id
    }

    /// Disconnect a callback. Returns whether it was connected.
    pub fn disconnect(&self, id: ListenerId) -> bool {
        self.listeners.lock().remove(id).is_some()
    }

    /// Number of connected callbacks.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Open a new event stream. Dropping the stream unsubscribes it.
    pub fn subscribe(&self) -> EventStream {
        let (sender, receiver) = unbounded();
        self.subscribers.lock().push(sender);
        EventStream { receiver }
    }

    /// Number of live event streams.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver events in order to every listener and stream.
    #[tracing::instrument(skip_all, target = "horizon_lattice_a11y::dispatch", level = "trace", fields(count = events.len()))]
    pub fn dispatch(&self, events: &[CacheEvent]) {
        if events.is_empty() {
            return;
        }
        // Callbacks run without the lock so they may connect or disconnect.
        let listeners: Vec<Listener> = self.listeners.lock().values().cloned().collect();
        for event in events {
            for listener in &listeners {
                listener(event);
            }
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sender| events.iter().all(|event| sender.send(event.clone()).is_ok()));
        tracing::trace!(
            target: targets::DISPATCH,
            listeners = listeners.len(),
            subscribers = subscribers.len(),
            "dispatched events"
        );
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &self.listener_count())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// A stream of cache events, readable from any thread.
#[derive(Debug)]
pub struct EventStream {
    receiver: Receiver<CacheEvent>,
}

impl EventStream {
    /// The next event, if one is already queued.
    pub fn try_next(&self) -> Option<CacheEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next event.
    pub fn next_timeout(&self, timeout: Duration) -> Result<CacheEvent> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::Timeout) => Err(CacheError::timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(CacheError::Disconnected),
        }
    }

    /// Wait up to `timeout` for an event matching `predicate`.
    ///
    /// Events that do not match are consumed.
    pub fn wait_for<P>(&self, mut predicate: P, timeout: Duration) -> Result<CacheEvent>
    where
        P: FnMut(&CacheEvent) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(event) if predicate(&event) => return Ok(event),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => return Err(CacheError::timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => return Err(CacheError::Disconnected),
            }
        }
    }

    /// Take every queued event.
    pub fn drain(&self) -> Vec<CacheEvent> {
        self.receiver.try_iter().collect()
    }
}

/// Poll `condition` every `interval` until it yields a value or `timeout`
/// expires.
///
/// Expiry is reported as [`CacheError::TimeoutWaitingForCommit`], distinct
/// from any value the condition produces.
pub fn poll_until<T, F>(timeout: Duration, interval: Duration, mut condition: F) -> Result<T>
where
    F: FnMut() -> Option<T>,
{
    let start = Instant::now();
    loop {
        if let Some(value) = condition() {
            return Ok(value);
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(CacheError::timeout(elapsed));
        }
        std::thread::sleep(interval.min(timeout - elapsed));
    }
}

static_assertions::assert_impl_all!(Dispatcher: Send, Sync);
