//! The relation cache service.
//!
//! [`AccessibilityCache`] runs a [`RelationEngine`] on a dedicated worker
//! thread. Normalized batches from a [`DocumentObserver`] are queued on a
//! bounded channel and applied one at a time, in order; readers query the
//! shared [`RelationStore`] from any thread and never wait for the worker.
//!
//! # Example
//!
//! ```no_run
//! use horizon_lattice_a11y::{
//!     AccessibilityCache, ContentDescriptor, ContentHandle, DocumentObserver, RelationKind,
//! };
//!
//! let document = ContentDescriptor::document(ContentHandle(1))
//!     .with_child(ContentDescriptor::element(ContentHandle(2), "input").with_attr("id", "i"));
//! let cache = AccessibilityCache::new(document)?;
//! let observer = DocumentObserver::new();
//!
//! observer.on_subtree_inserted(
//!     ContentHandle(1),
//!     ContentDescriptor::element(ContentHandle(3), "label").with_attr("for", "i"),
//!     0,
//! );
//! observer.flush(&cache.sink())?;
//!
//! let snapshot = cache.wait_idle()?;
//! let input = snapshot.node_for_content(ContentHandle(2)).unwrap();
//! println!("{:?}", cache.query_relation(RelationKind::LabelledBy, input)?);
//!
//! cache.shutdown_and_join();
//! # Ok::<(), horizon_lattice_a11y::CacheError>(())
//! ```
//!
//! [`DocumentObserver`]: crate::observer::DocumentObserver

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::config::CacheConfig;
use crate::content::ContentDescriptor;
use crate::dispatch::{poll_until, CacheEvent, Dispatcher, EventStream, ListenerId};
use crate::engine::RelationEngine;
use crate::error::{CacheError, Result};
use crate::logging::targets;
use crate::observer::{ChangeBatch, MutationSink};
use crate::registry::NodeId;
use crate::relation::RelationKind;
use crate::store::{RelationStore, Snapshot, Version};

/// A message sent to the cache worker.
enum CacheMessage {
    /// Apply a batch.
    Batch(ChangeBatch),
    /// Apply what is queued, then exit.
    Shutdown,
}

/// State shared between the cache handle, its sinks and the worker thread.
struct CacheState {
    running: AtomicBool,
    pending_batches: AtomicUsize,
}

impl CacheState {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn submit(&self, sender: &Sender<CacheMessage>, batch: ChangeBatch) -> Result<()> {
        if !self.is_running() {
            return Err(CacheError::Disconnected);
        }
        self.pending_batches.fetch_add(1, Ordering::AcqRel);
        // Blocks when the queue is full; batches are never dropped.
        if sender.send(CacheMessage::Batch(batch)).is_err() {
            self.pending_batches.fetch_sub(1, Ordering::AcqRel);
            return Err(CacheError::Disconnected);
        }
        Ok(())
    }
}

/// A cloneable handle that feeds batches into a running cache.
#[derive(Clone)]
pub struct CacheSink {
    sender: Sender<CacheMessage>,
    state: Arc<CacheState>,
}

impl MutationSink for CacheSink {
    fn deliver(&self, batch: ChangeBatch) -> Result<()> {
        self.state.submit(&self.sender, batch)
    }
}

impl std::fmt::Debug for CacheSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSink")
            .field("running", &self.state.is_running())
            .finish()
    }
}

/// An incremental accessibility relation cache for one document.
///
/// The cache is `Send + Sync`; batches may be submitted and relations
/// queried from any thread.
pub struct AccessibilityCache {
    sender: Sender<CacheMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
    state: Arc<CacheState>,
    store: Arc<RelationStore>,
    dispatcher: Arc<Dispatcher>,
    config: CacheConfig,
}

impl AccessibilityCache {
    /// Start a cache for `document` with the default configuration.
    pub fn new(document: ContentDescriptor) -> Result<Self> {
        Self::with_config(document, CacheConfig::default())
    }

    /// Start a cache for `document`.
    ///
    /// The initial accessible tree is built and committed as version 1
    /// before this returns.
    pub fn with_config(document: ContentDescriptor, config: CacheConfig) -> Result<Self> {
        let store = Arc::new(RelationStore::new(config.retained_versions));
        let dispatcher = Arc::new(Dispatcher::new());
        let engine = RelationEngine::new(document, store.clone(), dispatcher.clone(), &config)?;

        let (sender, receiver) = bounded(config.queue_capacity.max(1));
        let state = Arc::new(CacheState {
            running: AtomicBool::new(true),
            pending_batches: AtomicUsize::new(0),
        });

        let thread_state = state.clone();
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                worker_loop(engine, receiver, &thread_state);
                thread_state.running.store(false, Ordering::Release);
            })
            .map_err(CacheError::Spawn)?;

        tracing::debug!(target: targets::CACHE, thread = %config.thread_name, "started relation cache");
        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
            state,
            store,
            dispatcher,
            config,
        })
    }

    /// Queue a batch for the worker.
    ///
    /// Blocks while the queue is full. Fails with [`CacheError::Disconnected`]
    /// after shutdown.
    pub fn submit(&self, batch: ChangeBatch) -> Result<()> {
        self.state.submit(&self.sender, batch)
    }

    /// A sink for a [`DocumentObserver`](crate::observer::DocumentObserver).
    pub fn sink(&self) -> CacheSink {
        CacheSink {
            sender: self.sender.clone(),
            state: self.state.clone(),
        }
    }

    /// The snapshot store.
    pub fn store(&self) -> &Arc<RelationStore> {
        &self.store
    }

    /// The latest committed snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.store.snapshot()
    }

    /// The configuration this cache runs with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Query a relation in the latest snapshot.
    pub fn query_relation(&self, kind: RelationKind, node: NodeId) -> Result<Option<Vec<NodeId>>> {
        self.store.query(kind, node, None)
    }

    /// Open an event stream.
    pub fn subscribe(&self) -> EventStream {
        self.dispatcher.subscribe()
    }

    /// Connect a callback, invoked on the worker thread after each commit.
    pub fn connect<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.dispatcher.connect(listener)
    }

    /// Disconnect a callback.
    pub fn disconnect(&self, id: ListenerId) -> bool {
        self.dispatcher.disconnect(id)
    }

    /// Wait for `version` using the configured timeout.
    pub fn wait_for_version(&self, version: Version) -> Result<Arc<Snapshot>> {
        self.store.wait_for_version(version, self.config.wait_timeout)
    }

    /// Poll the latest snapshot until `condition` yields a value.
    ///
    /// Uses the configured timeout and poll interval.
    pub fn wait_until<T, F>(&self, mut condition: F) -> Result<T>
    where
        F: FnMut(&Snapshot) -> Option<T>,
    {
        poll_until(self.config.wait_timeout, self.config.poll_interval, || {
            condition(&self.store.snapshot())
        })
    }

    /// Wait until every submitted batch has been committed.
    pub fn wait_idle(&self) -> Result<Arc<Snapshot>> {
        self.wait_idle_timeout(self.config.wait_timeout)
    }

    /// Wait until every submitted batch has been committed, up to `timeout`.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> Result<Arc<Snapshot>> {
        poll_until(timeout, self.config.poll_interval, || {
            (self.pending_batches() == 0).then(|| self.store.snapshot())
        })
    }

    /// Number of batches queued or being applied.
    pub fn pending_batches(&self) -> usize {
        self.state.pending_batches.load(Ordering::Acquire)
    }

    /// Whether the worker accepts batches.
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Stop accepting batches. Queued batches are still applied.
    ///
    /// Non-blocking; use [`join`](Self::join) to wait for the worker.
    pub fn shutdown(&self) {
        self.state.running.store(false, Ordering::Release);
        // A full queue is fine: the worker exits once it has drained.
        let _ = self.sender.try_send(CacheMessage::Shutdown);
    }

    /// Wait for the worker thread to exit.
    ///
    /// Returns `false` if already joined or the worker panicked.
    pub fn join(&self) -> bool {
        let mut handle = self.handle.lock();
        match handle.take() {
            Some(h) => h.join().is_ok(),
            None => false,
        }
    }

    /// Shut down and wait for the worker.
    pub fn shutdown_and_join(&self) -> bool {
        self.shutdown();
        self.join()
    }
}

impl MutationSink for AccessibilityCache {
    fn deliver(&self, batch: ChangeBatch) -> Result<()> {
        self.submit(batch)
    }
}

impl Drop for AccessibilityCache {
    fn drop(&mut self) {
        // Don't block in drop.
        self.shutdown();
    }
}

impl std::fmt::Debug for AccessibilityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessibilityCache")
            .field("running", &self.is_running())
            .field("pending_batches", &self.pending_batches())
            .field("version", &self.store.version())
            .finish()
    }
}

static_assertions::assert_impl_all!(AccessibilityCache: Send, Sync);
static_assertions::assert_impl_all!(CacheSink: Send, Sync);

fn apply(engine: &mut RelationEngine, batch: ChangeBatch, state: &CacheState) {
    let cycle = batch.cycle;
    if let Err(err) = engine.apply_batch(batch) {
        tracing::error!(target: targets::CACHE, cycle, %err, "failed to apply batch");
    }
    state.pending_batches.fetch_sub(1, Ordering::AcqRel);
}

/// The worker loop applying batches in arrival order.
fn worker_loop(mut engine: RelationEngine, receiver: Receiver<CacheMessage>, state: &CacheState) {
    loop {
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(CacheMessage::Batch(batch)) => apply(&mut engine, batch, state),
            Ok(CacheMessage::Shutdown) => {
                // Apply what was queued before exiting
                while let Ok(message) = receiver.try_recv() {
                    if let CacheMessage::Batch(batch) = message {
                        apply(&mut engine, batch, state);
                    }
                }
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if !state.is_running() && state.pending_batches.load(Ordering::Acquire) == 0 {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!(target: targets::CACHE, version = %engine.store().version(), "relation cache worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentHandle;
    use crate::observer::{ChangeEvent, DocumentObserver};

    fn h(n: u64) -> ContentHandle {
        ContentHandle(n)
    }

    fn document() -> ContentDescriptor {
        ContentDescriptor::document(h(1))
            .with_child(ContentDescriptor::element(h(2), "input").with_attr("id", "i"))
    }

    fn insert_label(cycle: u64, handle: u64) -> ChangeBatch {
        ChangeBatch {
            cycle,
            events: vec![ChangeEvent::Inserted {
                parent: h(1),
                index: 0,
                subtree: ContentDescriptor::element(h(handle), "label").with_attr("for", "i"),
            }],
        }
    }

    #[test]
    fn test_cache_creation() {
        let cache = AccessibilityCache::new(document()).unwrap();
        assert!(cache.is_running());
        assert_eq!(cache.pending_batches(), 0);
        assert_eq!(cache.snapshot().version().value(), 1);
        assert_eq!(cache.snapshot().len(), 2);
        assert!(cache.shutdown_and_join());
    }

    #[test]
    fn test_submit_and_wait() {
        let cache = AccessibilityCache::new(document()).unwrap();
        cache.submit(insert_label(1, 3)).unwrap();
        let snapshot = cache.wait_for_version(Version::INITIAL.next().next()).unwrap();
        let input = snapshot.node_for_content(h(2)).unwrap();
        let label = snapshot.node_for_content(h(3)).unwrap();
        assert_eq!(cache.query_relation(RelationKind::LabelledBy, input).unwrap(), Some(vec![label]));
        cache.shutdown_and_join();
    }

    #[test]
    fn test_observer_flush_through_sink() {
        let cache = AccessibilityCache::new(document()).unwrap();
        let observer = DocumentObserver::new();
        observer.on_subtree_inserted(
            h(1),
            ContentDescriptor::element(h(3), "label").with_attr("for", "i"),
            0,
        );
        assert!(observer.flush(&cache.sink()).unwrap());
        let snapshot = cache.wait_idle().unwrap();
        assert!(snapshot.node_for_content(h(3)).is_some());
        cache.shutdown_and_join();
    }

    #[test]
    fn test_graceful_shutdown_drains_queue() {
        let cache = AccessibilityCache::new(document()).unwrap();
        for cycle in 1..=5 {
            cache.submit(insert_label(cycle, 10 + cycle)).unwrap();
        }
        cache.shutdown();
        assert!(cache.join());
        assert_eq!(cache.pending_batches(), 0);
        assert_eq!(cache.snapshot().version().value(), 6);
    }

    #[test]
    fn test_submit_after_shutdown() {
        let cache = AccessibilityCache::new(document()).unwrap();
        cache.shutdown_and_join();
        assert!(!cache.is_running());
        assert!(matches!(cache.submit(insert_label(1, 3)), Err(CacheError::Disconnected)));
        assert!(!cache.join());
    }

    #[test]
    fn test_wait_until_times_out() {
        let config = crate::config::CacheBuilder::new()
            .wait_timeout(Duration::from_millis(30))
            .into_config();
        let cache = AccessibilityCache::with_config(document(), config).unwrap();
        let result = cache.wait_until(|snapshot| snapshot.node_for_content(h(99)));
        assert!(result.unwrap_err().is_timeout());
        cache.shutdown_and_join();
    }

    #[test]
    fn test_listener_called_on_worker() {
        let cache = AccessibilityCache::new(document()).unwrap();
        let shown = Arc::new(AtomicUsize::new(0));
        let counter = shown.clone();
        let id = cache.connect(move |event| {
            if event.is_show() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        cache.submit(insert_label(1, 3)).unwrap();
        cache.wait_idle().unwrap();
        assert_eq!(shown.load(Ordering::SeqCst), 1);
        assert!(cache.disconnect(id));
        cache.shutdown_and_join();
    }
}
