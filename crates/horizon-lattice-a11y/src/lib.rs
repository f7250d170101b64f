//! Incremental accessibility relation cache for Horizon Lattice.
//!
//! This crate mirrors a live, mutable document tree into a tree of accessible
//! nodes and keeps the relations between them up to date while the document
//! changes:
//!
//! - **Labels**: `labelled_by` / `label_for`, from `aria-labelledby`,
//!   `<label>` and `<figcaption>`
//! - **Groups**: `member_of`, for native and ARIA radio groups
//! - **Details**: `details` / `details_for`, from `aria-details` and popover
//!   invokers
//! - **Links**: `links_to`, from in-document `href` fragments
//!
//! Changes arrive as raw notifications on a [`DocumentObserver`], are
//! normalized into one [`ChangeBatch`] per update cycle and applied by a
//! [`RelationEngine`] on the cache worker thread. Every batch commits one
//! immutable [`Snapshot`]: relation pairs are always symmetric and never
//! reference a node missing from the snapshot. After each commit the
//! [`Dispatcher`] emits ordered hide, show, reorder and relations-changed
//! events.
//!
//! # Example
//!
//! ```no_run
//! use horizon_lattice_a11y::{
//!     AccessibilityCache, ContentDescriptor, ContentHandle, DocumentObserver, RelationKind,
//! };
//! use std::time::Duration;
//!
//! let document = ContentDescriptor::document(ContentHandle(1)).with_children([
//!     ContentDescriptor::element(ContentHandle(2), "input")
//!         .with_attr("type", "radio")
//!         .with_attr("name", "color"),
//!     ContentDescriptor::element(ContentHandle(3), "input")
//!         .with_attr("type", "radio")
//!         .with_attr("name", "color"),
//! ]);
//!
//! let cache = AccessibilityCache::new(document)?;
//! let events = cache.subscribe();
//! let observer = DocumentObserver::new();
//!
//! // Rename the second radio out of the group.
//! observer.on_attribute_changed(ContentHandle(3), "name", Some("color"), Some("size"));
//! observer.flush(&cache.sink())?;
//!
//! let event = events.wait_for(|e| e.changes_relation(RelationKind::MemberOf), Duration::from_secs(1))?;
//! println!("{:?}", cache.query_relation(RelationKind::MemberOf, event.node())?);
//!
//! cache.shutdown_and_join();
//! # Ok::<(), horizon_lattice_a11y::CacheError>(())
//! ```

pub mod cache;
pub mod config;
pub mod content;
pub mod dispatch;
pub mod engine;
mod error;
pub mod logging;
pub mod observer;
pub mod registry;
pub mod relation;
pub mod role;
pub mod store;

pub use cache::{AccessibilityCache, CacheSink};
pub use config::{CacheBuilder, CacheConfig};
pub use content::{AttributeMap, ContentDescriptor, ContentHandle, ContentKind, ContentTree, Scope};
pub use dispatch::{poll_until, CacheEvent, CacheEventKind, Dispatcher, EventStream, ListenerId};
pub use engine::{RelationEngine, ReconcileStats};
pub use error::{CacheError, Result};
pub use logging::{AccessibleTreeDebug, TreeFormatOptions, TreeStyle};
pub use observer::{
    normalize, ChangeBatch, ChangeEvent, DocumentObserver, MutationSink, RawMutation,
    POPOVER_TARGET_PROPERTY,
};
pub use registry::{AccessibleNode, Lifecycle, NodeId, NodeRegistry, NodeSeed};
pub use relation::{KindSet, RelationKind, UnknownRelationKind};
pub use role::AccessibleRole;
pub use store::{EdgeMap, InvariantViolation, NodeInfo, RelationStore, Snapshot, Version};
