//! Error types for the relation cache.

use std::time::Duration;

use crate::content::ContentHandle;
use crate::registry::NodeId;
use crate::store::Version;

/// Result type alias for relation cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by the relation cache.
///
/// An id reference that points nowhere yields an absent relation and has no
/// variant here.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The accessible node is not live in the queried snapshot.
    #[error("Unknown or retired accessible node {0:?}")]
    UnknownNode(NodeId),

    /// The content handle is not part of the mirrored document.
    #[error("Unknown content node {0:?}")]
    UnknownContent(ContentHandle),

    /// A content handle was registered while still mapped to a live node.
    #[error("Content {content:?} is already exposed as live node {existing:?}")]
    DuplicateIdentity {
        content: ContentHandle,
        existing: NodeId,
    },

    /// Attempted to move a node under itself or one of its descendants.
    #[error("Cannot move an accessible node under itself or a descendant")]
    CircularParentage,

    /// The requested version is no longer retained by the store.
    #[error("Version {requested:?} unavailable (retained {oldest:?}..={latest:?})")]
    VersionUnavailable {
        requested: Version,
        oldest: Version,
        latest: Version,
    },

    /// A bounded wait for a commit or notification expired.
    #[error("Timed out after {waited:?} waiting for the relation cache")]
    TimeoutWaitingForCommit { waited: Duration },

    /// The cache worker has shut down.
    #[error("The relation cache worker is no longer running")]
    Disconnected,

    /// The cache worker thread could not be started.
    #[error("Failed to spawn relation cache worker: {0}")]
    Spawn(#[source] std::io::Error),
}

impl CacheError {
    /// Create a timeout error for the given wait duration.
    pub fn timeout(waited: Duration) -> Self {
        Self::TimeoutWaitingForCommit { waited }
    }

    /// Create a duplicate identity error.
    pub fn duplicate(content: ContentHandle, existing: NodeId) -> Self {
        Self::DuplicateIdentity { content, existing }
    }

    /// Whether this error is a wait expiry rather than a structural failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutWaitingForCommit { .. })
    }
}
