//! Configuration for the relation cache service.

use std::time::Duration;

use crate::cache::AccessibilityCache;
use crate::content::ContentDescriptor;
use crate::error::Result;

/// Default name for the cache worker thread.
pub const DEFAULT_THREAD_NAME: &str = "a11y-relation-cache";

/// Default capacity of the mutation batch queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default number of versions retained for `as_of` queries.
pub const DEFAULT_RETAINED_VERSIONS: usize = 8;

/// Default bound for waits on commits and notifications.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default poll granularity for poll-until waits.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for an [`AccessibilityCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Name for the worker thread.
    pub thread_name: String,
    /// Capacity of the batch queue between the observer and the engine.
    pub queue_capacity: usize,
    /// Number of committed versions kept for `as_of` queries. At least one.
    pub retained_versions: usize,
    /// Bound used by waits that take no explicit timeout.
    pub wait_timeout: Duration,
    /// Granularity of poll-until waits.
    pub poll_interval: Duration,
    /// Check snapshot invariants on every commit.
    pub verify_invariants: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retained_versions: DEFAULT_RETAINED_VERSIONS,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            verify_invariants: cfg!(debug_assertions),
        }
    }
}

impl CacheConfig {
    /// Create a new configuration with the given thread name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            thread_name: name.into(),
            ..Default::default()
        }
    }
}

/// Builder for creating caches with custom configuration.
#[derive(Debug, Default)]
pub struct CacheBuilder {
    config: CacheConfig,
}

impl CacheBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker thread name.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Set the batch queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity.max(1);
        self
    }

    /// Set the number of retained versions.
    pub fn retained_versions(mut self, count: usize) -> Self {
        self.config.retained_versions = count.max(1);
        self
    }

    /// Set the default wait bound.
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_timeout = timeout;
        self
    }

    /// Set the poll granularity.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Enable or disable per-commit invariant checks.
    pub fn verify_invariants(mut self, enabled: bool) -> Self {
        self.config.verify_invariants = enabled;
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Build the configuration without starting a cache.
    pub fn into_config(self) -> CacheConfig {
        self.config
    }

    /// Build and start the cache for `document`.
    pub fn build(self, document: ContentDescriptor) -> Result<AccessibilityCache> {
        AccessibilityCache::with_config(document, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.thread_name, DEFAULT_THREAD_NAME);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.retained_versions, 8);
        assert_eq!(config.wait_timeout, Duration::from_secs(5));
        assert_eq!(config.verify_invariants, cfg!(debug_assertions));
    }

    #[test]
    fn test_builder_clamps() {
        let config = CacheBuilder::new()
            .thread_name("doc-1")
            .retained_versions(0)
            .queue_capacity(0)
            .poll_interval(Duration::from_millis(1))
            .verify_invariants(true)
            .into_config();
        assert_eq!(config.thread_name, "doc-1");
        assert_eq!(config.retained_versions, 1);
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.poll_interval, Duration::from_millis(1));
        assert!(config.verify_invariants);
    }

    #[test]
    fn test_with_name() {
        let config = CacheConfig::with_name("frame");
        assert_eq!(config.thread_name, "frame");
        assert_eq!(config.retained_versions, DEFAULT_RETAINED_VERSIONS);
    }
}
