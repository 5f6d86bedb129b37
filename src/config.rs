//! Configuration types for the session grid.

use std::time::Duration;

/// Number of segments in the consistent-hash space.
pub const DEFAULT_SEGMENTS: usize = 256;

/// Main configuration for session management over a grid cache.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Default maximum inactive interval for new sessions.
    ///
    /// `None` means sessions never expire unless an interval is set
    /// explicitly.
    pub default_max_inactive: Option<Duration>,

    /// Whether the cache mode moves data on membership change.
    ///
    /// Distributed and replicated modes require full state transfer;
    /// invalidation modes do not and derive ownership differently. The
    /// coordinator consults this flag instead of inferring the mode.
    pub requires_state_transfer: bool,

    /// Number of segments in the hash space.
    pub segments: usize,

    /// Key-affinity generator tunables.
    pub affinity: AffinityConfig,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            default_max_inactive: Some(Duration::from_secs(30 * 60)),
            requires_state_transfer: true,
            segments: DEFAULT_SEGMENTS,
            affinity: AffinityConfig::default(),
        }
    }
}

impl SessionManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default maximum inactive interval.
    pub fn with_default_max_inactive(mut self, interval: Option<Duration>) -> Self {
        self.default_max_inactive = interval;
        self
    }

    /// Set whether the cache mode requires full state transfer.
    pub fn with_state_transfer(mut self, requires: bool) -> Self {
        self.requires_state_transfer = requires;
        self
    }

    /// Set the number of hash segments.
    pub fn with_segments(mut self, segments: usize) -> Self {
        self.segments = segments.max(1);
        self
    }

    /// Set the affinity configuration.
    pub fn with_affinity(mut self, affinity: AffinityConfig) -> Self {
        self.affinity = affinity;
        self
    }
}

/// Tunables for the key-affinity generator.
#[derive(Debug, Clone)]
pub struct AffinityConfig {
    /// Capacity of each per-member key queue.
    pub buffer_size: usize,

    /// How long a consumer waits for a key before re-checking the queue map.
    pub poll_interval: Duration,

    /// How long the producer waits on its start latch before re-checking for
    /// shutdown.
    pub latch_timeout: Duration,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            buffer_size: 10,
            poll_interval: Duration::from_millis(50),
            latch_timeout: Duration::from_secs(10),
        }
    }
}

impl AffinityConfig {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            ..Default::default()
        }
    }

    /// Set the consumer poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the producer latch timeout.
    pub fn with_latch_timeout(mut self, timeout: Duration) -> Self {
        self.latch_timeout = timeout;
        self
    }
}
