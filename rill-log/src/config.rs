//! Commit log configuration.

use std::time::Duration;

/// Configuration for a commit log.
///
/// A zero duration or zero size disables the corresponding limit.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Maximum bytes a segment can contain before a new one is rolled.
    pub max_segment_bytes: u64,
    /// Maximum time before a new segment is rolled regardless of size.
    pub max_segment_age: Duration,
    /// Retention by total log bytes.
    pub max_log_bytes: u64,
    /// Retention by total message count.
    pub max_log_messages: u64,
    /// Retention by age of a segment's youngest record.
    pub max_log_age: Duration,
    /// Run key-based compaction on clean.
    pub compact: bool,
    /// Maximum worker threads used by a compaction pass.
    pub compact_max_threads: usize,
    /// Frequency at which the retention/compaction policy is enforced.
    pub cleaner_interval: Duration,
    /// Frequency at which the high watermark is checkpointed to disk.
    pub hw_checkpoint_interval: Duration,
    /// Enable optimistic concurrency control on appends.
    pub concurrency_control: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: 1024 * 1024 * 1024,
            max_segment_age: Duration::ZERO,
            max_log_bytes: 0,
            max_log_messages: 0,
            max_log_age: Duration::ZERO,
            compact: false,
            compact_max_threads: 10,
            cleaner_interval: Duration::from_secs(5 * 60),
            hw_checkpoint_interval: Duration::from_secs(5),
            concurrency_control: false,
        }
    }
}

impl LogConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the segment roll threshold in bytes.
    #[must_use]
    pub const fn with_max_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_segment_bytes = bytes;
        self
    }

    /// Sets the time-based segment roll threshold.
    #[must_use]
    pub const fn with_max_segment_age(mut self, age: Duration) -> Self {
        self.max_segment_age = age;
        self
    }

    /// Sets retention by total bytes.
    #[must_use]
    pub const fn with_max_log_bytes(mut self, bytes: u64) -> Self {
        self.max_log_bytes = bytes;
        self
    }

    /// Sets retention by message count.
    #[must_use]
    pub const fn with_max_log_messages(mut self, messages: u64) -> Self {
        self.max_log_messages = messages;
        self
    }

    /// Sets retention by age.
    #[must_use]
    pub const fn with_max_log_age(mut self, age: Duration) -> Self {
        self.max_log_age = age;
        self
    }

    /// Enables key-based compaction.
    #[must_use]
    pub const fn with_compaction(mut self, compact: bool) -> Self {
        self.compact = compact;
        self
    }

    /// Sets the cleaner interval.
    #[must_use]
    pub const fn with_cleaner_interval(mut self, interval: Duration) -> Self {
        self.cleaner_interval = interval;
        self
    }

    /// Sets the high watermark checkpoint interval.
    #[must_use]
    pub const fn with_hw_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.hw_checkpoint_interval = interval;
        self
    }

    /// Enables optimistic concurrency control on appends.
    #[must_use]
    pub const fn with_concurrency_control(mut self, enabled: bool) -> Self {
        self.concurrency_control = enabled;
        self
    }
}
