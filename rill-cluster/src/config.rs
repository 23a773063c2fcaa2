//! Clustering configuration.

use std::time::Duration;

/// Configuration for replication and cluster coordination.
#[derive(Debug, Clone)]
pub struct ClusteringConfig {
    /// How far behind (in time) a follower may fall before it is removed
    /// from the ISR. Also bounds how long a follower may go without
    /// fetching at all.
    pub replica_max_lag_time: Duration,
    /// How long the metadata leader holds partition-leader failure
    /// witnesses before dropping the witness set.
    pub replica_max_leader_timeout: Duration,
    /// How often the leader checks followers for lag and idleness.
    pub replica_max_idle_wait: Duration,
    /// How long the leader parks a replication long-poll with no data. The
    /// follower's request deadline is twice this.
    pub replica_fetch_timeout: Duration,
    /// Maximum age of the cached broker list served from metadata fetches.
    pub metadata_cache_max_age: Duration,
    /// Minimum in-sync replicas for a partition to accept publishes.
    pub min_isr: usize,
    /// Deadline for forwarding requests to the metadata leader and for
    /// cluster surveys.
    pub propagate_timeout: Duration,
    /// Upper bound on the bytes returned by one replication fetch.
    pub fetch_max_bytes: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            replica_max_lag_time: Duration::from_secs(15),
            replica_max_leader_timeout: Duration::from_secs(15),
            replica_max_idle_wait: Duration::from_secs(10),
            replica_fetch_timeout: Duration::from_secs(3),
            metadata_cache_max_age: Duration::from_secs(120),
            min_isr: 1,
            propagate_timeout: Duration::from_secs(5),
            fetch_max_bytes: 1024 * 1024,
        }
    }
}

impl ClusteringConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration with short timeouts suitable for tests.
    #[must_use]
    pub fn fast_for_testing() -> Self {
        Self {
            replica_max_lag_time: Duration::from_millis(500),
            replica_max_leader_timeout: Duration::from_millis(500),
            replica_max_idle_wait: Duration::from_millis(100),
            replica_fetch_timeout: Duration::from_millis(100),
            metadata_cache_max_age: Duration::from_millis(500),
            min_isr: 1,
            propagate_timeout: Duration::from_secs(2),
            fetch_max_bytes: 64 * 1024,
        }
    }
}
