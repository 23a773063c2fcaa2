//! Follower-side replication.
//!
//! A [`Fetcher`] runs on each follower replica of a partition. It starts in
//! the truncating state: it asks the leader where the follower's latest
//! leader epoch ends and truncates its log to that boundary, so no
//! divergent prefix survives a leader change. It then long-polls the leader
//! for records at its log end offset, ingesting raw message sets and
//! adopting the leader-reported high watermark clamped to the local log
//! end.
//!
//! Repeated fetch failures make the follower report the leader to the
//! metadata plane; a quorum of such witnesses triggers a new election.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use rill_core::{BrokerId, LeaderEpoch, PartitionId};
use rill_log::CommitLog;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::bus::Subscription;
use crate::config::ClusteringConfig;
use crate::error::ClusterResult;
use crate::partition::Partition;
use crate::rpc::{
    leader_epoch_offset_subject, notification_subject, replication_subject,
    LeaderEpochOffsetRequest, LeaderEpochOffsetResponse, ReplicationRequest, ReplicationResponse,
};
use crate::MessageBus;

/// Backoff between fetch attempts after a failure.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Pulls records from the partition leader on a follower replica.
pub(crate) struct Fetcher {
    partition: Weak<Partition>,
    log: Arc<CommitLog>,
    bus: Arc<dyn MessageBus>,
    config: ClusteringConfig,
    broker: BrokerId,
    stream: String,
    id: PartitionId,
    leader: BrokerId,
    leader_epoch: LeaderEpoch,
}

/// Handle owning the fetcher task.
pub(crate) struct FetcherHandle {
    closed: watch::Sender<bool>,
}

impl FetcherHandle {
    /// Signals the fetch loop to stop; any in-flight fetch is abandoned at
    /// its next await point.
    pub(crate) fn stop(&self) {
        let _ = self.closed.send(true);
    }
}

impl Fetcher {
    /// Starts the fetch loop targeting `leader`.
    pub(crate) async fn start(
        partition: &Arc<Partition>,
        leader: BrokerId,
        leader_epoch: LeaderEpoch,
    ) -> ClusterResult<FetcherHandle> {
        let stream = partition.stream().to_string();
        let id = partition.id();
        let bus = partition.bus().clone();
        let notifications = bus
            .subscribe(&notification_subject(partition.broker(), &stream, id))
            .await?;

        let fetcher = Self {
            partition: Arc::downgrade(partition),
            log: partition.log().clone(),
            bus,
            config: partition.clustering().clone(),
            broker: partition.broker(),
            stream,
            id,
            leader,
            leader_epoch,
        };

        let (closed, closed_rx) = watch::channel(false);
        tokio::spawn(fetcher.run(notifications, closed_rx));
        Ok(FetcherHandle { closed })
    }

    async fn run(self, mut notifications: Subscription, mut closed: watch::Receiver<bool>) {
        if !self.truncate_to_leader_epoch(&mut closed).await {
            return;
        }

        let mut failing_since: Option<Instant> = None;
        loop {
            if *closed.borrow() {
                return;
            }
            match self.fetch_once().await {
                Ok(()) => {
                    failing_since = None;
                }
                Err(e) => {
                    debug!(
                        stream = %self.stream, partition = %self.id, error = %e,
                        "replica fetch failed"
                    );
                    let since = *failing_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > self.config.replica_fetch_timeout {
                        self.report_leader().await;
                    }
                    // Back off, but wake early on a data hint or shutdown.
                    tokio::select! {
                        () = tokio::time::sleep(RETRY_BACKOFF) => {}
                        _ = notifications.recv() => {}
                        _ = closed.changed() => return,
                    }
                }
            }
        }
    }

    /// Truncating state: find the last common epoch boundary with the
    /// leader and drop everything past it, then clamp the HW to the log
    /// end. Retries until the leader answers or the fetcher stops.
    async fn truncate_to_leader_epoch(&self, closed: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *closed.borrow() {
                return false;
            }
            let request = LeaderEpochOffsetRequest {
                leader_epoch: self.log.last_leader_epoch(),
            };
            let result = self
                .bus
                .request(
                    &leader_epoch_offset_subject(&self.stream, self.id),
                    request.encode(),
                    self.config.propagate_timeout,
                )
                .await
                .and_then(LeaderEpochOffsetResponse::decode);

            match result {
                Ok(response) => {
                    let end = response.end_offset;
                    if !end.is_none() && end < self.log.log_end_offset() {
                        warn!(
                            stream = %self.stream, partition = %self.id, end = %end,
                            "truncating to leader epoch boundary"
                        );
                        if let Err(e) = self.log.truncate(end) {
                            warn!(error = %e, "failed to truncate to epoch boundary");
                        }
                    }
                    let newest = self.log.newest_offset();
                    if self.log.high_watermark() > newest {
                        self.log.override_high_watermark(newest);
                    }
                    return true;
                }
                Err(e) => {
                    debug!(
                        stream = %self.stream, partition = %self.id, error = %e,
                        "epoch boundary query failed, retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(RETRY_BACKOFF) => {}
                        _ = closed.changed() => return false,
                    }
                }
            }
        }
    }

    /// One long-poll fetch: request records at the local log end, ingest
    /// the raw frames and adopt the leader's HW clamped to the local log
    /// end.
    async fn fetch_once(&self) -> ClusterResult<()> {
        let offset = self.log.log_end_offset();
        let request = ReplicationRequest {
            replica: self.broker,
            offset,
            leader_epoch: self.log.last_leader_epoch(),
        };
        // The leader parks empty polls for up to replica_fetch_timeout, so
        // give the request twice that before calling it failed.
        let response = self
            .bus
            .request(
                &replication_subject(&self.stream, self.id),
                request.encode(),
                self.config.replica_fetch_timeout * 2,
            )
            .await
            .and_then(ReplicationResponse::decode)?;

        if !response.ok {
            return Err(crate::error::ClusterError::NotLeader);
        }
        if !response.data.is_empty() {
            self.log.append_message_set(&response.data)?;
        }
        if !response.hw.is_none() {
            let newest = self.log.newest_offset();
            self.log.set_high_watermark(response.hw.min(newest));
        }
        Ok(())
    }

    /// Witnesses the leader as unresponsive to the metadata plane.
    async fn report_leader(&self) {
        let Some(partition) = self.partition.upgrade() else {
            return;
        };
        if let Err(e) = partition
            .reporter()
            .report_leader(
                &self.stream,
                self.id,
                self.broker,
                self.leader,
                self.leader_epoch,
            )
            .await
        {
            debug!(
                stream = %self.stream, partition = %self.id, error = %e,
                "failed to report leader"
            );
        }
    }
}
