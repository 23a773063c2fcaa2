//! Partition state machine.
//!
//! A partition binds one commit log to a replication role: on the leader a
//! set of per-follower replicators served by the replication server, on a
//! follower a single fetcher pulling from the current leader. Role
//! transitions are driven by metadata operations applied through consensus;
//! only a strictly larger epoch may mutate the leader or ISR (the
//! idempotency fence).

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rill_core::{BrokerId, LeaderEpoch, Offset, PartitionId, Record, Timestamp, WaiterId};
use rill_log::{CommitLog, LogConfig};
use tracing::info;

use crate::config::ClusteringConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::fetcher::FetcherHandle;
use crate::replicator::ReplicationServerHandle;
use crate::MessageBus;

static NEXT_WAITER: AtomicU64 = AtomicU64::new(1);

/// Returns a process-unique waiter identity for log waiter registration.
pub(crate) fn next_waiter_id() -> WaiterId {
    WaiterId::new(NEXT_WAITER.fetch_add(1, Ordering::Relaxed))
}

/// Path the metadata plane uses to request ISR changes and report leader
/// failures. Implemented by the metadata plane; calls are forwarded to the
/// metadata leader when this broker is not it.
#[async_trait]
pub trait IsrReporter: Send + Sync + 'static {
    /// Asks to remove `replica` from the partition's ISR.
    async fn shrink_isr(
        &self,
        stream: &str,
        partition: PartitionId,
        replica: BrokerId,
        leader: BrokerId,
        leader_epoch: LeaderEpoch,
    ) -> ClusterResult<()>;

    /// Asks to add `replica` back to the partition's ISR.
    async fn expand_isr(
        &self,
        stream: &str,
        partition: PartitionId,
        replica: BrokerId,
        leader: BrokerId,
        leader_epoch: LeaderEpoch,
    ) -> ClusterResult<()>;

    /// Reports the partition leader as unresponsive, witnessed by
    /// `observer`.
    async fn report_leader(
        &self,
        stream: &str,
        partition: PartitionId,
        observer: BrokerId,
        leader: BrokerId,
        leader_epoch: LeaderEpoch,
    ) -> ClusterResult<()>;
}

/// Replication role of a partition on this broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Stopped: no replication activity, log closed to producers.
    Paused,
    /// Accepting producer appends and driving replication.
    Leader,
    /// Pulling records from the current leader.
    Follower,
}

/// Ack policy for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Ack once the leader has appended.
    Leader,
    /// Ack once the high watermark covers the batch (all ISR replicated).
    All,
}

/// First/latest pair for partition lifecycle events.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventTimestamps {
    /// First time the event happened.
    pub first: Option<Timestamp>,
    /// Latest time the event happened.
    pub latest: Option<Timestamp>,
}

impl EventTimestamps {
    fn update(&mut self) {
        let now = Timestamp::now();
        if self.first.is_none() {
            self.first = Some(now);
        }
        self.latest = Some(now);
    }
}

/// Static identity and configuration of a partition replica.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Stream the partition belongs to.
    pub stream: String,
    /// Partition ID within the stream.
    pub id: PartitionId,
    /// This broker.
    pub broker: BrokerId,
    /// All replicas of the partition.
    pub replicas: Vec<BrokerId>,
    /// Initial in-sync replica set.
    pub isr: Vec<BrokerId>,
    /// Initial leader, if known.
    pub leader: Option<BrokerId>,
    /// Initial leader epoch.
    pub leader_epoch: LeaderEpoch,
    /// Initial metadata epoch fence.
    pub epoch: u64,
    /// Directory for the partition's commit log.
    pub data_dir: PathBuf,
    /// Clustering timeouts.
    pub clustering: ClusteringConfig,
    /// Commit log configuration.
    pub log: LogConfig,
}

/// Point-in-time snapshot of partition state.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    /// Stream name.
    pub stream: String,
    /// Partition ID.
    pub id: PartitionId,
    /// Current leader.
    pub leader: Option<BrokerId>,
    /// Current leader epoch.
    pub leader_epoch: LeaderEpoch,
    /// Metadata epoch fence.
    pub epoch: u64,
    /// All replicas.
    pub replicas: Vec<BrokerId>,
    /// In-sync replicas.
    pub isr: Vec<BrokerId>,
    /// Whether the partition is paused.
    pub paused: bool,
    /// Whether the partition rejects producer appends.
    pub readonly: bool,
    /// High watermark.
    pub high_watermark: Offset,
    /// Newest offset in the log.
    pub newest_offset: Offset,
}

struct PartitionState {
    role: Role,
    replicas: Vec<BrokerId>,
    isr: BTreeSet<BrokerId>,
    leader: Option<BrokerId>,
    leader_epoch: LeaderEpoch,
    epoch: u64,
    paused: bool,
    readonly: bool,
    replication: Option<ReplicationServerHandle>,
    fetcher: Option<FetcherHandle>,
}

/// One replica of one stream partition on this broker.
pub struct Partition {
    stream: String,
    id: PartitionId,
    broker: BrokerId,
    clustering: ClusteringConfig,
    log: Arc<CommitLog>,
    bus: Arc<dyn MessageBus>,
    reporter: Arc<dyn IsrReporter>,
    state: Mutex<PartitionState>,
    pause_timestamps: Mutex<EventTimestamps>,
    readonly_timestamps: Mutex<EventTimestamps>,
    messages_received: Mutex<EventTimestamps>,
}

impl Partition {
    /// Opens (or recovers) the partition's log and creates the partition in
    /// the [`Role::Paused`] role. [`Partition::set_leader`] starts the
    /// leader or follower loop.
    pub fn open(
        config: PartitionConfig,
        bus: Arc<dyn MessageBus>,
        reporter: Arc<dyn IsrReporter>,
    ) -> ClusterResult<Arc<Self>> {
        let log = CommitLog::open(&config.data_dir, config.log.clone())?;
        Ok(Arc::new(Self {
            stream: config.stream,
            id: config.id,
            broker: config.broker,
            clustering: config.clustering,
            log,
            bus,
            reporter,
            state: Mutex::new(PartitionState {
                role: Role::Paused,
                replicas: config.replicas,
                isr: config.isr.into_iter().collect(),
                leader: config.leader,
                leader_epoch: config.leader_epoch,
                epoch: config.epoch,
                paused: false,
                readonly: false,
                replication: None,
                fetcher: None,
            }),
            pause_timestamps: Mutex::new(EventTimestamps::default()),
            readonly_timestamps: Mutex::new(EventTimestamps::default()),
            messages_received: Mutex::new(EventTimestamps::default()),
        }))
    }

    /// Returns the stream name.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Returns the partition ID.
    #[must_use]
    pub const fn id(&self) -> PartitionId {
        self.id
    }

    /// Returns this broker's ID.
    #[must_use]
    pub const fn broker(&self) -> BrokerId {
        self.broker
    }

    /// Returns the partition's commit log.
    #[must_use]
    pub fn log(&self) -> &Arc<CommitLog> {
        &self.log
    }

    /// Returns the clustering configuration.
    #[must_use]
    pub const fn clustering(&self) -> &ClusteringConfig {
        &self.clustering
    }

    /// Returns this broker's current role for the partition.
    #[must_use]
    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    /// Returns true if this broker leads the partition.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Returns the current leader and leader epoch.
    #[must_use]
    pub fn leader(&self) -> (Option<BrokerId>, LeaderEpoch) {
        let state = self.state.lock();
        (state.leader, state.leader_epoch)
    }

    /// Returns the in-sync replica set.
    #[must_use]
    pub fn isr(&self) -> Vec<BrokerId> {
        self.state.lock().isr.iter().copied().collect()
    }

    /// Returns the ISR size.
    #[must_use]
    pub fn isr_size(&self) -> usize {
        self.state.lock().isr.len()
    }

    /// Returns true if `replica` is in the ISR.
    #[must_use]
    pub fn in_isr(&self, replica: BrokerId) -> bool {
        self.state.lock().isr.contains(&replica)
    }

    /// Returns all replicas.
    #[must_use]
    pub fn replicas(&self) -> Vec<BrokerId> {
        self.state.lock().replicas.clone()
    }

    /// Returns the metadata epoch fence.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Sets the metadata epoch fence.
    pub fn set_epoch(&self, epoch: u64) {
        self.state.lock().epoch = epoch;
    }

    /// Returns true if the partition is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Returns a snapshot of the partition state.
    #[must_use]
    pub fn info(&self) -> PartitionInfo {
        let state = self.state.lock();
        PartitionInfo {
            stream: self.stream.clone(),
            id: self.id,
            leader: state.leader,
            leader_epoch: state.leader_epoch,
            epoch: state.epoch,
            replicas: state.replicas.clone(),
            isr: state.isr.iter().copied().collect(),
            paused: state.paused,
            readonly: state.readonly,
            high_watermark: self.log.high_watermark(),
            newest_offset: self.log.newest_offset(),
        }
    }

    /// Adds `replica` to the ISR. The leader recomputes the HW since the
    /// commit constraint tightened.
    pub fn add_to_isr(&self, replica: BrokerId) {
        let mut state = self.state.lock();
        state.isr.insert(replica);
        info!(
            stream = %self.stream, partition = %self.id, replica = %replica,
            "expanded ISR to {}", state.isr.len()
        );
    }

    /// Removes `replica` from the ISR and, on the leader, recomputes the HW
    /// so publishes blocked on the departed replica can commit.
    pub fn remove_from_isr(&self, replica: BrokerId) {
        let mut state = self.state.lock();
        state.isr.remove(&replica);
        info!(
            stream = %self.stream, partition = %self.id, replica = %replica,
            "shrank ISR to {}", state.isr.len()
        );
        if let Some(replication) = &state.replication {
            replication.recompute_hw();
        }
    }

    /// Applies a leader change for the partition.
    ///
    /// Becoming leader stops the fetcher, records the new leader epoch in
    /// the log at the current log end offset, and starts the replication
    /// server. Becoming follower stops the replication server and starts a
    /// fetcher, which begins in its truncating state.
    pub async fn set_leader(
        self: &Arc<Self>,
        leader: BrokerId,
        leader_epoch: LeaderEpoch,
    ) -> ClusterResult<()> {
        let (old_replication, old_fetcher) = {
            let mut state = self.state.lock();
            state.leader = Some(leader);
            state.leader_epoch = leader_epoch;
            (state.replication.take(), state.fetcher.take())
        };
        if let Some(replication) = old_replication {
            replication.stop();
        }
        if let Some(fetcher) = old_fetcher {
            fetcher.stop();
        }

        if leader == self.broker {
            info!(
                stream = %self.stream, partition = %self.id, epoch = leader_epoch.get(),
                "becoming partition leader"
            );
            self.log.new_leader_epoch(leader_epoch)?;
            let handle = crate::replicator::ReplicationServer::start(self).await?;
            let mut state = self.state.lock();
            state.role = Role::Leader;
            state.replication = Some(handle);
        } else {
            info!(
                stream = %self.stream, partition = %self.id, leader = %leader,
                epoch = leader_epoch.get(), "becoming partition follower"
            );
            let handle = crate::fetcher::Fetcher::start(self, leader, leader_epoch).await?;
            let mut state = self.state.lock();
            state.role = Role::Follower;
            state.fetcher = Some(handle);
        }
        Ok(())
    }

    /// Records a leader change without starting a replication role. Used
    /// on brokers that are not replicas of the partition but still serve
    /// metadata about it.
    pub fn note_leader(&self, leader: BrokerId, leader_epoch: LeaderEpoch) {
        let mut state = self.state.lock();
        state.leader = Some(leader);
        state.leader_epoch = leader_epoch;
    }

    /// Pauses the partition: stops replication activity and closes the log.
    /// Resume reopens the partition from its on-disk state.
    pub async fn pause(&self) -> ClusterResult<()> {
        let (replication, fetcher) = {
            let mut state = self.state.lock();
            state.paused = true;
            state.role = Role::Paused;
            (state.replication.take(), state.fetcher.take())
        };
        if let Some(replication) = replication {
            replication.stop();
        }
        if let Some(fetcher) = fetcher {
            fetcher.stop();
        }
        self.pause_timestamps.lock().update();
        self.log.close().await?;
        Ok(())
    }

    /// Marks the pause state cleared (used when a paused partition is
    /// reopened).
    pub fn mark_resumed(&self) {
        self.state.lock().paused = false;
        self.pause_timestamps.lock().update();
    }

    /// Sets the readonly flag on the partition and its log.
    pub fn set_readonly(&self, readonly: bool) {
        self.state.lock().readonly = readonly;
        self.log.set_readonly(readonly);
        self.readonly_timestamps.lock().update();
    }

    /// Stops replication activity and closes the log, leaving data on disk.
    pub async fn stop(&self) -> ClusterResult<()> {
        let (replication, fetcher) = {
            let mut state = self.state.lock();
            state.role = Role::Paused;
            (state.replication.take(), state.fetcher.take())
        };
        if let Some(replication) = replication {
            replication.stop();
        }
        if let Some(fetcher) = fetcher {
            fetcher.stop();
        }
        self.log.close().await?;
        Ok(())
    }

    /// Stops the partition and deletes its on-disk data.
    pub async fn delete(&self) -> ClusterResult<()> {
        let (replication, fetcher) = {
            let mut state = self.state.lock();
            state.role = Role::Paused;
            (state.replication.take(), state.fetcher.take())
        };
        if let Some(replication) = replication {
            replication.stop();
        }
        if let Some(fetcher) = fetcher {
            fetcher.stop();
        }
        self.log.delete().await?;
        Ok(())
    }

    /// Publishes records to the partition (leader only).
    ///
    /// With [`AckPolicy::All`] this returns once the high watermark covers
    /// the batch, i.e. every in-sync replica has it. Callers bound the wait
    /// with their own deadline.
    pub async fn publish(
        &self,
        mut records: Vec<Record>,
        ack: AckPolicy,
    ) -> ClusterResult<Vec<Offset>> {
        let (leader_epoch, notify) = {
            let state = self.state.lock();
            if state.role != Role::Leader {
                return Err(ClusterError::NotLeader);
            }
            if state.paused {
                return Err(ClusterError::Paused);
            }
            if state.isr.len() < self.clustering.min_isr {
                return Err(ClusterError::InsufficientIsr {
                    isr: state.isr.len(),
                    min: self.clustering.min_isr,
                });
            }
            (state.leader_epoch, state.replication.clone())
        };

        for record in &mut records {
            record.leader_epoch = leader_epoch;
        }
        let offsets = self.log.append(records)?;
        self.messages_received.lock().update();

        if let Some(notify) = &notify {
            notify.recompute_hw();
            notify.notify_followers();
        }

        if ack == AckPolicy::All {
            if let Some(last) = offsets.last().copied() {
                self.wait_committed(last).await?;
            }
        }
        Ok(offsets)
    }

    /// Waits until the high watermark reaches `offset`.
    async fn wait_committed(&self, offset: Offset) -> ClusterResult<()> {
        loop {
            let hw = self.log.high_watermark();
            if hw >= offset {
                return Ok(());
            }
            let waiter = next_waiter_id();
            let rx = self.log.wait_for_hw(waiter, hw);
            match rx.await {
                Ok(false) => {}
                Ok(true) => return Err(ClusterError::EndOfReadonlyLog),
                Err(_) => return Err(ClusterError::Closed),
            }
        }
    }

    pub(crate) fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub(crate) fn reporter(&self) -> &Arc<dyn IsrReporter> {
        &self.reporter
    }

    /// Pause event timestamps for metadata responses.
    #[must_use]
    pub fn pause_timestamps(&self) -> EventTimestamps {
        *self.pause_timestamps.lock()
    }

    /// Readonly event timestamps for metadata responses.
    #[must_use]
    pub fn readonly_timestamps(&self) -> EventTimestamps {
        *self.readonly_timestamps.lock()
    }

    /// Message arrival timestamps for metadata responses.
    #[must_use]
    pub fn messages_received_timestamps(&self) -> EventTimestamps {
        *self.messages_received.lock()
    }
}
