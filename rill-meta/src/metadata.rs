//! The cluster metadata plane.
//!
//! Manages the stream/partition registry, ISR and epoch bookkeeping,
//! leader election and load-aware placement. Every mutation flows through
//! the consensus log: the metadata leader checks preconditions, proposes
//! the operation, and each broker applies it to its local registry inside
//! the consensus apply path. Brokers that are not the metadata leader
//! forward requests over the bus and wait for the decision.
//!
//! Leader failure detection is witness-based: followers that cannot fetch
//! from a partition leader report it; once a strict majority of the ISR
//! (excluding the leader) has reported within `replica_max_leader_timeout`,
//! the metadata leader elects a new partition leader from the ISR.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use rill_cluster::bus::Subscription;
use rill_cluster::rpc::{
    partition_status_subject, propagate_subject, server_info_subject, PartitionStatusRequest,
    PartitionStatusResponse, PropagatedRequest, PropagatedResponse, ServerInfoRequest,
    ServerInfoResponse,
};
use rill_cluster::{
    ClusterError, ClusteringConfig, IsrReporter, MessageBus, Partition, PartitionConfig,
    PartitionInfo,
};
use rill_core::{BrokerId, LeaderEpoch, PartitionId, Timestamp};
use rill_log::LogConfig;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::consensus::{
    ConsensusApplier, ConsensusLog, MetadataOp, PartitionSpec, StreamConfig, StreamSpec,
};
use crate::error::{MetaError, MetaResult};

/// Retry spacing for partition-leader status probes.
const STATUS_PROBE_BACKOFF: Duration = Duration::from_millis(100);

/// Number of status probes before giving up (best effort).
const STATUS_PROBE_ATTEMPTS: usize = 5;

/// Static configuration of one broker's metadata plane.
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    /// This broker.
    pub broker: BrokerId,
    /// Root data directory; partition logs live under
    /// `streams/{stream}/{partition}`.
    pub data_dir: PathBuf,
    /// Clustering timeouts.
    pub clustering: ClusteringConfig,
    /// Commit log configuration applied to every partition.
    pub log: LogConfig,
}

/// Client-facing request to create a stream.
#[derive(Debug, Clone)]
pub struct CreateStreamRequest {
    /// Stream name.
    pub name: String,
    /// Subject records are published under.
    pub subject: String,
    /// Number of partitions.
    pub partitions: u64,
    /// Replicas per partition; `0` means every broker.
    pub replication_factor: u64,
}

/// One broker's entry in a metadata response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerInfo {
    /// The broker.
    pub broker: BrokerId,
    /// Partitions it hosts.
    pub partition_count: u64,
    /// Partitions it leads.
    pub leader_count: u64,
}

/// Per-stream metadata returned to clients.
#[derive(Debug, Clone)]
pub struct StreamMetadata {
    /// Stream name.
    pub name: String,
    /// Subject records are published under.
    pub subject: String,
    /// Creation time in millis.
    pub creation_time: i64,
    /// Partition snapshots.
    pub partitions: Vec<PartitionInfo>,
}

/// Response to a metadata fetch.
#[derive(Debug, Clone)]
pub struct MetadataResponse {
    /// Cluster brokers with load counts.
    pub brokers: Vec<BrokerInfo>,
    /// Requested streams; `None` marks an unknown stream.
    pub streams: HashMap<String, Option<StreamMetadata>>,
}

struct StreamState {
    subject: String,
    config: StreamConfig,
    creation_time: i64,
    partitions: HashMap<PartitionId, Arc<Partition>>,
    tombstoned: bool,
}

struct MetaState {
    streams: HashMap<String, StreamState>,
    partition_load: HashMap<BrokerId, usize>,
    leader_load: HashMap<BrokerId, usize>,
    cached_brokers: Vec<BrokerInfo>,
    cached_members: BTreeSet<BrokerId>,
    last_cached: Option<Instant>,
}

struct LeaderReport {
    witnesses: HashSet<BrokerId>,
    expiry: JoinHandle<()>,
}

/// A request forwarded to the metadata leader: either a consensus-bound
/// operation or a leader-failure witness report.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PropagatedOp {
    Op(MetadataOp),
    ReportLeader {
        stream: String,
        partition: PartitionId,
        observer: BrokerId,
        leader: BrokerId,
        leader_epoch: LeaderEpoch,
    },
}

impl PropagatedOp {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Op(op) => {
                buf.put_u8(0);
                buf.put_slice(&op.encode());
            }
            Self::ReportLeader {
                stream,
                partition,
                observer,
                leader,
                leader_epoch,
            } => {
                buf.put_u8(1);
                #[allow(clippy::cast_possible_truncation)] // Names are short.
                buf.put_u32(stream.len() as u32);
                buf.put_slice(stream.as_bytes());
                buf.put_u64(partition.get());
                buf.put_u64(observer.get());
                buf.put_u64(leader.get());
                buf.put_u64(leader_epoch.get());
            }
        }
        buf.freeze()
    }

    fn decode(mut buf: Bytes) -> MetaResult<Self> {
        if buf.remaining() < 1 {
            return Err(MetaError::InvalidArgument {
                message: "empty propagated request".to_string(),
            });
        }
        match buf.get_u8() {
            0 => Ok(Self::Op(MetadataOp::decode(buf)?)),
            1 => {
                if buf.remaining() < 4 {
                    return Err(MetaError::InvalidArgument {
                        message: "truncated report".to_string(),
                    });
                }
                let len = buf.get_u32() as usize;
                if buf.remaining() < len + 32 {
                    return Err(MetaError::InvalidArgument {
                        message: "truncated report".to_string(),
                    });
                }
                let stream = String::from_utf8(buf.copy_to_bytes(len).to_vec()).map_err(|_| {
                    MetaError::InvalidArgument {
                        message: "invalid utf-8 in report".to_string(),
                    }
                })?;
                Ok(Self::ReportLeader {
                    stream,
                    partition: PartitionId::new(buf.get_u64()),
                    observer: BrokerId::new(buf.get_u64()),
                    leader: BrokerId::new(buf.get_u64()),
                    leader_epoch: LeaderEpoch::new(buf.get_u64()),
                })
            }
            other => Err(MetaError::InvalidArgument {
                message: format!("unknown propagated tag {other}"),
            }),
        }
    }
}

/// One broker's metadata plane.
pub struct MetadataPlane {
    config: MetadataConfig,
    bus: Arc<dyn MessageBus>,
    consensus: Arc<dyn ConsensusLog>,
    state: RwLock<MetaState>,
    leader_reports: Mutex<HashMap<(String, PartitionId), LeaderReport>>,
    reporter: Arc<ReporterHandle>,
    closed: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MetadataPlane {
    /// Creates the metadata plane. Call [`MetadataPlane::start`] to begin
    /// serving bus requests, and register the plane with the consensus
    /// engine so committed operations reach [`ConsensusApplier::apply`].
    #[must_use]
    pub fn new(
        config: MetadataConfig,
        bus: Arc<dyn MessageBus>,
        consensus: Arc<dyn ConsensusLog>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let (closed, _) = watch::channel(false);
            Self {
                config,
                bus,
                consensus,
                state: RwLock::new(MetaState {
                    streams: HashMap::new(),
                    partition_load: HashMap::new(),
                    leader_load: HashMap::new(),
                    cached_brokers: Vec::new(),
                    cached_members: BTreeSet::new(),
                    last_cached: None,
                }),
                leader_reports: Mutex::new(HashMap::new()),
                reporter: Arc::new(ReporterHandle { plane: weak.clone() }),
                closed,
                tasks: Mutex::new(Vec::new()),
            }
        })
    }

    /// This broker's ID.
    #[must_use]
    pub fn broker(&self) -> BrokerId {
        self.config.broker
    }

    /// Returns the ISR-report seam handed to partitions.
    #[must_use]
    pub fn reporter(&self) -> Arc<dyn IsrReporter> {
        self.reporter.clone()
    }

    /// Subscribes to this broker's service subjects and starts the server
    /// loops (propagated requests, cluster surveys, status probes).
    pub async fn start(self: &Arc<Self>) -> MetaResult<()> {
        let propagate = self
            .bus
            .subscribe(&propagate_subject(self.config.broker))
            .await?;
        let info = self
            .bus
            .subscribe(&server_info_subject(self.config.broker))
            .await?;
        let status = self
            .bus
            .subscribe(&partition_status_subject(self.config.broker))
            .await?;

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(propagate_loop(
            Arc::downgrade(self),
            propagate,
            self.closed.subscribe(),
        )));
        tasks.push(tokio::spawn(server_info_loop(
            Arc::downgrade(self),
            info,
            self.closed.subscribe(),
        )));
        tasks.push(tokio::spawn(status_loop(
            Arc::downgrade(self),
            status,
            self.closed.subscribe(),
        )));
        Ok(())
    }

    /// Starts replication roles for every partition this broker replicates.
    /// Called once after consensus recovery has replayed the registry, and
    /// finalizes tombstoned streams.
    pub async fn finish_recovery(&self) -> MetaResult<()> {
        let tombstoned: Vec<String> = {
            let state = self.state.read();
            state
                .streams
                .iter()
                .filter(|(_, s)| s.tombstoned)
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in tombstoned {
            self.remove_stream_locally(&name, false);
        }

        let partitions: Vec<Arc<Partition>> = {
            let state = self.state.read();
            state
                .streams
                .values()
                .flat_map(|s| s.partitions.values().cloned())
                .collect()
        };
        for partition in partitions {
            if partition.is_paused() || !partition.replicas().contains(&self.config.broker) {
                continue;
            }
            let (leader, epoch) = partition.leader();
            if let Some(leader) = leader {
                partition
                    .set_leader(leader, epoch)
                    .await
                    .map_err(MetaError::Cluster)?;
            }
        }
        Ok(())
    }

    /// Stops the server loops and closes every partition.
    pub async fn shutdown(&self) {
        let _ = self.closed.send(true);
        for task in self.tasks.lock().drain(..) {
            drop(task);
        }
        for report in self.leader_reports.lock().drain() {
            report.1.expiry.abort();
        }
        let partitions: Vec<Arc<Partition>> = {
            let state = self.state.read();
            state
                .streams
                .values()
                .flat_map(|s| s.partitions.values().cloned())
                .collect()
        };
        for partition in partitions {
            if let Err(e) = partition.stop().await {
                warn!(error = %e, "failed to stop partition during shutdown");
            }
        }
    }

    // ---- Client operations -------------------------------------------------

    /// Creates a stream: selects replicas for each partition by load,
    /// proposes the placement through consensus, and waits (best effort)
    /// for the partition leaders to start.
    pub async fn create_stream(self: &Arc<Self>, req: CreateStreamRequest) -> MetaResult<()> {
        if req.partitions == 0 {
            return Err(MetaError::InvalidArgument {
                message: "no partitions provided".to_string(),
            });
        }
        if !self.consensus.is_leader() {
            let spec = StreamSpec {
                name: req.name.clone(),
                subject: req.subject.clone(),
                config: StreamConfig {
                    replication_factor: req.replication_factor,
                },
                partitions: (0..req.partitions)
                    .map(|id| PartitionSpec {
                        id: PartitionId::new(id),
                        replicas: Vec::new(),
                        isr: Vec::new(),
                        leader: None,
                        leader_epoch: LeaderEpoch::new(0),
                        epoch: 0,
                        paused: false,
                    })
                    .collect(),
                creation_time: 0,
            };
            return self.propagate(PropagatedOp::Op(MetadataOp::CreateStream { spec })).await;
        }

        if self.state.read().streams.contains_key(&req.name) {
            return Err(MetaError::StreamExists);
        }

        let mut partitions = Vec::with_capacity(usize::try_from(req.partitions).unwrap_or(0));
        for id in 0..req.partitions {
            let replicas = self.place_replicas(req.replication_factor)?;
            let leader = self.select_partition_leader(&replicas);
            partitions.push(PartitionSpec {
                id: PartitionId::new(id),
                isr: replicas.clone(),
                replicas,
                leader: Some(leader),
                leader_epoch: LeaderEpoch::new(1),
                epoch: 1,
                paused: false,
            });
        }
        let spec = StreamSpec {
            name: req.name,
            subject: req.subject,
            config: StreamConfig {
                replication_factor: req.replication_factor,
            },
            partitions,
            creation_time: Timestamp::now().as_millis(),
        };

        info!(stream = %spec.name, partitions = spec.partitions.len(), "creating stream");
        let op = MetadataOp::CreateStream { spec: spec.clone() };
        self.consensus.propose(op).await?;
        self.wait_for_partition_leaders(&spec).await;
        Ok(())
    }

    /// Deletes a stream cluster-wide.
    pub async fn delete_stream(self: &Arc<Self>, stream: &str) -> MetaResult<()> {
        let op = MetadataOp::DeleteStream {
            stream: stream.to_string(),
        };
        if !self.consensus.is_leader() {
            return self.propagate(PropagatedOp::Op(op)).await;
        }
        if !self.state.read().streams.contains_key(stream) {
            return Err(MetaError::StreamNotFound);
        }
        self.consensus.propose(op).await
    }

    /// Pauses stream partitions (all when `partitions` is empty).
    pub async fn pause_stream(
        self: &Arc<Self>,
        stream: &str,
        partitions: Vec<PartitionId>,
    ) -> MetaResult<()> {
        let op = MetadataOp::PauseStream {
            stream: stream.to_string(),
            partitions: partitions.clone(),
        };
        if !self.consensus.is_leader() {
            return self.propagate(PropagatedOp::Op(op)).await;
        }
        self.check_partitions_exist(stream, &partitions)?;
        self.consensus.propose(op).await
    }

    /// Resumes paused stream partitions and waits (best effort) for their
    /// leaders to start.
    pub async fn resume_stream(
        self: &Arc<Self>,
        stream: &str,
        partitions: Vec<PartitionId>,
    ) -> MetaResult<()> {
        let op = MetadataOp::ResumeStream {
            stream: stream.to_string(),
            partitions: partitions.clone(),
        };
        if !self.consensus.is_leader() {
            return self.propagate(PropagatedOp::Op(op)).await;
        }
        self.check_partitions_exist(stream, &partitions)?;
        self.consensus.propose(op).await?;

        for id in partitions {
            if let Some(partition) = self.partition(stream, id) {
                let (leader, _) = partition.leader();
                if let Some(leader) = leader {
                    self.wait_for_partition_leader(stream, id, leader).await;
                }
            }
        }
        Ok(())
    }

    /// Sets the readonly flag on stream partitions (all when empty).
    pub async fn set_stream_readonly(
        self: &Arc<Self>,
        stream: &str,
        partitions: Vec<PartitionId>,
        readonly: bool,
    ) -> MetaResult<()> {
        let op = MetadataOp::SetStreamReadonly {
            stream: stream.to_string(),
            partitions: partitions.clone(),
            readonly,
        };
        if !self.consensus.is_leader() {
            return self.propagate(PropagatedOp::Op(op)).await;
        }
        self.check_partitions_exist(stream, &partitions)?;
        self.consensus.propose(op).await
    }

    /// Removes `replica` from a partition's ISR, fencing on the requester's
    /// leader generation.
    pub async fn shrink_isr(
        self: &Arc<Self>,
        stream: &str,
        partition: PartitionId,
        replica: BrokerId,
        leader: BrokerId,
        leader_epoch: LeaderEpoch,
    ) -> MetaResult<()> {
        if !self.consensus.is_leader() {
            return self
                .propagate(PropagatedOp::Op(MetadataOp::ShrinkIsr {
                    stream: stream.to_string(),
                    partition,
                    replica,
                    leader,
                    leader_epoch,
                    epoch: 0,
                }))
                .await;
        }
        let target = self.check_leader_generation(stream, partition, leader, leader_epoch)?;
        self.consensus
            .propose(MetadataOp::ShrinkIsr {
                stream: stream.to_string(),
                partition,
                replica,
                leader,
                leader_epoch,
                epoch: target.epoch() + 1,
            })
            .await
    }

    /// Adds `replica` back to a partition's ISR, fencing on the requester's
    /// leader generation.
    pub async fn expand_isr(
        self: &Arc<Self>,
        stream: &str,
        partition: PartitionId,
        replica: BrokerId,
        leader: BrokerId,
        leader_epoch: LeaderEpoch,
    ) -> MetaResult<()> {
        if !self.consensus.is_leader() {
            return self
                .propagate(PropagatedOp::Op(MetadataOp::ExpandIsr {
                    stream: stream.to_string(),
                    partition,
                    replica,
                    leader,
                    leader_epoch,
                    epoch: 0,
                }))
                .await;
        }
        let target = self.check_leader_generation(stream, partition, leader, leader_epoch)?;
        self.consensus
            .propose(MetadataOp::ExpandIsr {
                stream: stream.to_string(),
                partition,
                replica,
                leader,
                leader_epoch,
                epoch: target.epoch() + 1,
            })
            .await
    }

    /// Accumulates a leader-failure witness. When strictly more than half
    /// of the ISR (excluding the leader) has reported within
    /// `replica_max_leader_timeout`, a new leader is elected from the ISR.
    pub async fn report_leader(
        self: &Arc<Self>,
        stream: &str,
        partition: PartitionId,
        observer: BrokerId,
        leader: BrokerId,
        leader_epoch: LeaderEpoch,
    ) -> MetaResult<()> {
        if !self.consensus.is_leader() {
            return self
                .propagate(PropagatedOp::ReportLeader {
                    stream: stream.to_string(),
                    partition,
                    observer,
                    leader,
                    leader_epoch,
                })
                .await;
        }
        let target = self.check_leader_generation(stream, partition, leader, leader_epoch)?;

        let quorum_reached = {
            let mut reports = self.leader_reports.lock();
            let key = (stream.to_string(), partition);
            let report = reports.entry(key.clone()).or_insert_with(|| {
                let plane = self.reporter.plane.clone();
                LeaderReport {
                    witnesses: HashSet::new(),
                    expiry: spawn_report_expiry(
                        plane,
                        key.clone(),
                        self.config.clustering.replica_max_leader_timeout,
                    ),
                }
            });
            report.witnesses.insert(observer);

            // Exclude the leader itself from the quorum.
            let isr_size = target.isr_size().saturating_sub(1);
            if report.witnesses.len() * 2 > isr_size {
                report.expiry.abort();
                reports.remove(&key);
                true
            } else {
                // Reset the expiry window.
                report.expiry.abort();
                report.expiry = spawn_report_expiry(
                    self.reporter.plane.clone(),
                    key,
                    self.config.clustering.replica_max_leader_timeout,
                );
                false
            }
        };

        if quorum_reached {
            warn!(
                stream = %stream, partition = %partition, leader = %leader,
                "leader failure quorum reached, electing new leader"
            );
            self.elect_new_partition_leader(&target).await?;
        }
        Ok(())
    }

    /// Fetches cluster metadata: the broker list (cached or surveyed) plus
    /// stream metadata for `streams` (all streams when empty).
    pub async fn fetch_metadata(&self, streams: Vec<String>) -> MetaResult<MetadataResponse> {
        let members: BTreeSet<BrokerId> = self.consensus.members().into_iter().collect();
        let brokers = if let Some(cached) = self.cached_brokers(&members) {
            cached
        } else {
            let surveyed = self.survey_brokers(&members).await;
            let mut state = self.state.write();
            state.cached_brokers.clone_from(&surveyed);
            state.cached_members = members;
            state.last_cached = Some(Instant::now());
            surveyed
        };

        let state = self.state.read();
        let names: Vec<String> = if streams.is_empty() {
            state.streams.keys().cloned().collect()
        } else {
            streams
        };
        let mut out = HashMap::with_capacity(names.len());
        for name in names {
            let metadata = state.streams.get(&name).map(|s| StreamMetadata {
                name: name.clone(),
                subject: s.subject.clone(),
                creation_time: s.creation_time,
                partitions: s.partitions.values().map(|p| p.info()).collect(),
            });
            out.insert(name, metadata);
        }
        Ok(MetadataResponse {
            brokers,
            streams: out,
        })
    }

    // ---- Registry access ---------------------------------------------------

    /// Returns the partition, if this broker knows it.
    #[must_use]
    pub fn partition(&self, stream: &str, id: PartitionId) -> Option<Arc<Partition>> {
        self.state
            .read()
            .streams
            .get(stream)
            .and_then(|s| s.partitions.get(&id))
            .cloned()
    }

    /// Returns the names of all known streams.
    #[must_use]
    pub fn stream_names(&self) -> Vec<String> {
        self.state.read().streams.keys().cloned().collect()
    }

    /// Returns per-broker partition counts.
    #[must_use]
    pub fn broker_partition_counts(&self) -> HashMap<BrokerId, usize> {
        self.state.read().partition_load.clone()
    }

    /// Returns per-broker leader counts.
    #[must_use]
    pub fn broker_leader_counts(&self) -> HashMap<BrokerId, usize> {
        self.state.read().leader_load.clone()
    }

    /// Drops all leader-failure witness state. Called when this broker
    /// loses metadata leadership.
    pub fn lost_leadership(&self) {
        for (_, report) in self.leader_reports.lock().drain() {
            report.expiry.abort();
        }
    }

    // ---- Placement and election -------------------------------------------

    /// Selects replicas for one partition: the `replication_factor` brokers
    /// with the fewest partitions.
    fn place_replicas(&self, replication_factor: u64) -> MetaResult<Vec<BrokerId>> {
        let mut members = self.consensus.members();
        let factor = if replication_factor == 0 {
            members.len()
        } else {
            usize::try_from(replication_factor).unwrap_or(usize::MAX)
        };
        if factor == 0 || factor > members.len() {
            return Err(MetaError::InvalidArgument {
                message: format!(
                    "invalid replication factor {replication_factor} for cluster of {}",
                    members.len()
                ),
            });
        }
        let state = self.state.read();
        members.sort_by_key(|b| (state.partition_load.get(b).copied().unwrap_or(0), b.get()));
        Ok(members.into_iter().take(factor).collect())
    }

    /// Picks the replica with the fewest led partitions as leader.
    fn select_partition_leader(&self, replicas: &[BrokerId]) -> BrokerId {
        let state = self.state.read();
        replicas
            .iter()
            .copied()
            .min_by_key(|b| (state.leader_load.get(b).copied().unwrap_or(0), b.get()))
            .expect("replica set is non-empty")
    }

    /// Elects a new leader from the ISR, excluding the current leader.
    async fn elect_new_partition_leader(&self, partition: &Arc<Partition>) -> MetaResult<()> {
        let isr = partition.isr();
        let (current, current_epoch) = partition.leader();
        let candidates: Vec<BrokerId> = isr
            .into_iter()
            .filter(|b| Some(*b) != current)
            .collect();
        if candidates.is_empty() {
            return Err(MetaError::NoIsrCandidates);
        }
        let leader = {
            let state = self.state.read();
            candidates
                .into_iter()
                .min_by_key(|b| (state.leader_load.get(b).copied().unwrap_or(0), b.get()))
                .expect("candidates is non-empty")
        };

        info!(
            stream = %partition.stream(), partition = %partition.id(), leader = %leader,
            "electing new partition leader"
        );
        self.consensus
            .propose(MetadataOp::ChangeLeader {
                stream: partition.stream().to_string(),
                partition: partition.id(),
                leader,
                leader_epoch: current_epoch.next(),
                epoch: partition.epoch() + 1,
            })
            .await
    }

    // ---- Preconditions ----------------------------------------------------

    fn check_partitions_exist(&self, stream: &str, partitions: &[PartitionId]) -> MetaResult<()> {
        let state = self.state.read();
        let stream_state = state.streams.get(stream).ok_or(MetaError::StreamNotFound)?;
        for id in partitions {
            if !stream_state.partitions.contains_key(id) {
                return Err(MetaError::PartitionNotFound);
            }
        }
        Ok(())
    }

    fn check_leader_generation(
        &self,
        stream: &str,
        partition: PartitionId,
        leader: BrokerId,
        leader_epoch: LeaderEpoch,
    ) -> MetaResult<Arc<Partition>> {
        let target = self
            .partition(stream, partition)
            .ok_or(MetaError::PartitionNotFound)?;
        let (current, current_epoch) = target.leader();
        if current != Some(leader) || current_epoch != leader_epoch {
            return Err(MetaError::LeaderGenerationMismatch {
                current_leader: current.map_or(0, BrokerId::get),
                current_epoch: current_epoch.get(),
                got_leader: leader.get(),
                got_epoch: leader_epoch.get(),
            });
        }
        Ok(target)
    }

    // ---- Propagation ------------------------------------------------------

    /// Forwards a request to the metadata leader and waits for its
    /// decision. If this broker has become the leader in the meantime, the
    /// request is performed locally instead.
    async fn propagate(self: &Arc<Self>, op: PropagatedOp) -> MetaResult<()> {
        let deadline = Instant::now() + self.config.clustering.propagate_timeout;
        let leader = loop {
            if let Some(leader) = self.consensus.leader_id() {
                break leader;
            }
            if Instant::now() >= deadline {
                return Err(MetaError::NotMetadataLeader);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        };
        if leader == self.config.broker {
            return Box::pin(self.dispatch_local(op)).await;
        }

        let response = self
            .bus
            .request(
                &propagate_subject(leader),
                PropagatedRequest { data: op.encode() }.encode(),
                self.config.clustering.propagate_timeout,
            )
            .await
            .map_err(|e| match e {
                ClusterError::Timeout { .. } => MetaError::PropagationTimeout,
                other => MetaError::Cluster(other),
            })?;
        let response = PropagatedResponse::decode(response).map_err(MetaError::Cluster)?;
        match response.error {
            None => Ok(()),
            Some((code, message)) => Err(MetaError::from_code(code, message)),
        }
    }

    /// Performs a (possibly propagated) request on this broker.
    async fn dispatch_local(self: &Arc<Self>, op: PropagatedOp) -> MetaResult<()> {
        match op {
            PropagatedOp::Op(MetadataOp::CreateStream { spec }) => {
                Box::pin(self.create_stream(CreateStreamRequest {
                    name: spec.name,
                    subject: spec.subject,
                    partitions: spec.partitions.len() as u64,
                    replication_factor: spec.config.replication_factor,
                }))
                .await
            }
            PropagatedOp::Op(MetadataOp::DeleteStream { stream }) => {
                self.delete_stream(&stream).await
            }
            PropagatedOp::Op(MetadataOp::PauseStream { stream, partitions }) => {
                self.pause_stream(&stream, partitions).await
            }
            PropagatedOp::Op(MetadataOp::ResumeStream { stream, partitions }) => {
                self.resume_stream(&stream, partitions).await
            }
            PropagatedOp::Op(MetadataOp::SetStreamReadonly {
                stream,
                partitions,
                readonly,
            }) => self.set_stream_readonly(&stream, partitions, readonly).await,
            PropagatedOp::Op(MetadataOp::ShrinkIsr {
                stream,
                partition,
                replica,
                leader,
                leader_epoch,
                ..
            }) => {
                self.shrink_isr(&stream, partition, replica, leader, leader_epoch)
                    .await
            }
            PropagatedOp::Op(MetadataOp::ExpandIsr {
                stream,
                partition,
                replica,
                leader,
                leader_epoch,
                ..
            }) => {
                self.expand_isr(&stream, partition, replica, leader, leader_epoch)
                    .await
            }
            PropagatedOp::Op(MetadataOp::ChangeLeader { .. }) => Err(MetaError::InvalidArgument {
                message: "leader changes are not client operations".to_string(),
            }),
            PropagatedOp::ReportLeader {
                stream,
                partition,
                observer,
                leader,
                leader_epoch,
            } => {
                self.report_leader(&stream, partition, observer, leader, leader_epoch)
                    .await
            }
        }
    }

    // ---- Broker info ------------------------------------------------------

    fn cached_brokers(&self, members: &BTreeSet<BrokerId>) -> Option<Vec<BrokerInfo>> {
        let state = self.state.read();
        let fresh = state.last_cached.is_some_and(|at| {
            at.elapsed() <= self.config.clustering.metadata_cache_max_age
        });
        (fresh && !state.cached_brokers.is_empty() && state.cached_members == *members)
            .then(|| state.cached_brokers.clone())
    }

    /// Surveys the cluster for live brokers, aggregating replies until the
    /// expected count is reached or the deadline fires. Load counts come
    /// from this broker's registry, which consensus keeps in sync.
    async fn survey_brokers(&self, members: &BTreeSet<BrokerId>) -> Vec<BrokerInfo> {
        let (partition_load, leader_load) = {
            let state = self.state.read();
            (state.partition_load.clone(), state.leader_load.clone())
        };
        let info_for = |broker: BrokerId| BrokerInfo {
            broker,
            partition_count: partition_load.get(&broker).copied().unwrap_or(0) as u64,
            leader_count: leader_load.get(&broker).copied().unwrap_or(0) as u64,
        };

        let mut brokers = vec![info_for(self.config.broker)];
        let mut survey = JoinSet::new();
        for member in members {
            if *member == self.config.broker {
                continue;
            }
            let bus = self.bus.clone();
            let member = *member;
            let request = ServerInfoRequest {
                broker: self.config.broker,
            }
            .encode();
            let timeout = self.config.clustering.propagate_timeout;
            survey.spawn(async move {
                bus.request(&server_info_subject(member), request, timeout)
                    .await
                    .ok()
                    .and_then(|data| ServerInfoResponse::decode(data).ok())
            });
        }
        while let Some(result) = survey.join_next().await {
            if let Ok(Some(response)) = result {
                brokers.push(info_for(response.broker));
            }
        }
        brokers.sort_by_key(|b| b.broker);
        brokers
    }

    /// Best-effort wait for every partition leader in a new stream.
    async fn wait_for_partition_leaders(self: &Arc<Self>, spec: &StreamSpec) {
        for partition in &spec.partitions {
            if let Some(leader) = partition.leader {
                self.wait_for_partition_leader(&spec.name, partition.id, leader)
                    .await;
            }
        }
    }

    async fn wait_for_partition_leader(
        self: &Arc<Self>,
        stream: &str,
        partition: PartitionId,
        leader: BrokerId,
    ) {
        if leader == self.config.broker {
            // The state machine is local; a barrier is enough.
            if let Err(e) = self.consensus.barrier().await {
                warn!(error = %e, "consensus barrier failed");
            }
            return;
        }
        let request = PartitionStatusRequest {
            stream: stream.to_string(),
            partition,
        }
        .encode();
        for _ in 0..STATUS_PROBE_ATTEMPTS {
            let result = self
                .bus
                .request(
                    &partition_status_subject(leader),
                    request.clone(),
                    self.config.clustering.propagate_timeout,
                )
                .await
                .and_then(PartitionStatusResponse::decode);
            match result {
                Ok(status) if status.exists && status.is_leader => return,
                Ok(_) => {}
                Err(e) => {
                    debug!(
                        stream = %stream, partition = %partition, leader = %leader,
                        error = %e, "partition status probe failed"
                    );
                }
            }
            tokio::time::sleep(STATUS_PROBE_BACKOFF).await;
        }
    }

    // ---- Consensus apply --------------------------------------------------

    fn apply_create_stream(&self, spec: &StreamSpec, recovered: bool) {
        let mut state = self.state.write();
        if let Some(existing) = state.streams.get(&spec.name) {
            if !(recovered && existing.tombstoned) {
                // Precondition race; the proposal-side check makes this
                // unreachable outside recovery.
                warn!(stream = %spec.name, "ignoring create for existing stream");
                return;
            }
            // Re-creation during recovery cancels the pending delete.
            let existing = state.streams.remove(&spec.name).expect("checked above");
            decrement_loads(&mut state, existing.partitions.values());
            for partition in existing.partitions.values().cloned() {
                tokio::spawn(async move {
                    let _ = partition.stop().await;
                });
            }
        }

        let mut partitions = HashMap::with_capacity(spec.partitions.len());
        for partition_spec in &spec.partitions {
            let dir = self
                .config
                .data_dir
                .join("streams")
                .join(&spec.name)
                .join(partition_spec.id.get().to_string());
            let config = PartitionConfig {
                stream: spec.name.clone(),
                id: partition_spec.id,
                broker: self.config.broker,
                replicas: partition_spec.replicas.clone(),
                isr: partition_spec.isr.clone(),
                leader: partition_spec.leader,
                leader_epoch: partition_spec.leader_epoch,
                epoch: partition_spec.epoch,
                data_dir: dir,
                clustering: self.config.clustering.clone(),
                log: self.config.log.clone(),
            };
            let partition = match Partition::open(config, self.bus.clone(), self.reporter()) {
                Ok(partition) => partition,
                Err(e) => {
                    error!(
                        stream = %spec.name, partition = %partition_spec.id, error = %e,
                        "failed to open partition"
                    );
                    continue;
                }
            };

            let is_replica = partition_spec.replicas.contains(&self.config.broker);
            if partition_spec.paused {
                let paused = partition.clone();
                tokio::spawn(async move {
                    let _ = paused.pause().await;
                });
            } else if !recovered && is_replica {
                if let Some(leader) = partition_spec.leader {
                    let epoch = partition_spec.leader_epoch;
                    let starting = partition.clone();
                    tokio::spawn(async move {
                        if let Err(e) = starting.set_leader(leader, epoch).await {
                            error!(error = %e, "failed to start partition role");
                        }
                    });
                }
            }
            partitions.insert(partition_spec.id, partition);
        }

        increment_loads(&mut state, partitions.values());
        state.streams.insert(
            spec.name.clone(),
            StreamState {
                subject: spec.subject.clone(),
                config: spec.config,
                creation_time: spec.creation_time,
                partitions,
                tombstoned: false,
            },
        );
    }

    fn apply_delete_stream(&self, stream: &str, recovered: bool) {
        if recovered {
            // Deleting data mid-recovery could destroy a stream that a
            // later entry re-creates; tombstone instead and finalize after
            // recovery.
            if let Some(state) = self.state.write().streams.get_mut(stream) {
                state.tombstoned = true;
            }
            return;
        }
        self.remove_stream_locally(stream, true);
    }

    fn remove_stream_locally(&self, stream: &str, update_loads: bool) {
        let removed = {
            let mut state = self.state.write();
            let removed = state.streams.remove(stream);
            if let Some(stream_state) = &removed {
                if update_loads {
                    decrement_loads(&mut state, stream_state.partitions.values());
                }
            }
            removed
        };
        let Some(stream_state) = removed else { return };

        {
            let mut reports = self.leader_reports.lock();
            let stale: Vec<_> = reports
                .keys()
                .filter(|(name, _)| name == stream)
                .cloned()
                .collect();
            for key in stale {
                if let Some(report) = reports.remove(&key) {
                    report.expiry.abort();
                }
            }
        }

        let stream_dir = self.config.data_dir.join("streams").join(stream);
        tokio::spawn(async move {
            for partition in stream_state.partitions.values() {
                if let Err(e) = partition.delete().await {
                    warn!(error = %e, "failed to delete partition data");
                }
            }
            let _ = std::fs::remove_dir_all(stream_dir);
        });
    }

    fn apply_pause_stream(&self, stream: &str, ids: &[PartitionId]) {
        let mut state = self.state.write();
        let Some(stream_state) = state.streams.get(stream) else {
            return;
        };
        let targets: Vec<Arc<Partition>> = if ids.is_empty() {
            stream_state.partitions.values().cloned().collect()
        } else {
            ids.iter()
                .filter_map(|id| stream_state.partitions.get(id).cloned())
                .collect()
        };
        let to_pause: Vec<Arc<Partition>> = targets
            .into_iter()
            .filter(|p| !p.is_paused())
            .collect();
        decrement_loads(&mut state, to_pause.iter());
        drop(state);

        for partition in to_pause {
            tokio::spawn(async move {
                if let Err(e) = partition.pause().await {
                    warn!(error = %e, "failed to pause partition");
                }
            });
        }
    }

    fn apply_resume_stream(&self, stream: &str, ids: &[PartitionId], recovered: bool) {
        let state = self.state.read();
        let Some(stream_state) = state.streams.get(stream) else {
            return;
        };
        let targets: Vec<Arc<Partition>> = if ids.is_empty() {
            stream_state.partitions.values().cloned().collect()
        } else {
            ids.iter()
                .filter_map(|id| stream_state.partitions.get(id).cloned())
                .collect()
        };
        drop(state);

        for partition in targets {
            if !partition.is_paused() {
                continue;
            }
            self.resume_partition(stream, &partition, recovered);
        }
    }

    /// Resuming replaces the paused partition with a freshly opened one,
    /// recovering the log from disk.
    fn resume_partition(&self, stream: &str, old: &Arc<Partition>, recovered: bool) {
        let info = old.info();
        let dir = self
            .config
            .data_dir
            .join("streams")
            .join(stream)
            .join(info.id.get().to_string());
        let config = PartitionConfig {
            stream: stream.to_string(),
            id: info.id,
            broker: self.config.broker,
            replicas: info.replicas.clone(),
            isr: info.isr.clone(),
            leader: info.leader,
            leader_epoch: info.leader_epoch,
            epoch: info.epoch,
            data_dir: dir,
            clustering: self.config.clustering.clone(),
            log: self.config.log.clone(),
        };

        let plane = self.reporter.plane.clone();
        let stream = stream.to_string();
        let old = old.clone();
        let is_replica = info.replicas.contains(&self.config.broker);
        tokio::spawn(async move {
            // The paused partition already closed its log; make sure before
            // reopening the directory.
            let _ = old.stop().await;
            let Some(plane) = plane.upgrade() else { return };
            let partition = match Partition::open(config, plane.bus.clone(), plane.reporter()) {
                Ok(partition) => partition,
                Err(e) => {
                    error!(stream = %stream, error = %e, "failed to reopen paused partition");
                    return;
                }
            };
            partition.mark_resumed();

            {
                let mut state = plane.state.write();
                if let Some(stream_state) = state.streams.get_mut(&stream) {
                    stream_state
                        .partitions
                        .insert(partition.id(), partition.clone());
                }
                increment_loads(&mut state, std::iter::once(&partition));
            }

            if !recovered && is_replica {
                let (leader, epoch) = partition.leader();
                if let Some(leader) = leader {
                    if let Err(e) = partition.set_leader(leader, epoch).await {
                        error!(error = %e, "failed to start resumed partition role");
                    }
                }
            }
        });
    }

    fn apply_isr_change(
        &self,
        stream: &str,
        partition: PartitionId,
        replica: BrokerId,
        epoch: u64,
        add: bool,
    ) {
        let Some(target) = self.partition(stream, partition) else {
            return;
        };
        // Idempotency fence: only strictly newer epochs mutate the ISR.
        if target.epoch() >= epoch {
            return;
        }
        if add {
            target.add_to_isr(replica);
        } else {
            target.remove_from_isr(replica);
        }
        target.set_epoch(epoch);
    }

    fn apply_change_leader(
        &self,
        stream: &str,
        partition: PartitionId,
        leader: BrokerId,
        leader_epoch: LeaderEpoch,
        epoch: u64,
        recovered: bool,
    ) {
        let Some(target) = self.partition(stream, partition) else {
            return;
        };
        if target.epoch() >= epoch {
            return;
        }
        let (old_leader, _) = target.leader();
        target.set_epoch(epoch);

        {
            let mut state = self.state.write();
            if let Some(old_leader) = old_leader {
                if let Some(count) = state.leader_load.get_mut(&old_leader) {
                    *count = count.saturating_sub(1);
                }
            }
            *state.leader_load.entry(leader).or_insert(0) += 1;
        }

        if recovered || !target.replicas().contains(&self.config.broker) {
            target.note_leader(leader, leader_epoch);
            return;
        }
        tokio::spawn(async move {
            if let Err(e) = target.set_leader(leader, leader_epoch).await {
                error!(error = %e, "failed to apply leader change");
            }
        });
    }

    fn apply_set_readonly(&self, stream: &str, ids: &[PartitionId], readonly: bool) {
        let state = self.state.read();
        let Some(stream_state) = state.streams.get(stream) else {
            return;
        };
        let targets: Vec<Arc<Partition>> = if ids.is_empty() {
            stream_state.partitions.values().cloned().collect()
        } else {
            ids.iter()
                .filter_map(|id| stream_state.partitions.get(id).cloned())
                .collect()
        };
        drop(state);
        for partition in targets {
            partition.set_readonly(readonly);
        }
    }
}

impl ConsensusApplier for MetadataPlane {
    fn apply(&self, op: &MetadataOp, recovered: bool) {
        match op {
            MetadataOp::CreateStream { spec } => self.apply_create_stream(spec, recovered),
            MetadataOp::DeleteStream { stream } => self.apply_delete_stream(stream, recovered),
            MetadataOp::PauseStream { stream, partitions } => {
                self.apply_pause_stream(stream, partitions);
            }
            MetadataOp::ResumeStream { stream, partitions } => {
                self.apply_resume_stream(stream, partitions, recovered);
            }
            MetadataOp::ShrinkIsr {
                stream,
                partition,
                replica,
                epoch,
                ..
            } => self.apply_isr_change(stream, *partition, *replica, *epoch, false),
            MetadataOp::ExpandIsr {
                stream,
                partition,
                replica,
                epoch,
                ..
            } => self.apply_isr_change(stream, *partition, *replica, *epoch, true),
            MetadataOp::ChangeLeader {
                stream,
                partition,
                leader,
                leader_epoch,
                epoch,
            } => self.apply_change_leader(
                stream,
                *partition,
                *leader,
                *leader_epoch,
                *epoch,
                recovered,
            ),
            MetadataOp::SetStreamReadonly {
                stream,
                partitions,
                readonly,
            } => self.apply_set_readonly(stream, partitions, *readonly),
        }
    }
}

fn increment_loads<'a>(
    state: &mut MetaState,
    partitions: impl Iterator<Item = &'a Arc<Partition>>,
) {
    for partition in partitions {
        for replica in partition.replicas() {
            *state.partition_load.entry(replica).or_insert(0) += 1;
        }
        if let (Some(leader), _) = partition.leader() {
            *state.leader_load.entry(leader).or_insert(0) += 1;
        }
    }
}

fn decrement_loads<'a>(
    state: &mut MetaState,
    partitions: impl Iterator<Item = &'a Arc<Partition>>,
) {
    for partition in partitions {
        for replica in partition.replicas() {
            if let Some(count) = state.partition_load.get_mut(&replica) {
                *count = count.saturating_sub(1);
            }
        }
        if let (Some(leader), _) = partition.leader() {
            if let Some(count) = state.leader_load.get_mut(&leader) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

fn spawn_report_expiry(
    plane: Weak<MetadataPlane>,
    key: (String, PartitionId),
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(plane) = plane.upgrade() {
            if let Some(report) = plane.leader_reports.lock().remove(&key) {
                report.expiry.abort();
            }
        }
    })
}

/// ISR-report seam handed to partitions. Holds a weak reference back to
/// the plane so partitions and the plane do not keep each other alive.
struct ReporterHandle {
    plane: Weak<MetadataPlane>,
}

#[async_trait]
impl IsrReporter for ReporterHandle {
    async fn shrink_isr(
        &self,
        stream: &str,
        partition: PartitionId,
        replica: BrokerId,
        leader: BrokerId,
        leader_epoch: LeaderEpoch,
    ) -> Result<(), ClusterError> {
        let Some(plane) = self.plane.upgrade() else {
            return Err(ClusterError::Closed);
        };
        plane
            .shrink_isr(stream, partition, replica, leader, leader_epoch)
            .await
            .map_err(into_cluster_error)
    }

    async fn expand_isr(
        &self,
        stream: &str,
        partition: PartitionId,
        replica: BrokerId,
        leader: BrokerId,
        leader_epoch: LeaderEpoch,
    ) -> Result<(), ClusterError> {
        let Some(plane) = self.plane.upgrade() else {
            return Err(ClusterError::Closed);
        };
        plane
            .expand_isr(stream, partition, replica, leader, leader_epoch)
            .await
            .map_err(into_cluster_error)
    }

    async fn report_leader(
        &self,
        stream: &str,
        partition: PartitionId,
        observer: BrokerId,
        leader: BrokerId,
        leader_epoch: LeaderEpoch,
    ) -> Result<(), ClusterError> {
        let Some(plane) = self.plane.upgrade() else {
            return Err(ClusterError::Closed);
        };
        plane
            .report_leader(stream, partition, observer, leader, leader_epoch)
            .await
            .map_err(into_cluster_error)
    }
}

fn into_cluster_error(err: MetaError) -> ClusterError {
    match err {
        MetaError::Cluster(inner) => inner,
        other => ClusterError::Bus {
            message: other.to_string(),
        },
    }
}

// ---- Server loops ---------------------------------------------------------

async fn propagate_loop(
    plane: Weak<MetadataPlane>,
    mut sub: Subscription,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            _ = closed.changed() => return,
            msg = sub.recv() => msg,
        };
        let Some(msg) = msg else { return };
        let Some(plane) = plane.upgrade() else { return };
        let Some(reply) = msg.reply else { continue };

        tokio::spawn(async move {
            let result = match PropagatedRequest::decode(msg.data)
                .map_err(MetaError::Cluster)
                .and_then(|req| PropagatedOp::decode(req.data))
            {
                Ok(op) => {
                    if plane.consensus.is_leader() {
                        plane.dispatch_local(op).await
                    } else {
                        Err(MetaError::NotMetadataLeader)
                    }
                }
                Err(e) => Err(e),
            };
            let response = match result {
                Ok(()) => PropagatedResponse::ok(),
                Err(e) => PropagatedResponse {
                    error: Some((e.code(), e.to_string())),
                },
            };
            reply.respond(response.encode());
        });
    }
}

async fn server_info_loop(
    plane: Weak<MetadataPlane>,
    mut sub: Subscription,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            _ = closed.changed() => return,
            msg = sub.recv() => msg,
        };
        let Some(msg) = msg else { return };
        let Some(plane) = plane.upgrade() else { return };
        let Some(reply) = msg.reply else { continue };
        if ServerInfoRequest::decode(msg.data).is_err() {
            continue;
        }
        let broker = plane.config.broker;
        let state = plane.state.read();
        let response = ServerInfoResponse {
            broker,
            partition_count: state.partition_load.get(&broker).copied().unwrap_or(0) as u64,
            leader_count: state.leader_load.get(&broker).copied().unwrap_or(0) as u64,
        };
        drop(state);
        reply.respond(response.encode());
    }
}

async fn status_loop(
    plane: Weak<MetadataPlane>,
    mut sub: Subscription,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            _ = closed.changed() => return,
            msg = sub.recv() => msg,
        };
        let Some(msg) = msg else { return };
        let Some(plane) = plane.upgrade() else { return };
        let Some(reply) = msg.reply else { continue };
        let Ok(request) = PartitionStatusRequest::decode(msg.data) else {
            continue;
        };
        let partition = plane.partition(&request.stream, request.partition);
        let response = PartitionStatusResponse {
            exists: partition.is_some(),
            is_leader: partition.is_some_and(|p| p.is_leader()),
        };
        reply.respond(response.encode());
    }
}
