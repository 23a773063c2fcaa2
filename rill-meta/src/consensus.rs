//! Consensus-log seam.
//!
//! Every metadata mutation is a [`MetadataOp`] proposed to an external
//! consensus engine and applied to each broker's registry inside the
//! consensus apply path. The [`ConsensusLog`] trait is what the metadata
//! plane sees of that engine; [`LocalConsensus`] is the in-process
//! implementation used by tests and single-node deployments, applying
//! committed entries to every registered applier in proposal order.
//!
//! Ops are also the payload of propagated requests, so they carry a full
//! big-endian codec.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rill_core::{BrokerId, LeaderEpoch, PartitionId};

use crate::error::{MetaError, MetaResult};

/// Per-stream configuration carried by create operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Number of replicas per partition. `0` means "every broker".
    pub replication_factor: u64,
}

/// Placement of one partition, filled in by the metadata leader before the
/// create proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    /// Partition ID.
    pub id: PartitionId,
    /// Replica set.
    pub replicas: Vec<BrokerId>,
    /// Initial in-sync set (all replicas at creation).
    pub isr: Vec<BrokerId>,
    /// Initial leader.
    pub leader: Option<BrokerId>,
    /// Initial leader epoch.
    pub leader_epoch: LeaderEpoch,
    /// Initial metadata epoch fence.
    pub epoch: u64,
    /// True when the partition starts paused.
    pub paused: bool,
}

/// Full stream specification carried by a create proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    /// Stream name.
    pub name: String,
    /// Subject records are published under.
    pub subject: String,
    /// Stream configuration.
    pub config: StreamConfig,
    /// Partition placements.
    pub partitions: Vec<PartitionSpec>,
    /// Creation time in millis, stamped by the metadata leader.
    pub creation_time: i64,
}

/// The tagged union of metadata mutations replicated through consensus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataOp {
    /// Create a stream with placed partitions.
    CreateStream {
        /// The stream to create.
        spec: StreamSpec,
    },
    /// Delete a stream and its data.
    DeleteStream {
        /// Stream name.
        stream: String,
    },
    /// Pause the given partitions (all when empty).
    PauseStream {
        /// Stream name.
        stream: String,
        /// Partitions to pause; empty means all.
        partitions: Vec<PartitionId>,
    },
    /// Resume the given partitions.
    ResumeStream {
        /// Stream name.
        stream: String,
        /// Partitions to resume.
        partitions: Vec<PartitionId>,
    },
    /// Remove a replica from a partition's ISR.
    ShrinkIsr {
        /// Stream name.
        stream: String,
        /// Partition ID.
        partition: PartitionId,
        /// Replica to remove.
        replica: BrokerId,
        /// Leader named by the requester (generation check).
        leader: BrokerId,
        /// Leader epoch named by the requester.
        leader_epoch: LeaderEpoch,
        /// New metadata epoch, assigned by the proposer.
        epoch: u64,
    },
    /// Add a replica back to a partition's ISR.
    ExpandIsr {
        /// Stream name.
        stream: String,
        /// Partition ID.
        partition: PartitionId,
        /// Replica to add.
        replica: BrokerId,
        /// Leader named by the requester (generation check).
        leader: BrokerId,
        /// Leader epoch named by the requester.
        leader_epoch: LeaderEpoch,
        /// New metadata epoch, assigned by the proposer.
        epoch: u64,
    },
    /// Move partition leadership.
    ChangeLeader {
        /// Stream name.
        stream: String,
        /// Partition ID.
        partition: PartitionId,
        /// The new leader.
        leader: BrokerId,
        /// The new leader epoch.
        leader_epoch: LeaderEpoch,
        /// New metadata epoch, assigned by the proposer.
        epoch: u64,
    },
    /// Flip the readonly flag on partitions (all when empty).
    SetStreamReadonly {
        /// Stream name.
        stream: String,
        /// Partitions to change; empty means all.
        partitions: Vec<PartitionId>,
        /// The new readonly state.
        readonly: bool,
    },
}

const OP_CREATE: u8 = 0;
const OP_DELETE: u8 = 1;
const OP_PAUSE: u8 = 2;
const OP_RESUME: u8 = 3;
const OP_SHRINK: u8 = 4;
const OP_EXPAND: u8 = 5;
const OP_CHANGE_LEADER: u8 = 6;
const OP_SET_READONLY: u8 = 7;

fn put_string(buf: &mut BytesMut, s: &str) {
    #[allow(clippy::cast_possible_truncation)] // Names are short.
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes) -> MetaResult<String> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    String::from_utf8(buf.copy_to_bytes(len).to_vec()).map_err(|_| MetaError::InvalidArgument {
        message: "invalid utf-8 in metadata op".to_string(),
    })
}

fn put_ids(buf: &mut BytesMut, ids: &[PartitionId]) {
    #[allow(clippy::cast_possible_truncation)] // Partition counts are small.
    buf.put_u32(ids.len() as u32);
    for id in ids {
        buf.put_u64(id.get());
    }
}

fn get_ids(buf: &mut Bytes) -> MetaResult<Vec<PartitionId>> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let count = buf.get_u32() as usize;
    if buf.remaining() < count * 8 {
        return Err(truncated());
    }
    Ok((0..count).map(|_| PartitionId::new(buf.get_u64())).collect())
}

fn put_brokers(buf: &mut BytesMut, brokers: &[BrokerId]) {
    #[allow(clippy::cast_possible_truncation)] // Replica sets are small.
    buf.put_u32(brokers.len() as u32);
    for broker in brokers {
        buf.put_u64(broker.get());
    }
}

fn get_brokers(buf: &mut Bytes) -> MetaResult<Vec<BrokerId>> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let count = buf.get_u32() as usize;
    if buf.remaining() < count * 8 {
        return Err(truncated());
    }
    Ok((0..count).map(|_| BrokerId::new(buf.get_u64())).collect())
}

fn need(buf: &Bytes, bytes: usize) -> MetaResult<()> {
    if buf.remaining() < bytes {
        return Err(truncated());
    }
    Ok(())
}

fn truncated() -> MetaError {
    MetaError::InvalidArgument {
        message: "truncated metadata op".to_string(),
    }
}

impl MetadataOp {
    /// Encodes the operation for consensus and propagation.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::CreateStream { spec } => {
                buf.put_u8(OP_CREATE);
                put_string(&mut buf, &spec.name);
                put_string(&mut buf, &spec.subject);
                buf.put_u64(spec.config.replication_factor);
                buf.put_i64(spec.creation_time);
                #[allow(clippy::cast_possible_truncation)] // Partition counts are small.
                buf.put_u32(spec.partitions.len() as u32);
                for partition in &spec.partitions {
                    buf.put_u64(partition.id.get());
                    put_brokers(&mut buf, &partition.replicas);
                    put_brokers(&mut buf, &partition.isr);
                    buf.put_u64(partition.leader.map_or(u64::MAX, BrokerId::get));
                    buf.put_u64(partition.leader_epoch.get());
                    buf.put_u64(partition.epoch);
                    buf.put_u8(u8::from(partition.paused));
                }
            }
            Self::DeleteStream { stream } => {
                buf.put_u8(OP_DELETE);
                put_string(&mut buf, stream);
            }
            Self::PauseStream { stream, partitions } => {
                buf.put_u8(OP_PAUSE);
                put_string(&mut buf, stream);
                put_ids(&mut buf, partitions);
            }
            Self::ResumeStream { stream, partitions } => {
                buf.put_u8(OP_RESUME);
                put_string(&mut buf, stream);
                put_ids(&mut buf, partitions);
            }
            Self::ShrinkIsr {
                stream,
                partition,
                replica,
                leader,
                leader_epoch,
                epoch,
            }
            | Self::ExpandIsr {
                stream,
                partition,
                replica,
                leader,
                leader_epoch,
                epoch,
            } => {
                buf.put_u8(if matches!(self, Self::ShrinkIsr { .. }) {
                    OP_SHRINK
                } else {
                    OP_EXPAND
                });
                put_string(&mut buf, stream);
                buf.put_u64(partition.get());
                buf.put_u64(replica.get());
                buf.put_u64(leader.get());
                buf.put_u64(leader_epoch.get());
                buf.put_u64(*epoch);
            }
            Self::ChangeLeader {
                stream,
                partition,
                leader,
                leader_epoch,
                epoch,
            } => {
                buf.put_u8(OP_CHANGE_LEADER);
                put_string(&mut buf, stream);
                buf.put_u64(partition.get());
                buf.put_u64(leader.get());
                buf.put_u64(leader_epoch.get());
                buf.put_u64(*epoch);
            }
            Self::SetStreamReadonly {
                stream,
                partitions,
                readonly,
            } => {
                buf.put_u8(OP_SET_READONLY);
                put_string(&mut buf, stream);
                put_ids(&mut buf, partitions);
                buf.put_u8(u8::from(*readonly));
            }
        }
        buf.freeze()
    }

    /// Decodes an operation.
    pub fn decode(mut buf: Bytes) -> MetaResult<Self> {
        need(&buf, 1)?;
        let tag = buf.get_u8();
        match tag {
            OP_CREATE => {
                let name = get_string(&mut buf)?;
                let subject = get_string(&mut buf)?;
                need(&buf, 20)?;
                let replication_factor = buf.get_u64();
                let creation_time = buf.get_i64();
                let count = buf.get_u32() as usize;
                let mut partitions = Vec::with_capacity(count);
                for _ in 0..count {
                    need(&buf, 8)?;
                    let id = PartitionId::new(buf.get_u64());
                    let replicas = get_brokers(&mut buf)?;
                    let isr = get_brokers(&mut buf)?;
                    need(&buf, 25)?;
                    let leader_raw = buf.get_u64();
                    let leader = (leader_raw != u64::MAX).then(|| BrokerId::new(leader_raw));
                    let leader_epoch = LeaderEpoch::new(buf.get_u64());
                    let epoch = buf.get_u64();
                    let paused = buf.get_u8() != 0;
                    partitions.push(PartitionSpec {
                        id,
                        replicas,
                        isr,
                        leader,
                        leader_epoch,
                        epoch,
                        paused,
                    });
                }
                Ok(Self::CreateStream {
                    spec: StreamSpec {
                        name,
                        subject,
                        config: StreamConfig { replication_factor },
                        partitions,
                        creation_time,
                    },
                })
            }
            OP_DELETE => Ok(Self::DeleteStream {
                stream: get_string(&mut buf)?,
            }),
            OP_PAUSE => Ok(Self::PauseStream {
                stream: get_string(&mut buf)?,
                partitions: get_ids(&mut buf)?,
            }),
            OP_RESUME => Ok(Self::ResumeStream {
                stream: get_string(&mut buf)?,
                partitions: get_ids(&mut buf)?,
            }),
            OP_SHRINK | OP_EXPAND => {
                let stream = get_string(&mut buf)?;
                need(&buf, 40)?;
                let partition = PartitionId::new(buf.get_u64());
                let replica = BrokerId::new(buf.get_u64());
                let leader = BrokerId::new(buf.get_u64());
                let leader_epoch = LeaderEpoch::new(buf.get_u64());
                let epoch = buf.get_u64();
                if tag == OP_SHRINK {
                    Ok(Self::ShrinkIsr {
                        stream,
                        partition,
                        replica,
                        leader,
                        leader_epoch,
                        epoch,
                    })
                } else {
                    Ok(Self::ExpandIsr {
                        stream,
                        partition,
                        replica,
                        leader,
                        leader_epoch,
                        epoch,
                    })
                }
            }
            OP_CHANGE_LEADER => {
                let stream = get_string(&mut buf)?;
                need(&buf, 32)?;
                Ok(Self::ChangeLeader {
                    stream,
                    partition: PartitionId::new(buf.get_u64()),
                    leader: BrokerId::new(buf.get_u64()),
                    leader_epoch: LeaderEpoch::new(buf.get_u64()),
                    epoch: buf.get_u64(),
                })
            }
            OP_SET_READONLY => {
                let stream = get_string(&mut buf)?;
                let partitions = get_ids(&mut buf)?;
                need(&buf, 1)?;
                Ok(Self::SetStreamReadonly {
                    stream,
                    partitions,
                    readonly: buf.get_u8() != 0,
                })
            }
            other => Err(MetaError::InvalidArgument {
                message: format!("unknown metadata op tag {other}"),
            }),
        }
    }

    /// Returns the stream the operation targets.
    #[must_use]
    pub fn stream(&self) -> &str {
        match self {
            Self::CreateStream { spec } => &spec.name,
            Self::DeleteStream { stream }
            | Self::PauseStream { stream, .. }
            | Self::ResumeStream { stream, .. }
            | Self::ShrinkIsr { stream, .. }
            | Self::ExpandIsr { stream, .. }
            | Self::ChangeLeader { stream, .. }
            | Self::SetStreamReadonly { stream, .. } => stream,
        }
    }
}

/// A broker's registry, applied to from the consensus commit path.
pub trait ConsensusApplier: Send + Sync + 'static {
    /// Applies one committed operation. `recovered` marks entries replayed
    /// from a persisted consensus log during startup.
    fn apply(&self, op: &MetadataOp, recovered: bool);
}

/// What the metadata plane sees of the external consensus engine.
#[async_trait]
pub trait ConsensusLog: Send + Sync + 'static {
    /// True if this broker currently leads the metadata group.
    fn is_leader(&self) -> bool;

    /// The current metadata leader, if known.
    fn leader_id(&self) -> Option<BrokerId>;

    /// Current cluster membership.
    fn members(&self) -> Vec<BrokerId>;

    /// Proposes an operation and waits until it is committed and applied.
    async fn propose(&self, op: MetadataOp) -> MetaResult<()>;

    /// Waits until every previously committed entry has been applied
    /// locally.
    async fn barrier(&self) -> MetaResult<()>;
}

#[derive(Default)]
struct LocalConsensusShared {
    leader: Mutex<Option<BrokerId>>,
    appliers: Mutex<HashMap<BrokerId, Weak<dyn ConsensusApplier>>>,
    members: Mutex<Vec<BrokerId>>,
    /// Every committed entry, in order. Replayed into brokers that join
    /// (or rejoin) the group, standing in for a persisted consensus log.
    log: Mutex<Vec<MetadataOp>>,
    /// Serializes commits so every member observes the same order.
    commit: Mutex<()>,
}

/// In-process consensus shared by every broker in a test cluster.
///
/// Proposals are serialized and applied synchronously to all registered
/// appliers, giving the same observable semantics as a replicated state
/// machine with instant commit.
#[derive(Clone, Default)]
pub struct LocalConsensus {
    shared: Arc<LocalConsensusShared>,
}

impl LocalConsensus {
    /// Creates an empty consensus group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a broker and its applier to the group, replaying the committed
    /// history into it first (recovery). The first member becomes the
    /// metadata leader.
    pub fn register(&self, broker: BrokerId, applier: Weak<dyn ConsensusApplier>) {
        if let Some(live) = applier.upgrade() {
            let history = self.shared.log.lock().clone();
            for op in &history {
                live.apply(op, true);
            }
        }
        self.shared.appliers.lock().insert(broker, applier);
        let mut members = self.shared.members.lock();
        if !members.contains(&broker) {
            members.push(broker);
            members.sort_unstable();
        }
        let mut leader = self.shared.leader.lock();
        if leader.is_none() {
            *leader = Some(broker);
        }
    }

    /// Removes a broker from the group, e.g. to simulate a crash. If it was
    /// the metadata leader, leadership moves to the lowest surviving
    /// member.
    pub fn remove(&self, broker: BrokerId) {
        self.shared.appliers.lock().remove(&broker);
        let mut members = self.shared.members.lock();
        members.retain(|b| *b != broker);
        let mut leader = self.shared.leader.lock();
        if *leader == Some(broker) {
            *leader = members.first().copied();
        }
    }

    /// Forces metadata leadership onto `broker`.
    pub fn set_leader(&self, broker: BrokerId) {
        *self.shared.leader.lock() = Some(broker);
    }

    /// Returns a per-broker view of the group.
    #[must_use]
    pub fn view(&self, broker: BrokerId) -> LocalConsensusView {
        LocalConsensusView {
            shared: self.shared.clone(),
            broker,
        }
    }
}

/// One broker's handle onto a [`LocalConsensus`] group.
#[derive(Clone)]
pub struct LocalConsensusView {
    shared: Arc<LocalConsensusShared>,
    broker: BrokerId,
}

#[async_trait]
impl ConsensusLog for LocalConsensusView {
    fn is_leader(&self) -> bool {
        *self.shared.leader.lock() == Some(self.broker)
    }

    fn leader_id(&self) -> Option<BrokerId> {
        *self.shared.leader.lock()
    }

    fn members(&self) -> Vec<BrokerId> {
        self.shared.members.lock().clone()
    }

    async fn propose(&self, op: MetadataOp) -> MetaResult<()> {
        if !self.is_leader() {
            return Err(MetaError::NotMetadataLeader);
        }
        let _commit = self.shared.commit.lock();
        let appliers: Vec<Arc<dyn ConsensusApplier>> = {
            let appliers = self.shared.appliers.lock();
            appliers.values().filter_map(Weak::upgrade).collect()
        };
        self.shared.log.lock().push(op.clone());
        // Commit is instantaneous here; apply on each member, as a
        // replicated state machine would.
        for applier in appliers {
            applier.apply(&op, false);
        }
        Ok(())
    }

    async fn barrier(&self) -> MetaResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_roundtrip_create() {
        let op = MetadataOp::CreateStream {
            spec: StreamSpec {
                name: "orders".to_string(),
                subject: "orders.events".to_string(),
                config: StreamConfig {
                    replication_factor: 3,
                },
                partitions: vec![PartitionSpec {
                    id: PartitionId::new(0),
                    replicas: vec![BrokerId::new(1), BrokerId::new(2)],
                    isr: vec![BrokerId::new(1), BrokerId::new(2)],
                    leader: Some(BrokerId::new(1)),
                    leader_epoch: LeaderEpoch::new(1),
                    epoch: 1,
                    paused: false,
                }],
                creation_time: 12345,
            },
        };
        assert_eq!(MetadataOp::decode(op.encode()).unwrap(), op);
    }

    #[test]
    fn test_op_roundtrip_isr_and_leader() {
        let shrink = MetadataOp::ShrinkIsr {
            stream: "orders".to_string(),
            partition: PartitionId::new(1),
            replica: BrokerId::new(3),
            leader: BrokerId::new(1),
            leader_epoch: LeaderEpoch::new(2),
            epoch: 7,
        };
        assert_eq!(MetadataOp::decode(shrink.encode()).unwrap(), shrink);

        let change = MetadataOp::ChangeLeader {
            stream: "orders".to_string(),
            partition: PartitionId::new(1),
            leader: BrokerId::new(2),
            leader_epoch: LeaderEpoch::new(3),
            epoch: 8,
        };
        assert_eq!(MetadataOp::decode(change.encode()).unwrap(), change);
    }

    #[test]
    fn test_local_consensus_leadership() {
        let consensus = LocalConsensus::new();
        struct Nop;
        impl ConsensusApplier for Nop {
            fn apply(&self, _: &MetadataOp, _: bool) {}
        }
        let nop: Arc<dyn ConsensusApplier> = Arc::new(Nop);

        consensus.register(BrokerId::new(1), Arc::downgrade(&nop));
        consensus.register(BrokerId::new(2), Arc::downgrade(&nop));

        assert!(consensus.view(BrokerId::new(1)).is_leader());
        assert!(!consensus.view(BrokerId::new(2)).is_leader());

        consensus.remove(BrokerId::new(1));
        assert!(consensus.view(BrokerId::new(2)).is_leader());
    }
}
