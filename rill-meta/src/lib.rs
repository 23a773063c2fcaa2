//! Cluster metadata plane for rill.
//!
//! Manages stream and partition lifecycle, ISR membership, per-partition
//! leader election and load-aware placement, layered over an external
//! consensus log. Brokers that are not the metadata leader forward
//! requests over the message bus and wait for the decision.
//!
//! The [`consensus`] module defines the [`ConsensusLog`] seam plus the
//! [`MetadataOp`] entry union; [`metadata`] holds the plane itself.

pub mod consensus;
pub mod error;
pub mod metadata;

pub use consensus::{
    ConsensusApplier, ConsensusLog, LocalConsensus, LocalConsensusView, MetadataOp, PartitionSpec,
    StreamConfig, StreamSpec,
};
pub use error::{MetaError, MetaResult};
pub use metadata::{
    BrokerInfo, CreateStreamRequest, MetadataConfig, MetadataPlane, MetadataResponse,
    StreamMetadata,
};
