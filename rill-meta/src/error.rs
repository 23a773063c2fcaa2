//! Metadata plane error types.
//!
//! Clients see these codes one-to-one; the numeric mapping is what travels
//! inside a propagated-request reply.

use rill_cluster::ClusterError;
use thiserror::Error;

/// Result type for metadata operations.
pub type MetaResult<T> = Result<T, MetaError>;

/// Errors surfaced by the metadata plane.
#[derive(Debug, Error)]
pub enum MetaError {
    /// The stream already exists.
    #[error("stream already exists")]
    StreamExists,

    /// The stream does not exist.
    #[error("stream does not exist")]
    StreamNotFound,

    /// The partition does not exist.
    #[error("partition does not exist")]
    PartitionNotFound,

    /// No in-sync replica is eligible to become leader.
    #[error("no ISR candidates for leader election")]
    NoIsrCandidates,

    /// The request carries a stale leader generation.
    #[error("leader generation mismatch: current {current_leader} epoch {current_epoch}, got {got_leader} epoch {got_epoch}")]
    LeaderGenerationMismatch {
        /// Current leader.
        current_leader: u64,
        /// Current leader epoch.
        current_epoch: u64,
        /// Leader named by the request.
        got_leader: u64,
        /// Epoch named by the request.
        got_epoch: u64,
    },

    /// Forwarding to the metadata leader timed out.
    #[error("timed out propagating request to the metadata leader")]
    PropagationTimeout,

    /// No metadata leader is currently known.
    #[error("this broker is not the metadata leader and none is known")]
    NotMetadataLeader,

    /// The request is malformed.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong.
        message: String,
    },

    /// The consensus log rejected or failed the proposal.
    #[error("consensus error: {message}")]
    Consensus {
        /// Description of the failure.
        message: String,
    },

    /// A replication plane operation failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl MetaError {
    /// Numeric code used on the wire for propagated replies.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::StreamExists => 1,
            Self::StreamNotFound => 2,
            Self::PartitionNotFound => 3,
            Self::NoIsrCandidates => 4,
            Self::LeaderGenerationMismatch { .. } => 5,
            Self::PropagationTimeout => 6,
            Self::NotMetadataLeader => 7,
            Self::InvalidArgument { .. } => 8,
            Self::Consensus { .. } => 9,
            Self::Cluster(_) => 10,
        }
    }

    /// Rebuilds an error from a wire code and message.
    #[must_use]
    pub fn from_code(code: u32, message: String) -> Self {
        match code {
            1 => Self::StreamExists,
            2 => Self::StreamNotFound,
            3 => Self::PartitionNotFound,
            4 => Self::NoIsrCandidates,
            5 => Self::Consensus {
                message: format!("leader generation mismatch: {message}"),
            },
            6 => Self::PropagationTimeout,
            7 => Self::NotMetadataLeader,
            8 => Self::InvalidArgument { message },
            _ => Self::Consensus { message },
        }
    }
}
