//! Replication plane error types.

use rill_log::LogError;
use thiserror::Error;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that can occur in the replication plane.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The operation requires partition leadership this broker lacks.
    #[error("this broker is not the partition leader")]
    NotLeader,

    /// The partition is paused.
    #[error("partition is paused")]
    Paused,

    /// The ISR has shrunk below the configured minimum.
    #[error("ISR size {isr} below minimum {min}")]
    InsufficientIsr {
        /// Current ISR size.
        isr: usize,
        /// Configured minimum.
        min: usize,
    },

    /// A cross-broker call exceeded its deadline.
    #[error("timed out waiting for {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
    },

    /// Nobody is subscribed to the request subject.
    #[error("no responders on {subject}")]
    NoResponders {
        /// The request subject.
        subject: String,
    },

    /// A wire envelope failed to decode.
    #[error("bad envelope: {message}")]
    Codec {
        /// What failed to decode.
        message: String,
    },

    /// The underlying bus failed.
    #[error("message bus error: {message}")]
    Bus {
        /// Description of the failure.
        message: String,
    },

    /// The log (or a waiter on it) was closed out from under the caller.
    #[error("partition is closed")]
    Closed,

    /// A readonly log was consumed through its end.
    #[error("end of readonly log")]
    EndOfReadonlyLog,

    /// A commit log operation failed.
    #[error(transparent)]
    Log(#[from] LogError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_error_wraps() {
        let err: ClusterError = LogError::Readonly.into();
        assert!(matches!(err, ClusterError::Log(LogError::Readonly)));
    }
}
