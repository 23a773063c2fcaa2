//! Commit log error types.
//!
//! All errors are explicit and typed. No string errors except for
//! corruption detail, which is diagnostic only.

use rill_core::{FrameError, Offset};
use thiserror::Error;

/// Result type for commit log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors that can occur during commit log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// No segment covers the requested offset.
    #[error("no segment contains offset {offset}")]
    SegmentNotFound {
        /// The requested offset.
        offset: Offset,
    },

    /// No index entry satisfies the lookup.
    #[error("no entry found for {lookup}")]
    EntryNotFound {
        /// What was being looked up.
        lookup: &'static str,
    },

    /// Another writer rolled the segment first. Callers retry against the
    /// new active segment.
    #[error("segment already exists")]
    SegmentExists,

    /// The segment was sealed between the roll check and the write.
    /// Callers retry against the new active segment.
    #[error("segment is sealed")]
    SegmentSealed,

    /// Optimistic concurrency control mismatch.
    #[error("incorrect offset: expected {expected}, log end is {next}")]
    IncorrectOffset {
        /// Offset the caller expected to write at.
        expected: Offset,
        /// The actual next offset.
        next: Offset,
    },

    /// The log is in readonly mode and rejects producer appends.
    #[error("commit log is readonly")]
    Readonly,

    /// Leader epoch assignment would violate monotonicity.
    #[error("leader epoch {epoch} not greater than last epoch {last}")]
    EpochMonotonicity {
        /// Epoch being assigned.
        epoch: u64,
        /// Last assigned epoch.
        last: u64,
    },

    /// On-disk data failed validation.
    #[error("corrupt log data: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// I/O error from the filesystem.
    #[error("I/O error during {operation}: {source}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl LogError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }

    /// Returns true if the caller should reload the active segment and
    /// retry the operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::SegmentExists | Self::SegmentSealed)
    }
}

impl From<FrameError> for LogError {
    fn from(err: FrameError) -> Self {
        Self::Corruption {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LogError::IncorrectOffset {
            expected: Offset::new(5),
            next: Offset::new(9),
        };
        let msg = format!("{err}");
        assert!(msg.contains('5'));
        assert!(msg.contains('9'));
    }

    #[test]
    fn test_retryable() {
        assert!(LogError::SegmentExists.is_retryable());
        assert!(LogError::SegmentSealed.is_retryable());
        assert!(!LogError::Readonly.is_retryable());
    }
}
