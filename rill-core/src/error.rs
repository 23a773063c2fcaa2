//! Frame codec errors.

/// Errors from encoding or decoding record frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer ended before a complete frame was read.
    Truncated,
    /// The frame crc did not match the payload.
    ChecksumMismatch {
        /// Crc carried by the frame.
        expected: u32,
        /// Crc computed over the payload.
        actual: u32,
    },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated record frame"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "crc mismatch: expected {expected:08x}, got {actual:08x}")
            }
        }
    }
}

impl std::error::Error for FrameError {}
