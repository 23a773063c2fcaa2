//! Durable, segmented commit log for one partition.
//!
//! This crate implements the storage half of rill: a file-backed
//! write-ahead log with offset/timestamp indexing, retention and optional
//! key compaction, a leader-epoch cache for truncation safety, and
//! high-watermark bookkeeping with one-shot waiters for committed reads.
//!
//! # Storage layout
//!
//! One directory per partition:
//!
//! ```text
//! {base_offset:020}.log            framed message sets
//! {base_offset:020}.index          16-byte sparse index entries
//! replication-offset-checkpoint    ASCII high watermark
//! leader-epochs                    "{epoch} {start_offset}" per line
//! ```
//!
//! See [`CommitLog`] for the public contract.

pub mod cleaner;
pub mod config;
pub mod epoch;
pub mod error;
pub mod index;
pub mod log;
pub mod segment;

pub use cleaner::RetentionPolicy;
pub use config::LogConfig;
pub use epoch::{EpochCache, EpochEntry, EPOCH_FILE_NAME};
pub use error::{LogError, LogResult};
pub use log::{CommitLog, HW_CHECKPOINT_FILE_NAME};
pub use segment::{Segment, SegmentScanner};
