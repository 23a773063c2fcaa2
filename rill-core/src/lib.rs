//! Core types for rill, a partitioned, replicated message log.
//!
//! This crate holds the pieces every other rill crate agrees on:
//!
//! - Strongly-typed identifiers ([`BrokerId`], [`PartitionId`], [`LeaderEpoch`])
//! - The [`Offset`] type with its `-1` "empty" sentinel
//! - The [`Record`] wire codec and message-set framing
//!
//! It performs no I/O and has no async surface.

pub mod error;
pub mod record;
pub mod types;

pub use error::FrameError;
pub use record::{
    encode_message_set, entries_for_message_set, FrameEntry, Header, Record, Timestamp,
};
pub use types::{BrokerId, LeaderEpoch, Offset, PartitionId, WaiterId};
