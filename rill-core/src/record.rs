//! Record types and the wire framing shared by disk and network.
//!
//! A [`Record`] is the fundamental unit of data in rill: a keyed, timestamped
//! payload stamped with the leader epoch it was written under.
//!
//! # Frame format
//!
//! Records are framed identically on disk and on the wire. All integers are
//! big-endian:
//!
//! ```text
//! +------------+--------+-----------+--------------+-----+-------+---------+-----+
//! | total_len  | offset | timestamp | leader_epoch | key | value | headers | crc |
//! |    u32     |  i64   |    i64    |     u64      |     |       |         | u32 |
//! +------------+--------+-----------+--------------+-----+-------+---------+-----+
//! ```
//!
//! `total_len` counts every byte after the length prefix, crc included, so a
//! reader can skip a frame without parsing it. Key and value are `u32`
//! length-prefixed; a length of `u32::MAX` encodes null. A record with a null
//! value is a tombstone: compaction drops all earlier records for its key.
//! The crc covers the payload between the length prefix and the crc field.
//!
//! # Message sets
//!
//! A message set is the concatenation of one or more frames written as one
//! atomic append. Offsets within a set are contiguous. Because frames are
//! self-delimiting, [`entries_for_message_set`] can recover per-record index
//! entries from raw bytes without re-encoding, which is how replicated data
//! is ingested verbatim on followers.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;
use crate::types::{LeaderEpoch, Offset};

/// Length-prefix sentinel for a null key or value.
const NULL_LEN: u32 = u32::MAX;

/// Fixed bytes in a frame payload: offset + timestamp + leader epoch +
/// key len + value len + header count.
const FIXED_PAYLOAD: usize = 8 + 8 + 8 + 4 + 4 + 4;

/// Bytes in a frame besides the payload: length prefix + trailing crc.
const FRAME_OVERHEAD: usize = 4 + 4;

/// A record header (key-value metadata).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Header key.
    pub key: Bytes,
    /// Header value.
    pub value: Bytes,
}

impl Header {
    /// Creates a new header.
    #[must_use]
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Returns the encoded size of this header.
    #[must_use]
    pub const fn encoded_size(&self) -> usize {
        4 + self.key.len() + 4 + self.value.len()
    }

    #[allow(clippy::cast_possible_truncation)] // Sizes bounded by frame limits.
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.key.len() as u32);
        buf.put_slice(&self.key);
        buf.put_u32(self.value.len() as u32);
        buf.put_slice(&self.value);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, FrameError> {
        let key = take_prefixed(buf)?.ok_or(FrameError::Truncated)?;
        let value = take_prefixed(buf)?.ok_or(FrameError::Truncated)?;
        Ok(Self { key, value })
    }
}

/// Timestamp type for records, in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from milliseconds since Unix epoch.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since Unix epoch.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Returns the current time as a timestamp.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Timestamps won't overflow i64 for centuries.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as i64)
    }

    /// Creates a timestamp representing "no timestamp".
    #[must_use]
    pub const fn none() -> Self {
        Self(-1)
    }

    /// Returns true if this represents "no timestamp".
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 < 0
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::none()
    }
}

/// A single record in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Offset in the partition (assigned by the leader at append).
    pub offset: Offset,
    /// Timestamp of the record. Broker-assigned at append when unset,
    /// producer-supplied otherwise.
    pub timestamp: Timestamp,
    /// Leader epoch the record was written under.
    pub leader_epoch: LeaderEpoch,
    /// Optional key for compaction.
    pub key: Option<Bytes>,
    /// The record payload. `None` marks a tombstone.
    pub value: Option<Bytes>,
    /// Optional headers.
    pub headers: Vec<Header>,
}

impl Record {
    /// Creates a new record with just a value.
    #[must_use]
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            offset: Offset::NONE,
            timestamp: Timestamp::none(),
            leader_epoch: LeaderEpoch::new(0),
            key: None,
            value: Some(value.into()),
            headers: Vec::new(),
        }
    }

    /// Creates a new record with key and value.
    #[must_use]
    pub fn with_key(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(value)
        }
    }

    /// Creates a tombstone record for the given key.
    #[must_use]
    pub fn tombstone(key: impl Into<Bytes>) -> Self {
        Self {
            offset: Offset::NONE,
            timestamp: Timestamp::none(),
            leader_epoch: LeaderEpoch::new(0),
            key: Some(key.into()),
            value: None,
            headers: Vec::new(),
        }
    }

    /// Sets the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }

    /// Returns true if this record is a tombstone (null value).
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Returns the encoded frame size in bytes, length prefix and crc
    /// included.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        let key_size = self.key.as_ref().map_or(0, Bytes::len);
        let value_size = self.value.as_ref().map_or(0, Bytes::len);
        let headers_size: usize = self.headers.iter().map(Header::encoded_size).sum();
        FRAME_OVERHEAD + FIXED_PAYLOAD + key_size + value_size + headers_size
    }

    /// Encodes the record as one frame.
    #[allow(clippy::cast_possible_truncation)] // Sizes bounded by frame limits.
    pub fn encode(&self, buf: &mut BytesMut) {
        let total_len = self.frame_size() - 4;
        buf.put_u32(total_len as u32);
        let payload_start = buf.len();

        buf.put_i64(self.offset.get());
        buf.put_i64(self.timestamp.as_millis());
        buf.put_u64(self.leader_epoch.get());
        put_prefixed(buf, self.key.as_deref());
        put_prefixed(buf, self.value.as_deref());
        buf.put_u32(self.headers.len() as u32);
        for header in &self.headers {
            header.encode(buf);
        }

        let crc = crc32fast::hash(&buf[payload_start..]);
        buf.put_u32(crc);
    }

    /// Decodes one frame, verifying length and crc.
    pub fn decode(buf: &mut Bytes) -> Result<Self, FrameError> {
        let mut payload = take_frame_payload(buf)?;

        let offset = Offset::new(payload.get_i64());
        let timestamp = Timestamp::from_millis(payload.get_i64());
        let leader_epoch = LeaderEpoch::new(payload.get_u64());
        let key = take_prefixed(&mut payload)?;
        let value = take_prefixed(&mut payload)?;

        if payload.remaining() < 4 {
            return Err(FrameError::Truncated);
        }
        let header_count = payload.get_u32() as usize;
        let mut headers = Vec::with_capacity(header_count.min(64));
        for _ in 0..header_count {
            headers.push(Header::decode(&mut payload)?);
        }

        Ok(Self {
            offset,
            timestamp,
            leader_epoch,
            key,
            value,
            headers,
        })
    }
}

/// Index-level metadata for one frame inside a message set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEntry {
    /// Offset carried by the frame.
    pub offset: Offset,
    /// Timestamp carried by the frame.
    pub timestamp: Timestamp,
    /// Leader epoch carried by the frame.
    pub leader_epoch: LeaderEpoch,
    /// Absolute file position of the frame start.
    pub position: u64,
    /// Total frame size in bytes, length prefix included.
    pub size: u32,
}

/// Encodes the given records as one contiguous message set.
#[must_use]
pub fn encode_message_set(records: &[Record]) -> Bytes {
    let size: usize = records.iter().map(Record::frame_size).sum();
    let mut buf = BytesMut::with_capacity(size);
    for record in records {
        record.encode(&mut buf);
    }
    buf.freeze()
}

/// Recovers per-frame index entries from raw message-set bytes.
///
/// `base_position` is the file position the set will be written at; it is
/// added to each entry's relative position. Frames are validated (length
/// bounds and crc) but not fully decoded.
#[allow(clippy::cast_possible_truncation)] // Frame sizes fit in u32 by construction.
pub fn entries_for_message_set(
    base_position: u64,
    data: &[u8],
) -> Result<Vec<FrameEntry>, FrameError> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        let remaining = &data[pos..];
        if remaining.len() < 4 {
            return Err(FrameError::Truncated);
        }
        let total_len = u32::from_be_bytes([remaining[0], remaining[1], remaining[2], remaining[3]])
            as usize;
        if total_len < FIXED_PAYLOAD + 4 || remaining.len() < 4 + total_len {
            return Err(FrameError::Truncated);
        }

        let payload = &remaining[4..4 + total_len - 4];
        let crc = u32::from_be_bytes([
            remaining[total_len],
            remaining[total_len + 1],
            remaining[total_len + 2],
            remaining[total_len + 3],
        ]);
        if crc32fast::hash(payload) != crc {
            return Err(FrameError::ChecksumMismatch {
                expected: crc,
                actual: crc32fast::hash(payload),
            });
        }

        let offset = i64::from_be_bytes(payload[0..8].try_into().expect("slice is 8 bytes"));
        let timestamp = i64::from_be_bytes(payload[8..16].try_into().expect("slice is 8 bytes"));
        let epoch = u64::from_be_bytes(payload[16..24].try_into().expect("slice is 8 bytes"));

        entries.push(FrameEntry {
            offset: Offset::new(offset),
            timestamp: Timestamp::from_millis(timestamp),
            leader_epoch: LeaderEpoch::new(epoch),
            position: base_position + pos as u64,
            size: (4 + total_len) as u32,
        });
        pos += 4 + total_len;
    }

    Ok(entries)
}

#[allow(clippy::cast_possible_truncation)] // Sizes bounded by frame limits.
fn put_prefixed(buf: &mut BytesMut, bytes: Option<&[u8]>) {
    match bytes {
        Some(b) => {
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
        }
        None => buf.put_u32(NULL_LEN),
    }
}

fn take_prefixed(buf: &mut Bytes) -> Result<Option<Bytes>, FrameError> {
    if buf.remaining() < 4 {
        return Err(FrameError::Truncated);
    }
    let len = buf.get_u32();
    if len == NULL_LEN {
        return Ok(None);
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(FrameError::Truncated);
    }
    Ok(Some(buf.copy_to_bytes(len)))
}

/// Splits one frame payload off the front of `buf`, verifying the crc.
fn take_frame_payload(buf: &mut Bytes) -> Result<Bytes, FrameError> {
    if buf.remaining() < 4 {
        return Err(FrameError::Truncated);
    }
    let total_len = buf.get_u32() as usize;
    if total_len < FIXED_PAYLOAD + 4 || buf.remaining() < total_len {
        return Err(FrameError::Truncated);
    }
    let payload = buf.copy_to_bytes(total_len - 4);
    let expected = buf.get_u32();
    let actual = crc32fast::hash(&payload);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let original = Record::with_key("key", "value")
            .with_timestamp(Timestamp::from_millis(1_234_567_890))
            .with_header("h1", "v1");

        let mut buf = BytesMut::new();
        original.encode(&mut buf);
        assert_eq!(buf.len(), original.frame_size());

        let decoded = Record::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.key, original.key);
        assert_eq!(decoded.value, original.value);
        assert_eq!(decoded.timestamp, original.timestamp);
        assert_eq!(decoded.headers.len(), 1);
    }

    #[test]
    fn test_tombstone_roundtrip() {
        let original = Record::tombstone("gone");

        let mut buf = BytesMut::new();
        original.encode(&mut buf);

        let decoded = Record::decode(&mut buf.freeze()).unwrap();
        assert!(decoded.is_tombstone());
        assert_eq!(decoded.key, Some(Bytes::from("gone")));
    }

    #[test]
    fn test_null_key_roundtrip() {
        let original = Record::new("value");

        let mut buf = BytesMut::new();
        original.encode(&mut buf);

        let decoded = Record::decode(&mut buf.freeze()).unwrap();
        assert!(decoded.key.is_none());
        assert_eq!(decoded.value, original.value);
    }

    #[test]
    fn test_corrupt_crc_rejected() {
        let record = Record::new("value");
        let mut buf = BytesMut::new();
        record.encode(&mut buf);

        // Flip a payload byte.
        let mid = buf.len() / 2;
        buf[mid] ^= 0xff;

        let err = Record::decode(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let record = Record::new("value");
        let mut buf = BytesMut::new();
        record.encode(&mut buf);

        let mut short = buf.freeze();
        short.truncate(short.len() - 2);
        assert!(matches!(
            Record::decode(&mut short),
            Err(FrameError::Truncated)
        ));
    }

    #[test]
    fn test_message_set_entries() {
        let mut records = Vec::new();
        for i in 0..3i64 {
            let mut r = Record::new(format!("value-{i}"))
                .with_timestamp(Timestamp::from_millis(100 + i));
            r.offset = Offset::new(10 + i);
            r.leader_epoch = LeaderEpoch::new(2);
            records.push(r);
        }

        let set = encode_message_set(&records);
        let entries = entries_for_message_set(500, &set).unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].offset, Offset::new(10));
        assert_eq!(entries[0].position, 500);
        assert_eq!(entries[2].offset, Offset::new(12));
        assert_eq!(entries[1].timestamp, Timestamp::from_millis(101));
        assert_eq!(entries[2].leader_epoch, LeaderEpoch::new(2));

        // Positions are contiguous: each entry starts where the previous ended.
        assert_eq!(
            entries[1].position,
            entries[0].position + u64::from(entries[0].size)
        );

        let total: u64 = entries.iter().map(|e| u64::from(e.size)).sum();
        assert_eq!(total, set.len() as u64);
    }

    #[test]
    fn test_entries_reject_torn_set() {
        let records = vec![Record::new("one"), Record::new("two")];
        let set = encode_message_set(&records);
        let torn = &set[..set.len() - 3];
        assert!(entries_for_message_set(0, torn).is_err());
    }
}
