//! Inter-broker RPC envelopes.
//!
//! Request/reply pairs exchanged over the message bus, with hand-rolled
//! big-endian codecs matching the record frame conventions. Subjects are
//! derived from stream, partition and broker identity by the helpers at the
//! bottom of this module.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rill_core::{BrokerId, LeaderEpoch, Offset, PartitionId};

use crate::error::{ClusterError, ClusterResult};

fn put_string(buf: &mut BytesMut, s: &str) {
    #[allow(clippy::cast_possible_truncation)] // Subjects and names are short.
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes) -> ClusterResult<String> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| ClusterError::Codec {
        message: "invalid utf-8 string".to_string(),
    })
}

fn get_bytes(buf: &mut Bytes) -> ClusterResult<Bytes> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    Ok(buf.copy_to_bytes(len))
}

fn need(buf: &Bytes, bytes: usize) -> ClusterResult<()> {
    if buf.remaining() < bytes {
        return Err(truncated());
    }
    Ok(())
}

fn truncated() -> ClusterError {
    ClusterError::Codec {
        message: "truncated envelope".to_string(),
    }
}

/// Follower → leader pull of records since an offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationRequest {
    /// The fetching replica.
    pub replica: BrokerId,
    /// First offset the follower wants (its log end offset).
    pub offset: Offset,
    /// The follower's latest leader epoch.
    pub leader_epoch: LeaderEpoch,
}

impl ReplicationRequest {
    /// Encodes the request.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_u64(self.replica.get());
        buf.put_i64(self.offset.get());
        buf.put_u64(self.leader_epoch.get());
        buf.freeze()
    }

    /// Decodes a request.
    pub fn decode(mut buf: Bytes) -> ClusterResult<Self> {
        need(&buf, 24)?;
        Ok(Self {
            replica: BrokerId::new(buf.get_u64()),
            offset: Offset::new(buf.get_i64()),
            leader_epoch: LeaderEpoch::new(buf.get_u64()),
        })
    }
}

/// Leader → follower reply carrying raw message-set bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationResponse {
    /// False when the queried broker is not (or no longer) the leader.
    pub ok: bool,
    /// The leader's current epoch.
    pub leader_epoch: LeaderEpoch,
    /// The leader's high watermark.
    pub hw: Offset,
    /// Framed records starting at the requested offset; may be empty.
    pub data: Bytes,
}

impl ReplicationResponse {
    /// A "not the leader" reply.
    #[must_use]
    pub fn not_leader() -> Self {
        Self {
            ok: false,
            leader_epoch: LeaderEpoch::new(0),
            hw: Offset::NONE,
            data: Bytes::new(),
        }
    }

    /// Encodes the response.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(21 + self.data.len());
        buf.put_u8(u8::from(self.ok));
        buf.put_u64(self.leader_epoch.get());
        buf.put_i64(self.hw.get());
        #[allow(clippy::cast_possible_truncation)] // Bounded by fetch_max_bytes.
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Decodes a response.
    pub fn decode(mut buf: Bytes) -> ClusterResult<Self> {
        need(&buf, 17)?;
        let ok = buf.get_u8() != 0;
        let leader_epoch = LeaderEpoch::new(buf.get_u64());
        let hw = Offset::new(buf.get_i64());
        let data = get_bytes(&mut buf)?;
        Ok(Self {
            ok,
            leader_epoch,
            hw,
            data,
        })
    }
}

/// Follower → leader query for the end of an epoch, driving truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderEpochOffsetRequest {
    /// The follower's latest leader epoch.
    pub leader_epoch: LeaderEpoch,
}

impl LeaderEpochOffsetRequest {
    /// Encodes the request.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(self.leader_epoch.get());
        buf.freeze()
    }

    /// Decodes a request.
    pub fn decode(mut buf: Bytes) -> ClusterResult<Self> {
        need(&buf, 8)?;
        Ok(Self {
            leader_epoch: LeaderEpoch::new(buf.get_u64()),
        })
    }
}

/// Leader reply: the exclusive end offset of the queried epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderEpochOffsetResponse {
    /// First offset past the queried epoch on the leader.
    pub end_offset: Offset,
}

impl LeaderEpochOffsetResponse {
    /// Encodes the response.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_i64(self.end_offset.get());
        buf.freeze()
    }

    /// Decodes a response.
    pub fn decode(mut buf: Bytes) -> ClusterResult<Self> {
        need(&buf, 8)?;
        Ok(Self {
            end_offset: Offset::new(buf.get_i64()),
        })
    }
}

/// Leader → follower hint that new data is available for fetching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNotification {
    /// Stream name.
    pub stream: String,
    /// Partition within the stream.
    pub partition: PartitionId,
}

impl PartitionNotification {
    /// Encodes the notification.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.stream);
        buf.put_u64(self.partition.get());
        buf.freeze()
    }

    /// Decodes a notification.
    pub fn decode(mut buf: Bytes) -> ClusterResult<Self> {
        let stream = get_string(&mut buf)?;
        need(&buf, 8)?;
        Ok(Self {
            stream,
            partition: PartitionId::new(buf.get_u64()),
        })
    }
}

/// Cluster survey request for broker metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfoRequest {
    /// The surveying broker.
    pub broker: BrokerId,
}

impl ServerInfoRequest {
    /// Encodes the request.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(self.broker.get());
        buf.freeze()
    }

    /// Decodes a request.
    pub fn decode(mut buf: Bytes) -> ClusterResult<Self> {
        need(&buf, 8)?;
        Ok(Self {
            broker: BrokerId::new(buf.get_u64()),
        })
    }
}

/// Survey reply describing one broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfoResponse {
    /// The responding broker.
    pub broker: BrokerId,
    /// Partitions hosted by the broker.
    pub partition_count: u64,
    /// Partitions led by the broker.
    pub leader_count: u64,
}

impl ServerInfoResponse {
    /// Encodes the response.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_u64(self.broker.get());
        buf.put_u64(self.partition_count);
        buf.put_u64(self.leader_count);
        buf.freeze()
    }

    /// Decodes a response.
    pub fn decode(mut buf: Bytes) -> ClusterResult<Self> {
        need(&buf, 24)?;
        Ok(Self {
            broker: BrokerId::new(buf.get_u64()),
            partition_count: buf.get_u64(),
            leader_count: buf.get_u64(),
        })
    }
}

/// Probe for whether a broker has started a partition as leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStatusRequest {
    /// Stream name.
    pub stream: String,
    /// Partition within the stream.
    pub partition: PartitionId,
}

impl PartitionStatusRequest {
    /// Encodes the request.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.stream);
        buf.put_u64(self.partition.get());
        buf.freeze()
    }

    /// Decodes a request.
    pub fn decode(mut buf: Bytes) -> ClusterResult<Self> {
        let stream = get_string(&mut buf)?;
        need(&buf, 8)?;
        Ok(Self {
            stream,
            partition: PartitionId::new(buf.get_u64()),
        })
    }
}

/// Status probe reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionStatusResponse {
    /// True if the broker knows the partition.
    pub exists: bool,
    /// True if the broker is running it as leader.
    pub is_leader: bool,
}

impl PartitionStatusResponse {
    /// Encodes the response.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2);
        buf.put_u8(u8::from(self.exists));
        buf.put_u8(u8::from(self.is_leader));
        buf.freeze()
    }

    /// Decodes a response.
    pub fn decode(mut buf: Bytes) -> ClusterResult<Self> {
        need(&buf, 2)?;
        Ok(Self {
            exists: buf.get_u8() != 0,
            is_leader: buf.get_u8() != 0,
        })
    }
}

/// A metadata operation forwarded from a non-leader broker to the metadata
/// leader. The payload is the consensus-entry encoding of the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagatedRequest {
    /// Encoded metadata operation.
    pub data: Bytes,
}

impl PropagatedRequest {
    /// Encodes the request.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.data.len());
        #[allow(clippy::cast_possible_truncation)] // Metadata ops are small.
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Decodes a request.
    pub fn decode(mut buf: Bytes) -> ClusterResult<Self> {
        Ok(Self {
            data: get_bytes(&mut buf)?,
        })
    }
}

/// Decision for a propagated metadata operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagatedResponse {
    /// `None` on success, or a code plus message mirroring the metadata
    /// error taxonomy.
    pub error: Option<(u32, String)>,
}

impl PropagatedResponse {
    /// A success reply.
    #[must_use]
    pub const fn ok() -> Self {
        Self { error: None }
    }

    /// Encodes the response.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match &self.error {
            None => buf.put_u8(0),
            Some((code, message)) => {
                buf.put_u8(1);
                buf.put_u32(*code);
                put_string(&mut buf, message);
            }
        }
        buf.freeze()
    }

    /// Decodes a response.
    pub fn decode(mut buf: Bytes) -> ClusterResult<Self> {
        need(&buf, 1)?;
        if buf.get_u8() == 0 {
            return Ok(Self::ok());
        }
        need(&buf, 4)?;
        let code = buf.get_u32();
        let message = get_string(&mut buf)?;
        Ok(Self {
            error: Some((code, message)),
        })
    }
}

/// Subject a partition leader serves replication fetches on.
#[must_use]
pub fn replication_subject(stream: &str, partition: PartitionId) -> String {
    format!("replicate.{stream}.{partition}")
}

/// Subject a partition leader serves epoch-end queries on.
#[must_use]
pub fn leader_epoch_offset_subject(stream: &str, partition: PartitionId) -> String {
    format!("epoch-offset.{stream}.{partition}")
}

/// Subject a follower listens on for new-data hints.
#[must_use]
pub fn notification_subject(broker: BrokerId, stream: &str, partition: PartitionId) -> String {
    format!("notify.{broker}.{stream}.{partition}")
}

/// Subject a broker answers cluster surveys on.
#[must_use]
pub fn server_info_subject(broker: BrokerId) -> String {
    format!("server-info.{broker}")
}

/// Subject a broker receives forwarded metadata operations on.
#[must_use]
pub fn propagate_subject(broker: BrokerId) -> String {
    format!("propagate.{broker}")
}

/// Subject a broker answers partition status probes on.
#[must_use]
pub fn partition_status_subject(broker: BrokerId) -> String {
    format!("status.{broker}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_roundtrip() {
        let request = ReplicationRequest {
            replica: BrokerId::new(2),
            offset: Offset::new(17),
            leader_epoch: LeaderEpoch::new(3),
        };
        assert_eq!(
            ReplicationRequest::decode(request.encode()).unwrap(),
            request
        );

        let response = ReplicationResponse {
            ok: true,
            leader_epoch: LeaderEpoch::new(3),
            hw: Offset::new(16),
            data: Bytes::from("framed-records"),
        };
        assert_eq!(
            ReplicationResponse::decode(response.encode()).unwrap(),
            response
        );
    }

    #[test]
    fn test_epoch_offset_roundtrip() {
        let request = LeaderEpochOffsetRequest {
            leader_epoch: LeaderEpoch::new(7),
        };
        assert_eq!(
            LeaderEpochOffsetRequest::decode(request.encode()).unwrap(),
            request
        );

        let response = LeaderEpochOffsetResponse {
            end_offset: Offset::new(42),
        };
        assert_eq!(
            LeaderEpochOffsetResponse::decode(response.encode()).unwrap(),
            response
        );
    }

    #[test]
    fn test_status_and_info_roundtrip() {
        let status = PartitionStatusResponse {
            exists: true,
            is_leader: false,
        };
        assert_eq!(
            PartitionStatusResponse::decode(status.encode()).unwrap(),
            status
        );

        let info = ServerInfoResponse {
            broker: BrokerId::new(9),
            partition_count: 4,
            leader_count: 2,
        };
        assert_eq!(ServerInfoResponse::decode(info.encode()).unwrap(), info);
    }

    #[test]
    fn test_propagated_roundtrip() {
        let request = PropagatedRequest {
            data: Bytes::from("op-bytes"),
        };
        assert_eq!(PropagatedRequest::decode(request.encode()).unwrap(), request);

        let failure = PropagatedResponse {
            error: Some((4, "stream does not exist".to_string())),
        };
        assert_eq!(
            PropagatedResponse::decode(failure.encode()).unwrap(),
            failure
        );
        assert_eq!(
            PropagatedResponse::decode(PropagatedResponse::ok().encode()).unwrap(),
            PropagatedResponse::ok()
        );
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let request = PartitionStatusRequest {
            stream: "orders".to_string(),
            partition: PartitionId::new(1),
        };
        let encoded = request.encode();
        let torn = encoded.slice(..encoded.len() - 3);
        assert!(PartitionStatusRequest::decode(torn).is_err());
    }
}
