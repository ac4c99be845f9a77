use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use super::transport::TransportError;
use crate::raft::actor::RaftStateInfo;
use crate::raft::rpc::{RaftRequest, RaftResponse};
use crate::raft::types::{LogIndex, NodeId, Term};

// Constants for message size management
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024; // 10MB - prevent DoS attacks

/// Everything a connection can carry, peer RPCs and client calls alike
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireRequest {
    Raft(RaftRequest),
    /// Replicate an application command and wait for its result
    Submit(Vec<u8>),
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireResponse {
    Raft(RaftResponse),
    Applied {
        index: LogIndex,
        term: Term,
        result: Vec<u8>,
    },
    /// Resubmit to `address` if a leader is known
    NotLeader {
        leader: Option<NodeId>,
        address: Option<String>,
    },
    Status(RaftStateInfo),
    Error(String),
}

/// Frames are a 4-byte big-endian length followed by the payload
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_MESSAGE_SIZE)
        .new_codec()
}

/// Serialize with size limit
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, TransportError> {
    let encoded =
        bincode::serialize(value).map_err(|e| TransportError::Codec(format!("encode: {}", e)))?;

    // Validate size after encoding
    if encoded.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::Codec(format!(
            "Message size {} exceeds maximum {}",
            encoded.len(),
            MAX_MESSAGE_SIZE
        )));
    }

    Ok(Bytes::from(encoded))
}

/// Deserialize with validation
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    if bytes.is_empty() {
        return Err(TransportError::Codec("Message size cannot be zero".to_string()));
    }
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::Codec("Message size exceeds limit".to_string()));
    }

    bincode::deserialize(bytes).map_err(|e| TransportError::Codec(format!("decode: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::rpc::RequestVoteRequest;
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_frame_round_trip_through_codec() {
        let request = WireRequest::Raft(RaftRequest::RequestVote(RequestVoteRequest {
            term: 3,
            candidate_id: "node-1".to_string(),
            last_log_index: 10,
            last_log_term: 2,
        }));

        let mut codec = frame_codec();
        let mut buf = BytesMut::new();
        codec.encode(encode(&request).unwrap(), &mut buf).unwrap();

        // Length prefix is big-endian and excludes itself
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        match decode::<WireRequest>(&frame).unwrap() {
            WireRequest::Raft(RaftRequest::RequestVote(r)) => {
                assert_eq!(r.candidate_id, "node-1");
                assert_eq!(r.last_log_index, 10);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let mut codec = frame_codec();
        let mut buf = BytesMut::new();
        codec
            .encode(encode(&WireRequest::Status).unwrap(), &mut buf)
            .unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut codec = frame_codec();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_empty_payload_is_rejected() {
        assert!(matches!(
            decode::<WireRequest>(&[]),
            Err(TransportError::Codec(_))
        ));
    }
}
