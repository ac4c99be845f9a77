use async_trait::async_trait;
use thiserror::Error;

use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RaftRequest, RaftResponse, RequestVoteRequest,
    RequestVoteResponse, SnapshotRecoveryRequest, SnapshotRecoveryResponse, SnapshotRequest,
    SnapshotResponse,
};
use crate::raft::types::{NodeId, PeerInfo};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("Request timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Codec error: {0}")]
    Codec(String),

    /// The peer received the request but failed to handle it
    #[error("Remote error: {0}")]
    Remote(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Outgoing side of the RPC layer. One call per request; implementations
/// decide how the request reaches `peer`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(
        &self,
        peer: &PeerInfo,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError>;

    async fn append_entries(
        &self,
        peer: &PeerInfo,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;

    async fn request_snapshot(
        &self,
        peer: &PeerInfo,
        request: SnapshotRequest,
    ) -> Result<SnapshotResponse, TransportError>;

    async fn snapshot_recovery(
        &self,
        peer: &PeerInfo,
        request: SnapshotRecoveryRequest,
    ) -> Result<SnapshotRecoveryResponse, TransportError>;
}

/// Implements [`Transport`] for anything that can carry a [`RaftRequest`]
/// envelope and hand back the matching [`RaftResponse`].
#[async_trait]
pub trait EnvelopeTransport: Send + Sync {
    async fn call(&self, peer: &PeerInfo, request: RaftRequest)
        -> Result<RaftResponse, TransportError>;
}

fn unexpected(response: RaftResponse) -> TransportError {
    TransportError::Codec(format!("unexpected response: {:?}", response))
}

#[async_trait]
impl<T: EnvelopeTransport> Transport for T {
    async fn request_vote(
        &self,
        peer: &PeerInfo,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        match self.call(peer, RaftRequest::RequestVote(request)).await? {
            RaftResponse::RequestVote(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn append_entries(
        &self,
        peer: &PeerInfo,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        match self.call(peer, RaftRequest::AppendEntries(request)).await? {
            RaftResponse::AppendEntries(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn request_snapshot(
        &self,
        peer: &PeerInfo,
        request: SnapshotRequest,
    ) -> Result<SnapshotResponse, TransportError> {
        match self.call(peer, RaftRequest::Snapshot(request)).await? {
            RaftResponse::Snapshot(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn snapshot_recovery(
        &self,
        peer: &PeerInfo,
        request: SnapshotRecoveryRequest,
    ) -> Result<SnapshotRecoveryResponse, TransportError> {
        match self.call(peer, RaftRequest::SnapshotRecovery(request)).await? {
            RaftResponse::SnapshotRecovery(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }
}
