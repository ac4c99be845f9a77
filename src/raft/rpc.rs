use serde::{Deserialize, Serialize};

use super::types::{LogEntry, LogIndex, NodeId, PeerInfo, Term};

/// RequestVote RPC - Invoked by candidates to gather votes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,
    /// Candidate requesting vote
    pub candidate_id: NodeId,
    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,
    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestVoteResponse {
    /// Current term, for candidate to update itself
    pub term: Term,
    /// True means candidate received vote
    pub vote_granted: bool,
}

/// AppendEntries RPC - Invoked by leader to replicate log entries and as heartbeat
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,
    /// So follower can redirect clients
    pub leader_id: NodeId,
    /// Index of log entry immediately preceding new ones
    pub prev_log_index: LogIndex,
    /// Term of prev_log_index entry
    pub prev_log_term: Term,
    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,
    /// Leader's commit index
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// Index of the last entry carried (or prev_log_index for a heartbeat)
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.prev_log_index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    /// Current term, for leader to update itself
    pub term: Term,
    /// True if follower contained entry matching prev_log_index and prev_log_term
    pub success: bool,
    /// For faster log backtracking on failure
    pub conflict_index: Option<LogIndex>,
    /// For faster log backtracking on failure
    pub conflict_term: Option<Term>,
}

/// Snapshot RPC - asks a follower whether it wants the leader's snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub term: Term,
    pub leader_name: NodeId,
    pub last_index: LogIndex,
    pub last_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotResponse {
    pub term: Term,
    /// True if the follower agrees to receive the snapshot
    pub success: bool,
}

/// SnapshotRecovery RPC - carries the full state image to install
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotRecoveryRequest {
    pub term: Term,
    pub leader_name: NodeId,
    pub last_index: LogIndex,
    pub last_term: Term,
    /// Cluster membership at capture time
    pub peers: Vec<PeerInfo>,
    /// Serialized state machine image
    pub state: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotRecoveryResponse {
    pub term: Term,
    pub success: bool,
}

/// Wrapper for all inbound RPC requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRequest {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
    Snapshot(SnapshotRequest),
    SnapshotRecovery(SnapshotRecoveryRequest),
}

impl RaftRequest {
    /// The node that sent this request
    pub fn sender(&self) -> &NodeId {
        match self {
            RaftRequest::RequestVote(r) => &r.candidate_id,
            RaftRequest::AppendEntries(r) => &r.leader_id,
            RaftRequest::Snapshot(r) => &r.leader_name,
            RaftRequest::SnapshotRecovery(r) => &r.leader_name,
        }
    }
}

/// Wrapper for all RPC responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftResponse {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
    Snapshot(SnapshotResponse),
    SnapshotRecovery(SnapshotRecoveryResponse),
}
