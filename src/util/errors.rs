use std::io;

use thiserror::Error;

use crate::network::transport::TransportError;
use crate::raft::types::{LogIndex, NodeId, Term};

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Commands must be resubmitted to the leader, when one is known.
    #[error("Not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("Log entry {0} not found")]
    NotFound(LogIndex),

    #[error("Log entry {0} has been compacted into a snapshot")]
    Compacted(LogIndex),

    #[error("Append would leave a gap: expected index {expected}, got {got}")]
    LogGap { expected: LogIndex, got: LogIndex },

    #[error("Cannot truncate from {index}: entries through {commit_index} are committed")]
    TruncateCommitted {
        index: LogIndex,
        commit_index: LogIndex,
    },

    /// The entry at `index` was replaced before it committed.
    #[error("Command at index {index} (term {term}) was lost to a leadership change")]
    CommandLost { index: LogIndex, term: Term },

    /// Only one membership change may be uncommitted at a time.
    #[error("Membership change at index {0} has not committed yet")]
    MembershipChangePending(LogIndex),

    #[error("Snapshot install failed: {0}")]
    SnapshotInstall(String),

    #[error("State machine error: {0}")]
    StateMachine(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Raft node is shut down")]
    Shutdown,
}

impl From<bincode::Error> for RaftError {
    fn from(err: bincode::Error) -> Self {
        RaftError::Serialization(err.to_string())
    }
}

impl From<actix::MailboxError> for RaftError {
    fn from(_: actix::MailboxError) -> Self {
        RaftError::Shutdown
    }
}

impl RaftError {
    /// Durable state could not be read or written
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, RaftError::Io(_) | RaftError::Serialization(_))
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
