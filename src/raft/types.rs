use serde::{Deserialize, Serialize};

/// Type alias for term numbers
pub type Term = u64;

/// Type alias for log indices
pub type LogIndex = u64;

/// Node identifier
pub type NodeId = String;

/// A cluster member and where to reach it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerInfo {
    pub id: NodeId,
    /// Transport-specific address (`host:port` for TCP)
    pub address: String,
}

impl PeerInfo {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// The payload of a log entry, tagged by kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    /// Appended by a new leader at the start of its term
    Noop,
    /// Opaque application command, handed to the state machine
    Data(Vec<u8>),
    /// Membership change: add a server to the cluster
    AddPeer(PeerInfo),
    /// Membership change: remove a server from the cluster
    RemovePeer(NodeId),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Noop => "noop",
            Command::Data(_) => "data",
            Command::AddPeer(_) => "add_peer",
            Command::RemovePeer(_) => "remove_peer",
        }
    }

    pub fn is_membership_change(&self) -> bool {
        matches!(self, Command::AddPeer(_) | Command::RemovePeer(_))
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log
    pub index: LogIndex,
    pub command: Command,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Command) -> Self {
        Self {
            term,
            index,
            command,
        }
    }

    /// Shorthand for an application data entry
    pub fn data(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self::new(term, index, Command::Data(data))
    }
}
