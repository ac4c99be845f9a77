use super::types::{LogIndex, NodeId, PeerInfo, Term};
use crate::storage::PersistentState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// The roles a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Follower state - receives updates from leader
    Follower,
    /// Candidate state - requesting votes for leadership
    Candidate,
    /// Leader state - manages log replication
    Leader,
    /// Installing a snapshot received from the leader
    Snapshotting,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "Follower"),
            NodeState::Candidate => write!(f, "Candidate"),
            NodeState::Leader => write!(f, "Leader"),
            NodeState::Snapshotting => write!(f, "Snapshotting"),
        }
    }
}

/// Complete state of a Raft node
#[derive(Debug, Clone)]
pub struct RaftState {
    // Persistent state on all servers
    /// Latest term server has seen (initialized to 0)
    pub current_term: Term,
    /// Candidate that received vote in current term (or None)
    pub voted_for: Option<NodeId>,

    // Volatile state on all servers
    /// Index of highest log entry applied to state machine
    pub last_applied: LogIndex,
    /// Current role of this node
    pub state: NodeState,
    /// ID of the current leader (if known)
    pub current_leader: Option<NodeId>,
    /// This node's ID
    pub node_id: NodeId,
    /// Other cluster members, keyed by id
    pub peers: BTreeMap<NodeId, PeerInfo>,
    /// False while this node is outside the configuration (not yet added,
    /// or removed). Non-voters never vote or campaign.
    pub voter: bool,

    // Volatile state on leaders (reinitialized after election)
    /// For each peer, index of highest log entry known to be replicated there
    pub match_index: HashMap<NodeId, LogIndex>,

    // Election state for candidates
    /// Set of nodes that voted for this candidate in current election
    pub votes_received: HashSet<NodeId>,
}

impl RaftState {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            last_applied: 0,
            state: NodeState::Follower,
            current_leader: None,
            node_id,
            peers: BTreeMap::new(),
            voter: true,
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
        }
    }

    /// Restore the persisted term and vote
    pub fn restore(&mut self, persistent: PersistentState) {
        self.current_term = persistent.current_term;
        self.voted_for = persistent.voted_for;
    }

    /// The record that must reach stable storage before replying
    pub fn persistent(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        }
    }

    /// Replace the peer set, never listing ourselves
    pub fn set_peers(&mut self, peers: impl IntoIterator<Item = PeerInfo>) {
        self.peers = peers
            .into_iter()
            .filter(|p| p.id != self.node_id)
            .map(|p| (p.id.clone(), p))
            .collect();
    }

    /// Adopt a full membership list. We vote only if it names us, or if it
    /// is empty (a lone bootstrap node).
    pub fn set_membership(&mut self, members: Vec<PeerInfo>) {
        self.voter = members.is_empty() || members.iter().any(|p| p.id == self.node_id);
        self.set_peers(members);
    }

    /// Number of voting members, ourselves included
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Strict majority of the cluster
    pub fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Membership list, ourselves included when voting, as stored in snapshots
    pub fn membership(&self, self_address: &str) -> Vec<PeerInfo> {
        let mut members: Vec<PeerInfo> = self.peers.values().cloned().collect();
        if self.voter {
            members.push(PeerInfo::new(self.node_id.clone(), self_address));
        }
        members.sort();
        members
    }

    /// Transition to follower state. The vote is only cleared when the term
    /// actually changes; a vote cast earlier in the same term still stands.
    pub fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        assert!(
            term >= self.current_term,
            "term regressed from {} to {}",
            self.current_term,
            term
        );
        tracing::info!(
            "Node {} transitioning to Follower (term: {})",
            self.node_id,
            term
        );
        if term > self.current_term {
            self.voted_for = None;
        }
        self.state = NodeState::Follower;
        self.current_term = term;
        self.current_leader = leader;
        self.votes_received.clear();
        self.match_index.clear();
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self) {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.node_id.clone());
        self.current_leader = None;
        self.votes_received.clear();
        self.votes_received.insert(self.node_id.clone());
        self.match_index.clear();

        tracing::info!(
            "Node {} transitioning to Candidate (term: {})",
            self.node_id,
            self.current_term
        );
    }

    /// Transition to leader state
    pub fn become_leader(&mut self) {
        assert_eq!(self.state, NodeState::Candidate, "only candidates can lead");
        tracing::info!(
            "Node {} transitioning to Leader (term: {})",
            self.node_id,
            self.current_term
        );

        self.state = NodeState::Leader;
        self.current_leader = Some(self.node_id.clone());

        // Reinitialize leader state
        self.match_index = self.peers.keys().map(|id| (id.clone(), 0)).collect();
        self.votes_received.clear();
    }

    /// Add a vote for this node
    pub fn add_vote(&mut self, from: NodeId) {
        self.votes_received.insert(from);
    }

    /// Check if we have received votes from a majority
    pub fn has_majority(&self) -> bool {
        let votes = self
            .votes_received
            .iter()
            .filter(|id| **id == self.node_id || self.peers.contains_key(*id))
            .count();
        votes >= self.quorum_size()
    }

    /// Update term if we see a higher term
    pub fn update_term(&mut self, term: Term) -> bool {
        if term > self.current_term {
            tracing::info!(
                "Node {} updating term from {} to {}",
                self.node_id,
                self.current_term,
                term
            );
            self.become_follower(term, None);
            true
        } else {
            false
        }
    }

    /// Check if we're the leader
    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    /// Check if we're a candidate
    pub fn is_candidate(&self) -> bool {
        self.state == NodeState::Candidate
    }

    /// Check if we're a follower
    pub fn is_follower(&self) -> bool {
        self.state == NodeState::Follower
    }
}
