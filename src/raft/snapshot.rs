//! Snapshot capture, transfer, and installation.
//!
//! A snapshot pairs a state machine image with the log position it covers
//! and the membership at that point. The leader offers it with a `Snapshot`
//! request and ships the image with `SnapshotRecovery` once the follower
//! agrees.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::log_store::LogStore;
use super::rpc::{
    SnapshotRecoveryRequest, SnapshotRecoveryResponse, SnapshotRequest, SnapshotResponse,
};
use super::state::{NodeState, RaftState};
use super::state_machine::StateMachine;
use super::types::{LogIndex, PeerInfo, Term};
use crate::config::SnapshotPolicy;
use crate::storage::{SnapshotStorage, StateStorage};
use crate::util::errors::{RaftError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_index: LogIndex,
    pub last_term: Term,
    /// Voting membership at capture time
    pub peers: Vec<PeerInfo>,
    pub state: Vec<u8>,
}

/// Owns snapshot persistence and keeps the newest snapshot in memory so
/// replicators can ship it without touching disk.
pub struct Snapshotter {
    storage: Box<dyn SnapshotStorage>,
    latest: Option<Arc<Snapshot>>,
}

impl Snapshotter {
    pub fn new(storage: Box<dyn SnapshotStorage>) -> Self {
        Self {
            storage,
            latest: None,
        }
    }

    /// Read the persisted snapshot, if any. Called once at boot.
    pub fn load(&mut self) -> Result<Option<Arc<Snapshot>>> {
        self.latest = self.storage.load()?.map(Arc::new);
        Ok(self.latest.clone())
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.latest.clone()
    }

    /// Capture the state machine as of `index` and persist it
    pub fn capture(
        &mut self,
        state_machine: &dyn StateMachine,
        index: LogIndex,
        term: Term,
        peers: Vec<PeerInfo>,
    ) -> Result<Arc<Snapshot>> {
        let snapshot = Snapshot {
            last_index: index,
            last_term: term,
            peers,
            state: state_machine.snapshot()?,
        };
        self.save(snapshot)
    }

    pub fn save(&mut self, snapshot: Snapshot) -> Result<Arc<Snapshot>> {
        self.storage.save(&snapshot)?;
        let snapshot = Arc::new(snapshot);
        self.latest = Some(snapshot.clone());
        Ok(snapshot)
    }
}

/// True once enough applied entries sit in the log to be worth compacting
pub fn should_capture(last_applied: LogIndex, log: &LogStore, compaction_threshold: u64) -> bool {
    let first = log.first_index();
    last_applied >= first && last_applied - first + 1 > compaction_threshold
}

/// Whether a follower at `next_index` should get the snapshot instead of
/// entries
pub fn needs_snapshot(
    next_index: LogIndex,
    log: &LogStore,
    latest: Option<&Snapshot>,
    policy: &SnapshotPolicy,
) -> bool {
    if next_index <= log.last_included().index {
        return true;
    }
    match (policy.lag_threshold, latest) {
        (Some(threshold), Some(snapshot)) => {
            snapshot.last_index >= next_index
                && log.last_index().saturating_sub(next_index) > threshold
        }
        _ => false,
    }
}

/// Common preamble for both snapshot RPCs: adopt a newer term and follow
/// the sender. Returns false if the request is from a stale leader.
fn accept_leader<S: StateStorage + ?Sized>(
    raft_state: &mut RaftState,
    state_storage: &mut S,
    term: Term,
    leader: &str,
) -> Result<bool> {
    if raft_state.update_term(term) {
        state_storage.save_state(&raft_state.persistent())?;
    }
    if term < raft_state.current_term {
        return Ok(false);
    }
    if !raft_state.is_follower() {
        raft_state.become_follower(term, Some(leader.to_string()));
    }
    raft_state.current_leader = Some(leader.to_string());
    Ok(true)
}

/// Handle the leader's offer of a snapshot
pub fn handle_snapshot_request<S: StateStorage + ?Sized>(
    raft_state: &mut RaftState,
    state_storage: &mut S,
    log: &LogStore,
    request: SnapshotRequest,
) -> Result<SnapshotResponse> {
    if !accept_leader(raft_state, state_storage, request.term, &request.leader_name)? {
        return Ok(SnapshotResponse {
            term: raft_state.current_term,
            success: false,
        });
    }

    // If we already hold the boundary entry the leader can resume with
    // AppendEntries right after it
    let agree = !log.matches(request.last_index, request.last_term);
    tracing::info!(
        "Node {} {} snapshot through {} (term {}) from {}",
        raft_state.node_id,
        if agree { "accepted" } else { "declined" },
        request.last_index,
        request.last_term,
        request.leader_name
    );

    Ok(SnapshotResponse {
        term: raft_state.current_term,
        success: agree,
    })
}

/// Install a snapshot shipped by the leader. Any failure after the state
/// machine has been touched is reported as `SnapshotInstall`, which the
/// node treats as fatal.
pub fn handle_snapshot_recovery<S: StateStorage + ?Sized>(
    raft_state: &mut RaftState,
    state_storage: &mut S,
    log: &mut LogStore,
    state_machine: &mut dyn StateMachine,
    snapshotter: &mut Snapshotter,
    request: SnapshotRecoveryRequest,
) -> Result<SnapshotRecoveryResponse> {
    if !accept_leader(raft_state, state_storage, request.term, &request.leader_name)? {
        return Ok(SnapshotRecoveryResponse {
            term: raft_state.current_term,
            success: false,
        });
    }

    if request.last_index <= log.commit_index() {
        tracing::debug!(
            "Node {} already committed through {}, ignoring snapshot through {}",
            raft_state.node_id,
            log.commit_index(),
            request.last_index
        );
        return Ok(SnapshotRecoveryResponse {
            term: raft_state.current_term,
            success: true,
        });
    }

    tracing::info!(
        "Node {} installing snapshot through {} (term {}, {} bytes)",
        raft_state.node_id,
        request.last_index,
        request.last_term,
        request.state.len()
    );
    raft_state.state = NodeState::Snapshotting;

    let index = request.last_index;
    let peers = request.peers.clone();
    install(log, state_machine, snapshotter, request)
        .map_err(|e| RaftError::SnapshotInstall(e.to_string()))?;

    raft_state.last_applied = index;
    raft_state.set_membership(peers);
    raft_state.state = NodeState::Follower;

    Ok(SnapshotRecoveryResponse {
        term: raft_state.current_term,
        success: true,
    })
}

fn install(
    log: &mut LogStore,
    state_machine: &mut dyn StateMachine,
    snapshotter: &mut Snapshotter,
    request: SnapshotRecoveryRequest,
) -> Result<()> {
    state_machine.restore(&request.state)?;

    let index = request.last_index;
    let term = request.last_term;
    snapshotter.save(Snapshot {
        last_index: index,
        last_term: term,
        peers: request.peers,
        state: request.state,
    })?;

    // Keep the suffix that follows the snapshot when our log agrees with it
    if log.matches(index, term) {
        log.commit(index);
        log.compact_through(index, term)
    } else {
        log.reset_to(index, term)
    }
}
