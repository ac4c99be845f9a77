use super::log_store::LogStore;
use super::rpc::{AppendEntriesRequest, AppendEntriesResponse};
use super::state::RaftState;
use super::types::LogIndex;
use crate::storage::StateStorage;
use crate::util::errors::Result;

/// Handle incoming AppendEntries RPC
pub fn handle_append_entries<S: StateStorage + ?Sized>(
    raft_state: &mut RaftState,
    state_storage: &mut S,
    log: &mut LogStore,
    request: AppendEntriesRequest,
) -> Result<AppendEntriesResponse> {
    // If request term is greater, update our term and become follower
    if raft_state.update_term(request.term) {
        state_storage.save_state(&raft_state.persistent())?;
    }

    // Reply false if term < currentTerm
    if request.term < raft_state.current_term {
        tracing::debug!(
            "Node {} rejected AppendEntries from {} - stale term ({} < {})",
            raft_state.node_id,
            request.leader_id,
            request.term,
            raft_state.current_term
        );

        return Ok(reject(raft_state, None, None));
    }

    // A valid leader exists for this term; candidates give up
    if !raft_state.is_follower() {
        raft_state.become_follower(request.term, Some(request.leader_id.clone()));
    }
    raft_state.current_leader = Some(request.leader_id.clone());

    // Check log consistency. Anything inside the compacted prefix is
    // committed and therefore matches by definition.
    let marker = log.last_included();
    if request.prev_log_index > marker.index {
        if request.prev_log_index > log.last_index() {
            tracing::debug!(
                "Node {} rejected AppendEntries - missing entry at index {}",
                raft_state.node_id,
                request.prev_log_index
            );
            return Ok(reject(raft_state, Some(log.last_index() + 1), None));
        }

        let local_term = log.term(request.prev_log_index)?;
        if local_term != request.prev_log_term {
            tracing::debug!(
                "Node {} rejected AppendEntries - term mismatch at index {} ({} != {})",
                raft_state.node_id,
                request.prev_log_index,
                local_term,
                request.prev_log_term
            );

            // Find the first index with the conflicting term
            let mut conflict_index = request.prev_log_index;
            while conflict_index > log.first_index() {
                match log.term(conflict_index - 1) {
                    Ok(term) if term == local_term => conflict_index -= 1,
                    _ => break,
                }
            }

            return Ok(reject(raft_state, Some(conflict_index), Some(local_term)));
        }
    }

    // Append new entries, skipping the ones we already hold
    let last_new_index = request.last_index();
    let mut entries = request.entries.into_iter().peekable();
    while let Some(entry) = entries.peek() {
        if entry.index <= marker.index {
            entries.next();
            continue;
        }
        match log.term(entry.index) {
            Ok(term) if term == entry.term => {
                entries.next();
            }
            Ok(_) => {
                // Conflict found, delete this entry and all that follow
                tracing::info!(
                    "Node {} found log conflict at index {}, truncating",
                    raft_state.node_id,
                    entry.index
                );
                log.truncate_from(entry.index)?;
                break;
            }
            Err(_) => break,
        }
    }

    let remaining: Vec<_> = entries.collect();
    if !remaining.is_empty() {
        tracing::debug!(
            "Node {} appending {} entries from leader {}",
            raft_state.node_id,
            remaining.len(),
            request.leader_id
        );
        log.append(remaining)?;
    }

    // Update commit index
    let new_commit = request.leader_commit.min(last_new_index);
    if log.commit(new_commit) {
        tracing::debug!(
            "Node {} updated commit_index to {}",
            raft_state.node_id,
            new_commit
        );
    }

    Ok(AppendEntriesResponse {
        term: raft_state.current_term,
        success: true,
        conflict_index: None,
        conflict_term: None,
    })
}

fn reject(
    raft_state: &RaftState,
    conflict_index: Option<LogIndex>,
    conflict_term: Option<u64>,
) -> AppendEntriesResponse {
    AppendEntriesResponse {
        term: raft_state.current_term,
        success: false,
        conflict_index,
        conflict_term,
    }
}

/// Try to advance commit index based on match_index of followers. Returns
/// true if the commit index moved.
pub fn advance_commit_index(raft_state: &RaftState, log: &mut LogStore) -> bool {
    if !raft_state.is_leader() {
        return false;
    }

    // The quorum value: the highest index held by a strict majority
    let mut indexes: Vec<LogIndex> = raft_state
        .peers
        .keys()
        .map(|id| raft_state.match_index.get(id).copied().unwrap_or(0))
        .collect();
    indexes.push(log.last_index());
    indexes.sort_unstable_by(|a, b| b.cmp(a));
    let quorum_index = indexes[raft_state.quorum_size() - 1];

    if quorum_index <= log.commit_index() {
        return false;
    }

    // Only entries from our own term are committed by counting replicas
    match log.term(quorum_index) {
        Ok(term) if term == raft_state.current_term => {}
        _ => return false,
    }

    log.commit(quorum_index);
    tracing::info!(
        "Leader {} advanced commit_index to {}",
        raft_state.node_id,
        quorum_index
    );
    true
}

/// Create AppendEntries request for a follower whose next index is known.
/// Fails with `Compacted` when the preceding entry is gone, in which case
/// the follower needs a snapshot instead.
pub fn create_append_entries(
    raft_state: &RaftState,
    log: &LogStore,
    next_index: LogIndex,
    max_entries: usize,
) -> Result<AppendEntriesRequest> {
    let next_index = next_index.max(1);
    let prev_log_index = next_index - 1;
    let prev_log_term = log.term(prev_log_index)?;

    // Get entries to send
    let entries = log.entries_from(next_index, max_entries)?;

    Ok(AppendEntriesRequest {
        term: raft_state.current_term,
        leader_id: raft_state.node_id.clone(),
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit: log.commit_index(),
    })
}
