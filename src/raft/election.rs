use super::log_store::LogStore;
use super::rpc::{RequestVoteRequest, RequestVoteResponse};
use super::state::RaftState;
use super::types::NodeId;
use crate::storage::StateStorage;
use crate::util::errors::Result;

/// Handle incoming RequestVote RPC
pub fn handle_request_vote<S: StateStorage + ?Sized>(
    raft_state: &mut RaftState,
    state_storage: &mut S,
    log: &LogStore,
    request: RequestVoteRequest,
) -> Result<RequestVoteResponse> {
    tracing::debug!(
        "Node {} received RequestVote from {} (term: {})",
        raft_state.node_id,
        request.candidate_id,
        request.term
    );

    // If request term is greater, update our term and become follower
    if raft_state.update_term(request.term) {
        state_storage.save_state(&raft_state.persistent())?;
    }

    let mut vote_granted = false;

    // Grant vote if:
    // 1. Candidate's term is at least as current as ours
    // 2. We haven't voted yet in this term, or we already voted for this candidate
    // 3. Candidate's log is at least as up-to-date as ours
    if !raft_state.voter {
        tracing::debug!(
            "Node {} denied vote to {} - not a voting member",
            raft_state.node_id,
            request.candidate_id
        );
    } else if request.term >= raft_state.current_term {
        let can_vote = raft_state.voted_for.is_none()
            || raft_state.voted_for.as_ref() == Some(&request.candidate_id);

        if can_vote {
            // Check if candidate's log is at least as up-to-date as ours
            let last_log_term = log.last_term();
            let last_log_index = log.last_index();

            let log_is_up_to_date = request.last_log_term > last_log_term
                || (request.last_log_term == last_log_term
                    && request.last_log_index >= last_log_index);

            if log_is_up_to_date {
                vote_granted = true;
                raft_state.voted_for = Some(request.candidate_id.clone());
                state_storage.save_state(&raft_state.persistent())?;

                tracing::info!(
                    "Node {} granted vote to {} in term {}",
                    raft_state.node_id,
                    request.candidate_id,
                    request.term
                );
            } else {
                tracing::debug!(
                    "Node {} denied vote to {} - log not up-to-date",
                    raft_state.node_id,
                    request.candidate_id
                );
            }
        } else {
            tracing::debug!(
                "Node {} denied vote to {} - already voted for {:?}",
                raft_state.node_id,
                request.candidate_id,
                raft_state.voted_for
            );
        }
    } else {
        tracing::debug!(
            "Node {} denied vote to {} - request term {} < current term {}",
            raft_state.node_id,
            request.candidate_id,
            request.term,
            raft_state.current_term
        );
    }

    Ok(RequestVoteResponse {
        term: raft_state.current_term,
        vote_granted,
    })
}

/// Outcome of counting a vote response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Still waiting for more votes
    Pending,
    /// A majority has been reached in the current term
    Won,
    /// A higher term was observed; we are a follower now
    SteppedDown,
    /// The response belongs to an older election
    Stale,
}

/// Handle incoming RequestVote response
pub fn handle_request_vote_response<S: StateStorage + ?Sized>(
    raft_state: &mut RaftState,
    state_storage: &mut S,
    from: NodeId,
    request_term: u64,
    response: RequestVoteResponse,
) -> Result<VoteOutcome> {
    // If response term is greater, update our term and become follower
    if raft_state.update_term(response.term) {
        state_storage.save_state(&raft_state.persistent())?;
        return Ok(VoteOutcome::SteppedDown);
    }

    // Ignore if we're not a candidate anymore, or the election moved on
    if !raft_state.is_candidate() || request_term != raft_state.current_term {
        return Ok(VoteOutcome::Stale);
    }

    // Record the vote if granted
    if response.vote_granted {
        raft_state.add_vote(from.clone());

        tracing::debug!(
            "Node {} received vote from {} ({}/{} votes)",
            raft_state.node_id,
            from,
            raft_state.votes_received.len(),
            raft_state.cluster_size()
        );
    }

    // Check if we won the election
    if raft_state.has_majority() {
        tracing::info!(
            "Node {} won election in term {} with {} votes",
            raft_state.node_id,
            raft_state.current_term,
            raft_state.votes_received.len()
        );
        return Ok(VoteOutcome::Won);
    }

    Ok(VoteOutcome::Pending)
}

/// Create a RequestVote request for this node
pub fn create_request_vote(raft_state: &RaftState, log: &LogStore) -> RequestVoteRequest {
    RequestVoteRequest {
        term: raft_state.current_term,
        candidate_id: raft_state.node_id.clone(),
        last_log_index: log.last_index(),
        last_log_term: log.last_term(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::{LogEntry, PeerInfo};
    use crate::storage::{FileStateStorage, MemLogStorage, MemStateStorage};
    use tempfile::TempDir;

    fn node(id: &str) -> RaftState {
        let mut state = RaftState::new(id.to_string());
        state.set_peers(vec![
            PeerInfo::new("node-1", "a"),
            PeerInfo::new("node-2", "b"),
            PeerInfo::new("node-3", "c"),
        ]);
        state
    }

    fn log_with_terms(terms: &[u64]) -> LogStore {
        let mut log = LogStore::new(Box::new(MemLogStorage::new()));
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, t)| LogEntry::data(*t, i as u64 + 1, vec![]))
            .collect();
        log.append(entries).unwrap();
        log
    }

    fn vote_request(term: u64, candidate: &str, last_index: u64, last_term: u64) -> RequestVoteRequest {
        RequestVoteRequest {
            term,
            candidate_id: candidate.to_string(),
            last_log_index: last_index,
            last_log_term: last_term,
        }
    }

    #[test]
    fn test_grant_vote_to_candidate() {
        let temp_dir = TempDir::new().unwrap();
        let mut raft_state = node("node-1");
        let mut state_storage = FileStateStorage::new(temp_dir.path().join("node-1")).unwrap();
        let log = log_with_terms(&[]);

        let response = handle_request_vote(
            &mut raft_state,
            &mut state_storage,
            &log,
            vote_request(1, "node-2", 0, 0),
        )
        .unwrap();

        assert!(response.vote_granted);
        assert_eq!(raft_state.voted_for, Some("node-2".to_string()));

        // The vote must be durable before the response leaves
        let persisted = state_storage.load_state().unwrap();
        assert_eq!(persisted.current_term, 1);
        assert_eq!(persisted.voted_for, Some("node-2".to_string()));
    }

    #[test]
    fn test_deny_vote_if_already_voted() {
        let mut raft_state = node("node-1");
        raft_state.current_term = 1;
        raft_state.voted_for = Some("node-2".to_string());
        let mut state_storage = MemStateStorage::new();
        let log = log_with_terms(&[]);

        let response = handle_request_vote(
            &mut raft_state,
            &mut state_storage,
            &log,
            vote_request(1, "node-3", 0, 0),
        )
        .unwrap();
        assert!(!response.vote_granted);

        // Repeating the request from the same candidate is still granted
        let response = handle_request_vote(
            &mut raft_state,
            &mut state_storage,
            &log,
            vote_request(1, "node-2", 0, 0),
        )
        .unwrap();
        assert!(response.vote_granted);
    }

    #[test]
    fn test_deny_vote_for_stale_log() {
        let mut raft_state = node("node-1");
        let mut state_storage = MemStateStorage::new();
        let log = log_with_terms(&[1, 2, 2]);

        // Older last term loses even with a longer log
        let response = handle_request_vote(
            &mut raft_state,
            &mut state_storage,
            &log,
            vote_request(3, "node-2", 10, 1),
        )
        .unwrap();
        assert!(!response.vote_granted);
        assert_eq!(raft_state.current_term, 3);

        // Same last term but shorter log loses too
        let response = handle_request_vote(
            &mut raft_state,
            &mut state_storage,
            &log,
            vote_request(3, "node-3", 2, 2),
        )
        .unwrap();
        assert!(!response.vote_granted);

        let response = handle_request_vote(
            &mut raft_state,
            &mut state_storage,
            &log,
            vote_request(3, "node-3", 3, 2),
        )
        .unwrap();
        assert!(response.vote_granted);
    }

    #[test]
    fn test_deny_vote_for_stale_term() {
        let mut raft_state = node("node-1");
        raft_state.current_term = 5;
        let mut state_storage = MemStateStorage::new();
        let log = log_with_terms(&[]);

        let response = handle_request_vote(
            &mut raft_state,
            &mut state_storage,
            &log,
            vote_request(4, "node-2", 0, 0),
        )
        .unwrap();
        assert!(!response.vote_granted);
        assert_eq!(response.term, 5);
    }

    #[test]
    fn test_non_voter_never_grants() {
        let mut raft_state = node("node-1");
        raft_state.voter = false;
        let mut state_storage = MemStateStorage::new();
        let log = log_with_terms(&[]);

        let response = handle_request_vote(
            &mut raft_state,
            &mut state_storage,
            &log,
            vote_request(1, "node-2", 0, 0),
        )
        .unwrap();
        assert!(!response.vote_granted);
        assert_eq!(raft_state.current_term, 1);
    }

    #[test]
    fn test_candidate_steps_down_and_votes_in_higher_term() {
        let mut raft_state = node("node-1");
        raft_state.become_candidate();
        let mut state_storage = MemStateStorage::new();
        let log = log_with_terms(&[]);

        let response = handle_request_vote(
            &mut raft_state,
            &mut state_storage,
            &log,
            vote_request(2, "node-2", 0, 0),
        )
        .unwrap();

        assert!(response.vote_granted);
        assert!(raft_state.is_follower());
        assert_eq!(raft_state.current_term, 2);
    }

    #[test]
    fn test_vote_response_wins_with_majority() {
        let mut raft_state = node("node-1");
        let mut state_storage = MemStateStorage::new();
        raft_state.become_candidate();
        let term = raft_state.current_term;

        let outcome = handle_request_vote_response(
            &mut raft_state,
            &mut state_storage,
            "node-2".to_string(),
            term,
            RequestVoteResponse {
                term,
                vote_granted: false,
            },
        )
        .unwrap();
        assert_eq!(outcome, VoteOutcome::Pending);

        let outcome = handle_request_vote_response(
            &mut raft_state,
            &mut state_storage,
            "node-3".to_string(),
            term,
            RequestVoteResponse {
                term,
                vote_granted: true,
            },
        )
        .unwrap();
        assert_eq!(outcome, VoteOutcome::Won);
    }

    #[test]
    fn test_vote_response_with_higher_term_steps_down() {
        let mut raft_state = node("node-1");
        let mut state_storage = MemStateStorage::new();
        raft_state.become_candidate();

        let outcome = handle_request_vote_response(
            &mut raft_state,
            &mut state_storage,
            "node-2".to_string(),
            1,
            RequestVoteResponse {
                term: 7,
                vote_granted: false,
            },
        )
        .unwrap();

        assert_eq!(outcome, VoteOutcome::SteppedDown);
        assert!(raft_state.is_follower());
        assert_eq!(state_storage.load_state().unwrap().current_term, 7);
    }

    #[test]
    fn test_late_vote_from_previous_election_is_ignored() {
        let mut raft_state = node("node-1");
        let mut state_storage = MemStateStorage::new();
        raft_state.become_candidate();
        raft_state.become_candidate();

        let outcome = handle_request_vote_response(
            &mut raft_state,
            &mut state_storage,
            "node-2".to_string(),
            1,
            RequestVoteResponse {
                term: 1,
                vote_granted: true,
            },
        )
        .unwrap();
        assert_eq!(outcome, VoteOutcome::Stale);
        assert_eq!(raft_state.votes_received.len(), 1);
    }
}
