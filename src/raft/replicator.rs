//! One actor per follower while this node leads.
//!
//! A replicator asks the node for a payload at its follower's next index,
//! ships it, and reports progress back. It keeps at most one request in
//! flight; pokes that arrive meanwhile are folded into a single follow-up.

use actix::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use super::actor::{
    PrepareReplication, RaftNode, ReplicationEvent, ReplicationPayload, ReplicationProgress,
};
use super::rpc::{AppendEntriesResponse, SnapshotRecoveryRequest, SnapshotRequest};
use super::types::{LogIndex, PeerInfo, Term};
use crate::network::transport::{Transport, TransportError};

/// Where the leader believes a follower's log stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Next entry to send
    pub next_index: LogIndex,
    /// Highest entry known to be replicated
    pub match_index: LogIndex,
}

impl Progress {
    pub fn new(leader_last_index: LogIndex) -> Self {
        Self {
            next_index: leader_last_index + 1,
            match_index: 0,
        }
    }

    /// The follower holds everything through `last_index`. Returns true if
    /// the match index moved.
    pub fn on_success(&mut self, last_index: LogIndex) -> bool {
        self.next_index = last_index + 1;
        if last_index > self.match_index {
            self.match_index = last_index;
            true
        } else {
            false
        }
    }

    /// Back off after a consistency rejection, jumping to the follower's
    /// hint when it gave one
    pub fn on_reject(&mut self, conflict_index: Option<LogIndex>) {
        let previous = self.next_index.saturating_sub(1).max(1);
        self.next_index = match conflict_index {
            Some(hint) => hint.min(previous).max(1),
            None => previous,
        };
        self.next_index = self.next_index.max(self.match_index + 1);
    }
}

/// Wake up and replicate now
#[derive(Message)]
#[rtype(result = "()")]
pub struct Replicate;

#[derive(Message)]
#[rtype(result = "()")]
pub struct StopReplication;

/// Result of one exchange with the follower
enum Outcome {
    Appended {
        last_index: LogIndex,
        has_more: bool,
        response: AppendEntriesResponse,
    },
    SnapshotDeclined(LogIndex),
    SnapshotInstalled(LogIndex),
    HigherTerm(Term),
    Failed(TransportError),
    /// The node no longer wants this replicator
    Stop,
}

pub struct PeerReplicator {
    peer: PeerInfo,
    term: Term,
    node: Addr<RaftNode>,
    transport: Arc<dyn Transport>,
    heartbeat_interval: Duration,
    progress: Progress,
    in_flight: bool,
    pending: bool,
    span: tracing::Span,
}

impl PeerReplicator {
    pub fn new(
        peer: PeerInfo,
        term: Term,
        leader_last_index: LogIndex,
        node: Addr<RaftNode>,
        transport: Arc<dyn Transport>,
        heartbeat_interval: Duration,
        span: &tracing::Span,
    ) -> Self {
        let span = tracing::info_span!(parent: span, "replicator", peer = %peer.id);
        Self {
            peer,
            term,
            node,
            transport,
            heartbeat_interval,
            progress: Progress::new(leader_last_index),
            in_flight: false,
            pending: false,
            span,
        }
    }

    fn replicate(&mut self, ctx: &mut Context<Self>) {
        if self.in_flight {
            self.pending = true;
            return;
        }
        self.in_flight = true;
        self.pending = false;

        let peer = self.peer.clone();
        let node = self.node.clone();
        let transport = self.transport.clone();
        let prepare = PrepareReplication {
            peer: peer.id.clone(),
            term: self.term,
            next_index: self.progress.next_index,
        };

        let exchange = async move {
            let payload = match node.send(prepare).await {
                Ok(Some(payload)) => payload,
                Ok(None) | Err(_) => return Outcome::Stop,
            };
            match payload {
                ReplicationPayload::Entries { request, has_more } => {
                    let last_index = request.last_index();
                    match transport.append_entries(&peer, request).await {
                        Ok(response) => Outcome::Appended {
                            last_index,
                            has_more,
                            response,
                        },
                        Err(e) => Outcome::Failed(e),
                    }
                }
                ReplicationPayload::Snapshot {
                    snapshot,
                    term,
                    leader,
                } => {
                    let offer = SnapshotRequest {
                        term,
                        leader_name: leader.clone(),
                        last_index: snapshot.last_index,
                        last_term: snapshot.last_term,
                    };
                    let agreed = match transport.request_snapshot(&peer, offer).await {
                        Ok(response) if response.term > term => {
                            return Outcome::HigherTerm(response.term)
                        }
                        Ok(response) => response.success,
                        Err(e) => return Outcome::Failed(e),
                    };
                    if !agreed {
                        return Outcome::SnapshotDeclined(snapshot.last_index);
                    }

                    let recovery = SnapshotRecoveryRequest {
                        term,
                        leader_name: leader,
                        last_index: snapshot.last_index,
                        last_term: snapshot.last_term,
                        peers: snapshot.peers.clone(),
                        state: snapshot.state.clone(),
                    };
                    match transport.snapshot_recovery(&peer, recovery).await {
                        Ok(response) if response.term > term => Outcome::HigherTerm(response.term),
                        Ok(response) if response.success => {
                            Outcome::SnapshotInstalled(snapshot.last_index)
                        }
                        Ok(_) => Outcome::Failed(TransportError::Remote(
                            "snapshot install rejected".to_string(),
                        )),
                        Err(e) => Outcome::Failed(e),
                    }
                }
            }
        };

        ctx.spawn(
            exchange
                .into_actor(self)
                .map(|outcome, act, ctx| act.on_outcome(outcome, ctx)),
        );
    }

    fn on_outcome(&mut self, outcome: Outcome, ctx: &mut Context<Self>) {
        let span = self.span.clone();
        let _enter = span.enter();
        self.in_flight = false;

        match outcome {
            Outcome::Stop => ctx.stop(),
            Outcome::Failed(e) => {
                // Retried on the next heartbeat
                tracing::debug!("Replication to {} failed: {}", self.peer.id, e);
            }
            Outcome::HigherTerm(term) => self.report_higher_term(term, ctx),
            Outcome::Appended {
                last_index,
                has_more,
                response,
            } => {
                if response.term > self.term {
                    self.report_higher_term(response.term, ctx);
                    return;
                }
                if response.success {
                    if self.progress.on_success(last_index) {
                        self.report_match();
                    }
                    if has_more || self.pending {
                        self.replicate(ctx);
                    }
                } else {
                    self.progress.on_reject(response.conflict_index);
                    tracing::debug!(
                        "Follower {} rejected entries, retrying from {}",
                        self.peer.id,
                        self.progress.next_index
                    );
                    self.replicate(ctx);
                }
            }
            Outcome::SnapshotDeclined(last_index) => {
                self.progress.next_index = last_index + 1;
                self.replicate(ctx);
            }
            Outcome::SnapshotInstalled(last_index) => {
                tracing::info!(
                    "Follower {} installed snapshot through {}",
                    self.peer.id,
                    last_index
                );
                if self.progress.on_success(last_index) {
                    self.report_match();
                }
                self.replicate(ctx);
            }
        }
    }

    fn report_match(&self) {
        self.node.do_send(ReplicationProgress {
            peer: self.peer.id.clone(),
            term: self.term,
            event: ReplicationEvent::Matched(self.progress.match_index),
        });
    }

    fn report_higher_term(&self, term: Term, ctx: &mut Context<Self>) {
        self.node.do_send(ReplicationProgress {
            peer: self.peer.id.clone(),
            term: self.term,
            event: ReplicationEvent::HigherTerm(term),
        });
        ctx.stop();
    }
}

impl Actor for PeerReplicator {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let span = self.span.clone();
        let _enter = span.enter();
        tracing::debug!("Replicator for {} started (term {})", self.peer.id, self.term);

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            act.replicate(ctx);
        });
        self.replicate(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let _enter = self.span.enter();
        tracing::debug!("Replicator for {} stopped", self.peer.id);
    }
}

impl Handler<Replicate> for PeerReplicator {
    type Result = ();

    fn handle(&mut self, _msg: Replicate, ctx: &mut Context<Self>) -> Self::Result {
        self.replicate(ctx);
    }
}

impl Handler<StopReplication> for PeerReplicator {
    type Result = ();

    fn handle(&mut self, _msg: StopReplication, ctx: &mut Context<Self>) -> Self::Result {
        ctx.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_progress_starts_after_leader_log() {
        let progress = Progress::new(7);
        assert_eq!(progress.next_index, 8);
        assert_eq!(progress.match_index, 0);
    }

    #[test]
    fn test_success_advances_match_once() {
        let mut progress = Progress::new(5);
        assert!(progress.on_success(5));
        assert!(!progress.on_success(5));
        assert_eq!(progress.next_index, 6);
        assert_eq!(progress.match_index, 5);
    }

    #[test]
    fn test_reject_uses_conflict_hint() {
        let mut progress = Progress::new(10);
        progress.on_reject(Some(4));
        assert_eq!(progress.next_index, 4);

        // A hint past our own position never moves us forward
        progress.on_reject(Some(9));
        assert_eq!(progress.next_index, 3);
    }

    #[test]
    fn test_reject_without_hint_decrements() {
        let mut progress = Progress::new(3);
        progress.on_reject(None);
        assert_eq!(progress.next_index, 3);
        progress.on_reject(None);
        progress.on_reject(None);
        progress.on_reject(None);
        assert_eq!(progress.next_index, 1);
    }

    #[test]
    fn test_reject_never_drops_below_match() {
        let mut progress = Progress::new(10);
        progress.on_success(6);
        progress.next_index = 9;
        progress.on_reject(Some(2));
        assert_eq!(progress.next_index, 7);
    }
}
