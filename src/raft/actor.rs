use actix::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::oneshot;

use super::election::{
    create_request_vote, handle_request_vote, handle_request_vote_response, VoteOutcome,
};
use super::log::{advance_commit_index, create_append_entries, handle_append_entries};
use super::log_store::LogStore;
use super::replicator::{PeerReplicator, Replicate, StopReplication};
use super::rpc::{AppendEntriesRequest, RaftRequest, RaftResponse, RequestVoteResponse};
use super::snapshot::{
    handle_snapshot_recovery, handle_snapshot_request, needs_snapshot, should_capture, Snapshot,
    Snapshotter,
};
use super::state::{NodeState, RaftState};
use super::state_machine::StateMachine;
use super::timer::{Clock, ElectionTimer, RandomSource, SystemClock, ThreadRandom};
use super::types::{Command, LogEntry, LogIndex, NodeId, PeerInfo, Term};
use crate::config::RaftConfig;
use crate::network::transport::{Transport, TransportError};
use crate::storage::{NodeStorage, StateStorage};
use crate::util::errors::{RaftError, Result};

/// Applied results kept for `WaitApplied` calls that arrive late
const RESULT_CACHE_SIZE: usize = 1024;

// Messages that the Raft actor can handle

/// Handle incoming Raft RPC message
#[derive(Message)]
#[rtype(result = "Result<RaftResponse>")]
pub struct HandleRaftRequest {
    pub from: NodeId,
    pub request: RaftRequest,
}

/// Submit a command to be replicated (only leader can handle this).
/// Resolves with the index and term the command was appended at.
#[derive(Message)]
#[rtype(result = "Result<(LogIndex, Term)>")]
pub struct SubmitCommand {
    pub command: Command,
}

impl SubmitCommand {
    pub fn data(data: Vec<u8>) -> Self {
        Self {
            command: Command::Data(data),
        }
    }
}

/// Like [`SubmitCommand`], but resolves once the entry has been applied
#[derive(Message)]
#[rtype(result = "Result<Applied>")]
pub struct SubmitAndWait {
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applied {
    pub index: LogIndex,
    pub term: Term,
    pub result: Vec<u8>,
}

/// Wait for the entry appended at (index, term) to be applied. Fails with
/// `CommandLost` if a different entry ends up at that index.
#[derive(Message)]
#[rtype(result = "Result<Vec<u8>>")]
pub struct WaitApplied {
    pub index: LogIndex,
    pub term: Term,
}

/// Get current Raft state (for debugging/monitoring)
#[derive(Message)]
#[rtype(result = "RaftStateInfo")]
pub struct GetState;

/// Stop the node. Pending waiters fail with `Shutdown`.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Shutdown;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftStateInfo {
    pub node_id: NodeId,
    pub state: NodeState,
    pub current_term: Term,
    pub current_leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub first_log_index: LogIndex,
    pub last_log_index: LogIndex,
    pub voter: bool,
    pub peers: Vec<PeerInfo>,
}

impl RaftStateInfo {
    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    /// Address of the current leader, when it is one of our peers
    pub fn leader_address(&self) -> Option<&str> {
        let leader = self.current_leader.as_ref()?;
        self.peers
            .iter()
            .find(|p| &p.id == leader)
            .map(|p| p.address.as_str())
    }
}

// Implement MessageResponse for RaftStateInfo
impl<A, M> actix::dev::MessageResponse<A, M> for RaftStateInfo
where
    A: Actor,
    M: Message<Result = RaftStateInfo>,
{
    fn handle(self, _ctx: &mut A::Context, tx: Option<actix::dev::OneshotSender<M::Result>>) {
        if let Some(tx) = tx {
            let _ = tx.send(self);
        }
    }
}

/// Check the election timer
struct Tick;

impl Message for Tick {
    type Result = ();
}

/// A replicator asks what to send to its follower next
#[derive(Message)]
#[rtype(result = "Option<ReplicationPayload>")]
pub struct PrepareReplication {
    pub peer: NodeId,
    pub term: Term,
    pub next_index: LogIndex,
}

pub enum ReplicationPayload {
    Entries {
        request: AppendEntriesRequest,
        /// More entries remain after this batch
        has_more: bool,
    },
    Snapshot {
        snapshot: Arc<Snapshot>,
        term: Term,
        leader: NodeId,
    },
}

/// A replicator reports back to the node
#[derive(Message)]
#[rtype(result = "()")]
pub struct ReplicationProgress {
    pub peer: NodeId,
    /// Term the replicator was started in
    pub term: Term,
    pub event: ReplicationEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationEvent {
    Matched(LogIndex),
    HigherTerm(Term),
}

type Waiter = (Term, oneshot::Sender<Result<Vec<u8>>>);
type AppliedResult = std::result::Result<Vec<u8>, String>;

/// Main Raft actor
pub struct RaftNode {
    config: RaftConfig,
    address: String,
    state: RaftState,
    log: LogStore,
    state_storage: Box<dyn StateStorage>,
    snapshotter: Snapshotter,
    state_machine: Box<dyn StateMachine>,
    transport: Arc<dyn Transport>,
    timer: ElectionTimer,
    replicators: HashMap<NodeId, Addr<PeerReplicator>>,
    waiters: BTreeMap<LogIndex, Vec<Waiter>>,
    results: BTreeMap<LogIndex, (Term, AppliedResult)>,
    span: tracing::Span,
}

pub struct RaftNodeBuilder {
    config: RaftConfig,
    address: String,
    peers: Vec<PeerInfo>,
    storage: Option<NodeStorage>,
    state_machine: Option<Box<dyn StateMachine>>,
    transport: Option<Arc<dyn Transport>>,
    clock: Arc<dyn Clock>,
    random: Box<dyn RandomSource>,
}

impl RaftNodeBuilder {
    /// Initial cluster membership. Listing this node too makes it a voter
    /// from the start; leaving it out makes it wait to be added.
    pub fn peers(mut self, peers: Vec<PeerInfo>) -> Self {
        self.peers = peers;
        self
    }

    /// Defaults to file storage under the configured data directory
    pub fn storage(mut self, storage: NodeStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn state_machine(mut self, state_machine: impl StateMachine + 'static) -> Self {
        self.state_machine = Some(Box::new(state_machine));
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn random(mut self, random: impl RandomSource + 'static) -> Self {
        self.random = Box::new(random);
        self
    }

    /// Load persistent state and the latest snapshot, and prepare the node
    pub fn build(self) -> Result<RaftNode> {
        self.config.validate().map_err(RaftError::InvalidConfig)?;
        let mut state_machine = self
            .state_machine
            .ok_or_else(|| RaftError::InvalidConfig("a state machine is required".to_string()))?;
        let transport = self
            .transport
            .ok_or_else(|| RaftError::InvalidConfig("a transport is required".to_string()))?;
        let storage = match self.storage {
            Some(storage) => storage,
            None => NodeStorage::open(&self.config.data_dir)?,
        };

        let node_id = self.config.node_id.clone();
        let span = tracing::info_span!("raft", node = %node_id);
        let _enter = span.enter();

        let mut state = RaftState::new(node_id.clone());
        state.restore(storage.state.load_state()?);

        let mut log = LogStore::new(storage.log);
        let mut snapshotter = Snapshotter::new(storage.snapshots);
        let members = match snapshotter.load()? {
            Some(snapshot) => {
                state_machine.restore(&snapshot.state)?;
                log.recover_snapshot(snapshot.last_index, snapshot.last_term)?;
                state.last_applied = snapshot.last_index;
                tracing::info!(
                    "Node {} restored snapshot through {} (term {})",
                    node_id,
                    snapshot.last_index,
                    snapshot.last_term
                );
                snapshot.peers.clone()
            }
            None => self.peers,
        };
        state.set_membership(members);

        let timer = ElectionTimer::new(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
            self.clock,
            self.random,
        );

        drop(_enter);
        Ok(RaftNode {
            config: self.config,
            address: self.address,
            state,
            log,
            state_storage: storage.state,
            snapshotter,
            state_machine,
            transport,
            timer,
            replicators: HashMap::new(),
            waiters: BTreeMap::new(),
            results: BTreeMap::new(),
            span,
        })
    }
}

impl Actor for RaftNode {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let span = self.span.clone();
        let _enter = span.enter();
        tracing::info!(
            "Node {} started (term: {}, last index: {}, peers: {})",
            self.state.node_id,
            self.state.current_term,
            self.log.last_index(),
            self.state.peers.len()
        );

        if self.state.voter {
            self.timer.reset();
        } else {
            tracing::info!("Node {} waiting to be added to the cluster", self.state.node_id);
        }

        ctx.run_interval(self.config.tick_interval(), |_act, ctx| {
            ctx.notify(Tick);
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let _enter = self.span.enter();
        tracing::info!("Node {} stopped", self.state.node_id);
        for (_, replicator) in self.replicators.drain() {
            replicator.do_send(StopReplication);
        }
        // Dropping the senders fails every waiter with Shutdown
        self.waiters.clear();
    }
}

impl RaftNode {
    pub fn builder(config: RaftConfig, address: impl Into<String>) -> RaftNodeBuilder {
        RaftNodeBuilder {
            config,
            address: address.into(),
            peers: Vec::new(),
            storage: None,
            state_machine: None,
            transport: None,
            clock: Arc::new(SystemClock),
            random: Box::new(ThreadRandom),
        }
    }

    /// Log a failed durable write and stop the node
    fn fail_stop(&self, action: &str, e: &RaftError, ctx: &mut Context<Self>) {
        tracing::error!(
            "Node {} stopping, failed to {}: {}",
            self.state.node_id,
            action,
            e
        );
        ctx.stop();
    }

    fn persist_state(&mut self, ctx: &mut Context<Self>) -> bool {
        match self.state_storage.save_state(&self.state.persistent()) {
            Ok(()) => true,
            Err(e) => {
                self.fail_stop("persist state", &e, ctx);
                false
            }
        }
    }

    fn start_election(&mut self, ctx: &mut Context<Self>) {
        if self.state.is_leader() || !self.state.voter {
            return;
        }

        tracing::info!(
            "Node {} election timeout, starting election",
            self.state.node_id
        );
        self.state.become_candidate();

        // The vote for ourselves must be durable before anyone hears of it
        if !self.persist_state(ctx) {
            return;
        }
        self.timer.reset();

        if self.state.has_majority() {
            self.become_leader(ctx);
            return;
        }

        let request = create_request_vote(&self.state, &self.log);
        let term = request.term;
        for peer in self.state.peers.values().cloned() {
            let transport = self.transport.clone();
            let request = request.clone();
            let send = async move {
                let result = transport.request_vote(&peer, request).await;
                (peer.id, result)
            };
            ctx.spawn(send.into_actor(self).map(move |(from, result), act, ctx| {
                act.on_vote_response(from, term, result, ctx);
            }));
        }
    }

    fn on_vote_response(
        &mut self,
        from: NodeId,
        term: Term,
        result: std::result::Result<RequestVoteResponse, TransportError>,
        ctx: &mut Context<Self>,
    ) {
        let span = self.span.clone();
        let _enter = span.enter();

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("RequestVote to {} failed: {}", from, e);
                return;
            }
        };

        let was_leader = self.state.is_leader();
        match handle_request_vote_response(
            &mut self.state,
            self.state_storage.as_mut(),
            from,
            term,
            response,
        ) {
            Ok(VoteOutcome::Won) => self.become_leader(ctx),
            Ok(_) => {}
            Err(e) if e.is_storage_failure() => {
                self.fail_stop("record vote response", &e, ctx);
                return;
            }
            Err(e) => tracing::error!("Node {} failed to count vote: {}", self.state.node_id, e),
        }
        self.after_role_change(was_leader);
    }

    fn become_leader(&mut self, ctx: &mut Context<Self>) {
        self.state.become_leader();
        self.timer.stop();

        // A no-op in our own term lets earlier entries commit
        let last_index = self.log.last_index();
        let noop = LogEntry::new(self.state.current_term, last_index + 1, Command::Noop);
        if let Err(e) = self.log.append(vec![noop]) {
            self.fail_stop("append no-op", &e, ctx);
            return;
        }

        let peers: Vec<PeerInfo> = self.state.peers.values().cloned().collect();
        for peer in peers {
            self.start_replicator(peer, last_index, ctx);
        }
        self.advance_commit(ctx);
    }

    fn start_replicator(
        &mut self,
        peer: PeerInfo,
        leader_last_index: LogIndex,
        ctx: &mut Context<Self>,
    ) {
        let id = peer.id.clone();
        let replicator = PeerReplicator::new(
            peer,
            self.state.current_term,
            leader_last_index,
            ctx.address(),
            self.transport.clone(),
            self.config.heartbeat_interval(),
            &self.span,
        )
        .start();
        if let Some(previous) = self.replicators.insert(id, replicator) {
            previous.do_send(StopReplication);
        }
    }

    fn stop_replicators(&mut self) {
        for (_, replicator) in self.replicators.drain() {
            replicator.do_send(StopReplication);
        }
    }

    /// Reconcile timers and replicators with the current role
    fn after_role_change(&mut self, was_leader: bool) {
        if was_leader && !self.state.is_leader() {
            tracing::info!(
                "Node {} stepped down in term {}",
                self.state.node_id,
                self.state.current_term
            );
            self.stop_replicators();
        }

        if self.state.is_leader() || !self.state.voter {
            self.timer.stop();
        } else if !self.timer.is_running() {
            self.timer.reset();
        }
    }

    fn heard_from_leader(&mut self) {
        if self.state.voter {
            self.timer.reset();
        }
    }

    /// Append a command as leader. Waiters are registered before anything
    /// can apply the entry.
    fn propose(
        &mut self,
        command: Command,
        waiter: Option<oneshot::Sender<Result<Vec<u8>>>>,
        ctx: &mut Context<Self>,
    ) -> Result<(LogIndex, Term)> {
        if !self.state.is_leader() {
            return Err(RaftError::NotLeader {
                leader: self.state.current_leader.clone(),
            });
        }

        if command.is_membership_change() {
            if let Some(pending) = self.log.pending_membership_change() {
                return Err(RaftError::MembershipChangePending(pending));
            }
        }

        let index = self.log.last_index() + 1;
        let term = self.state.current_term;
        let kind = command.name();
        if let Err(e) = self.log.append(vec![LogEntry::new(term, index, command)]) {
            if e.is_storage_failure() {
                self.fail_stop("append entry", &e, ctx);
            }
            return Err(e);
        }
        if let Some(tx) = waiter {
            self.waiters.entry(index).or_default().push((term, tx));
        }

        tracing::debug!(
            "Leader {} appended {} entry at index {}",
            self.state.node_id,
            kind,
            index
        );

        for replicator in self.replicators.values() {
            replicator.do_send(Replicate);
        }
        self.advance_commit(ctx);
        Ok((index, term))
    }

    fn advance_commit(&mut self, ctx: &mut Context<Self>) {
        if advance_commit_index(&self.state, &mut self.log) {
            self.apply_committed(ctx);
        }
    }

    /// Apply every committed entry not yet applied, in index order
    fn apply_committed(&mut self, ctx: &mut Context<Self>) {
        while self.state.last_applied < self.log.commit_index() {
            let index = self.state.last_applied + 1;
            let entry = match self.log.entry(index) {
                Some(entry) => entry.clone(),
                None => {
                    tracing::error!(
                        "Node {} cannot apply missing entry {}",
                        self.state.node_id,
                        index
                    );
                    break;
                }
            };

            let result = match entry.command {
                Command::Noop => Ok(Vec::new()),
                Command::Data(data) => self.state_machine.apply(index, &data),
                Command::AddPeer(peer) => {
                    self.apply_add_peer(peer, ctx);
                    Ok(Vec::new())
                }
                Command::RemovePeer(id) => {
                    self.apply_remove_peer(&id);
                    Ok(Vec::new())
                }
            };
            self.state.last_applied = index;

            let result = result.map_err(|e| {
                tracing::warn!("State machine rejected entry {}: {}", index, e);
                e.to_string()
            });
            self.finish(index, entry.term, result);
        }

        self.maybe_compact();
    }

    /// Hand an applied entry's result to its waiters
    fn finish(&mut self, index: LogIndex, term: Term, result: AppliedResult) {
        if let Some(waiters) = self.waiters.remove(&index) {
            for (waiter_term, tx) in waiters {
                let outcome = if waiter_term == term {
                    result.clone().map_err(RaftError::StateMachine)
                } else {
                    Err(RaftError::CommandLost {
                        index,
                        term: waiter_term,
                    })
                };
                let _ = tx.send(outcome);
            }
        }

        self.results.insert(index, (term, result));
        while self.results.len() > RESULT_CACHE_SIZE {
            self.results.pop_first();
        }
    }

    /// Result for an entry that has already been applied
    fn applied_result(&self, index: LogIndex, term: Term) -> Result<Vec<u8>> {
        match self.results.get(&index) {
            Some((applied_term, result)) if *applied_term == term => {
                result.clone().map_err(RaftError::StateMachine)
            }
            Some(_) => Err(RaftError::CommandLost { index, term }),
            None => match self.log.term(index) {
                Ok(applied_term) if applied_term != term => {
                    Err(RaftError::CommandLost { index, term })
                }
                _ => Err(RaftError::NotFound(index)),
            },
        }
    }

    fn apply_add_peer(&mut self, peer: PeerInfo, ctx: &mut Context<Self>) {
        if peer.id == self.state.node_id {
            if !self.state.voter {
                tracing::info!("Node {} joined the cluster", self.state.node_id);
                self.state.voter = true;
                if !self.state.is_leader() {
                    self.timer.reset();
                }
            }
            return;
        }

        tracing::info!(
            "Node {} adding peer {} ({})",
            self.state.node_id,
            peer.id,
            peer.address
        );
        self.state.peers.insert(peer.id.clone(), peer.clone());
        if self.state.is_leader() {
            self.state.match_index.entry(peer.id.clone()).or_insert(0);
            let last_index = self.log.last_index();
            self.start_replicator(peer, last_index, ctx);
        }
    }

    fn apply_remove_peer(&mut self, id: &NodeId) {
        if *id == self.state.node_id {
            tracing::info!("Node {} removed from the cluster", self.state.node_id);
            self.state.voter = false;
            if self.state.is_leader() {
                let term = self.state.current_term;
                self.state.become_follower(term, None);
                self.stop_replicators();
            }
            self.timer.stop();
            return;
        }

        tracing::info!("Node {} removing peer {}", self.state.node_id, id);
        self.state.peers.remove(id);
        self.state.match_index.remove(id);
        if let Some(replicator) = self.replicators.remove(id) {
            replicator.do_send(StopReplication);
        }
        // A smaller quorum may already cover more entries
        if self.state.is_leader() {
            advance_commit_index(&self.state, &mut self.log);
        }
    }

    /// Snapshot and compact once enough applied entries sit in the log
    fn maybe_compact(&mut self) {
        let index = self.state.last_applied;
        if !should_capture(index, &self.log, self.config.compaction_threshold) {
            return;
        }

        let term = match self.log.term(index) {
            Ok(term) => term,
            Err(e) => {
                tracing::error!("Node {} cannot snapshot at {}: {}", self.state.node_id, index, e);
                return;
            }
        };
        let peers = self.state.membership(&self.address);
        if let Err(e) = self
            .snapshotter
            .capture(self.state_machine.as_ref(), index, term, peers)
        {
            tracing::error!("Node {} failed to capture snapshot: {}", self.state.node_id, e);
            return;
        }
        match self.log.compact_through(index, term) {
            Ok(()) => tracing::info!(
                "Node {} took snapshot and compacted log through {}",
                self.state.node_id,
                index
            ),
            Err(e) => tracing::error!("Node {} failed to compact log: {}", self.state.node_id, e),
        }
    }

    /// Waiters inside an installed snapshot cannot learn their result
    fn fail_covered_waiters(&mut self) {
        let covered: Vec<LogIndex> = self
            .waiters
            .range(..=self.state.last_applied)
            .map(|(index, _)| *index)
            .collect();
        for index in covered {
            if let Some(waiters) = self.waiters.remove(&index) {
                for (term, tx) in waiters {
                    let _ = tx.send(Err(RaftError::CommandLost { index, term }));
                }
            }
        }
        let applied = self.state.last_applied;
        self.results.retain(|index, _| *index > applied);
    }

    /// Fail waiters whose entries were truncated or overwritten by a newer
    /// leader. Only indexes this node held before the append are checked.
    fn fail_superseded_waiters(&mut self, previous_last: LogIndex) {
        let last_index = self.log.last_index();
        let indexes: Vec<LogIndex> = self
            .waiters
            .range(..=previous_last)
            .map(|(index, _)| *index)
            .collect();
        for index in indexes {
            let current = self.log.term(index).ok();
            if let Some(waiters) = self.waiters.remove(&index) {
                let mut kept = Vec::new();
                for (term, tx) in waiters {
                    if index > last_index || matches!(current, Some(t) if t != term) {
                        let _ = tx.send(Err(RaftError::CommandLost { index, term }));
                    } else {
                        kept.push((term, tx));
                    }
                }
                if !kept.is_empty() {
                    self.waiters.insert(index, kept);
                }
            }
        }
    }

    fn handle_request(
        &mut self,
        request: RaftRequest,
        ctx: &mut Context<Self>,
    ) -> Result<RaftResponse> {
        match request {
            RaftRequest::RequestVote(request) => {
                let response = handle_request_vote(
                    &mut self.state,
                    self.state_storage.as_mut(),
                    &self.log,
                    request,
                )?;

                // Reset election timeout if we granted the vote
                if response.vote_granted {
                    self.timer.reset();
                }
                Ok(RaftResponse::RequestVote(response))
            }

            RaftRequest::AppendEntries(request) => {
                let term = request.term;
                let previous_last = self.log.last_index();
                let response = handle_append_entries(
                    &mut self.state,
                    self.state_storage.as_mut(),
                    &mut self.log,
                    request,
                )?;
                self.fail_superseded_waiters(previous_last);
                if term == self.state.current_term {
                    self.heard_from_leader();
                }
                self.apply_committed(ctx);
                Ok(RaftResponse::AppendEntries(response))
            }

            RaftRequest::Snapshot(request) => {
                let term = request.term;
                let response = handle_snapshot_request(
                    &mut self.state,
                    self.state_storage.as_mut(),
                    &self.log,
                    request,
                )?;
                if term == self.state.current_term {
                    self.heard_from_leader();
                }
                Ok(RaftResponse::Snapshot(response))
            }

            RaftRequest::SnapshotRecovery(request) => {
                let term = request.term;
                let response = match handle_snapshot_recovery(
                    &mut self.state,
                    self.state_storage.as_mut(),
                    &mut self.log,
                    self.state_machine.as_mut(),
                    &mut self.snapshotter,
                    request,
                ) {
                    Ok(response) => response,
                    Err(e @ RaftError::SnapshotInstall(_)) => {
                        tracing::error!("Node {} stopping: {}", self.state.node_id, e);
                        ctx.stop();
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                };
                if term == self.state.current_term {
                    self.heard_from_leader();
                }
                self.fail_covered_waiters();
                Ok(RaftResponse::SnapshotRecovery(response))
            }
        }
    }
}

// Handler implementations

impl Handler<HandleRaftRequest> for RaftNode {
    type Result = Result<RaftResponse>;

    fn handle(&mut self, msg: HandleRaftRequest, ctx: &mut Context<Self>) -> Self::Result {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.state.state == NodeState::Snapshotting {
            return Err(RaftError::SnapshotInstall(
                "snapshot install in progress".to_string(),
            ));
        }

        tracing::trace!("Node {} handling request from {}", self.state.node_id, msg.from);
        let was_leader = self.state.is_leader();
        let response = self.handle_request(msg.request, ctx);
        if let Err(e) = &response {
            if e.is_storage_failure() {
                self.fail_stop("handle request", e, ctx);
            }
        }
        self.after_role_change(was_leader);
        response
    }
}

impl Handler<Tick> for RaftNode {
    type Result = ();

    fn handle(&mut self, _msg: Tick, ctx: &mut Context<Self>) -> Self::Result {
        if self.timer.poll_expired() {
            let span = self.span.clone();
            let _enter = span.enter();
            self.start_election(ctx);
        }
    }
}

impl Handler<SubmitCommand> for RaftNode {
    type Result = Result<(LogIndex, Term)>;

    fn handle(&mut self, msg: SubmitCommand, ctx: &mut Context<Self>) -> Self::Result {
        let span = self.span.clone();
        let _enter = span.enter();
        self.propose(msg.command, None, ctx)
    }
}

impl Handler<SubmitAndWait> for RaftNode {
    type Result = ResponseFuture<Result<Applied>>;

    fn handle(&mut self, msg: SubmitAndWait, ctx: &mut Context<Self>) -> Self::Result {
        let span = self.span.clone();
        let _enter = span.enter();

        let (tx, rx) = oneshot::channel();
        match self.propose(msg.command, Some(tx), ctx) {
            Ok((index, term)) => Box::pin(async move {
                let result = rx.await.map_err(|_| RaftError::Shutdown)??;
                Ok(Applied {
                    index,
                    term,
                    result,
                })
            }),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }
}

impl Handler<WaitApplied> for RaftNode {
    type Result = ResponseFuture<Result<Vec<u8>>>;

    fn handle(&mut self, msg: WaitApplied, _ctx: &mut Context<Self>) -> Self::Result {
        let span = self.span.clone();
        let _enter = span.enter();

        if msg.index <= self.state.last_applied {
            let result = self.applied_result(msg.index, msg.term);
            return Box::pin(async move { result });
        }

        tracing::trace!(
            "Node {} waiting for entry {} (term {})",
            self.state.node_id,
            msg.index,
            msg.term
        );
        let (tx, rx) = oneshot::channel();
        self.waiters
            .entry(msg.index)
            .or_default()
            .push((msg.term, tx));
        Box::pin(async move { rx.await.map_err(|_| RaftError::Shutdown)? })
    }
}

impl Handler<Shutdown> for RaftNode {
    type Result = ();

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Context<Self>) -> Self::Result {
        let span = self.span.clone();
        let _enter = span.enter();
        tracing::info!("Node {} shutting down", self.state.node_id);
        ctx.stop();
    }
}

impl Handler<GetState> for RaftNode {
    type Result = RaftStateInfo;

    fn handle(&mut self, _msg: GetState, _ctx: &mut Context<Self>) -> Self::Result {
        RaftStateInfo {
            node_id: self.state.node_id.clone(),
            state: self.state.state,
            current_term: self.state.current_term,
            current_leader: self.state.current_leader.clone(),
            commit_index: self.log.commit_index(),
            last_applied: self.state.last_applied,
            first_log_index: self.log.first_index(),
            last_log_index: self.log.last_index(),
            voter: self.state.voter,
            peers: self.state.peers.values().cloned().collect(),
        }
    }
}

impl Handler<PrepareReplication> for RaftNode {
    type Result = Option<ReplicationPayload>;

    fn handle(&mut self, msg: PrepareReplication, _ctx: &mut Context<Self>) -> Self::Result {
        if !self.state.is_leader()
            || msg.term != self.state.current_term
            || !self.state.peers.contains_key(&msg.peer)
        {
            return None;
        }

        let span = self.span.clone();
        let _enter = span.enter();

        let next_index = msg.next_index.min(self.log.last_index() + 1).max(1);
        let latest = self.snapshotter.latest();
        if needs_snapshot(
            next_index,
            &self.log,
            latest.as_deref(),
            &self.config.snapshot_policy,
        ) {
            return match latest {
                Some(snapshot) => {
                    tracing::info!(
                        "Leader {} sending snapshot through {} to {}",
                        self.state.node_id,
                        snapshot.last_index,
                        msg.peer
                    );
                    Some(ReplicationPayload::Snapshot {
                        snapshot,
                        term: self.state.current_term,
                        leader: self.state.node_id.clone(),
                    })
                }
                None => {
                    tracing::error!(
                        "Leader {} has no snapshot for {} at index {}",
                        self.state.node_id,
                        msg.peer,
                        next_index
                    );
                    None
                }
            };
        }

        match create_append_entries(
            &self.state,
            &self.log,
            next_index,
            self.config.max_entries_per_append,
        ) {
            Ok(request) => {
                let has_more = request.last_index() < self.log.last_index();
                Some(ReplicationPayload::Entries { request, has_more })
            }
            Err(e) => {
                tracing::error!(
                    "Failed to create AppendEntries for {}: {}",
                    msg.peer,
                    e
                );
                None
            }
        }
    }
}

impl Handler<ReplicationProgress> for RaftNode {
    type Result = ();

    fn handle(&mut self, msg: ReplicationProgress, ctx: &mut Context<Self>) -> Self::Result {
        // Results from an earlier leadership are stale
        if msg.term != self.state.current_term || !self.state.is_leader() {
            return;
        }

        let span = self.span.clone();
        let _enter = span.enter();

        match msg.event {
            ReplicationEvent::Matched(index) => {
                if !self.state.peers.contains_key(&msg.peer) {
                    return;
                }
                let matched = self.state.match_index.entry(msg.peer).or_insert(0);
                if index > *matched {
                    *matched = index;
                }
                self.advance_commit(ctx);
            }
            ReplicationEvent::HigherTerm(term) => {
                if self.state.update_term(term) && !self.persist_state(ctx) {
                    return;
                }
                self.after_role_change(true);
            }
        }
    }
}
