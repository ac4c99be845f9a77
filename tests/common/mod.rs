#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix::Actor;
use raftd::application::{decode_result, KvCommand, KvStore};
use raftd::config::RaftConfig;
use raftd::network::LocalNetwork;
use raftd::raft::{
    ManualClock, NodeState, PeerInfo, RaftHandle, RaftNode, RaftStateInfo, SeededRandom,
};
use raftd::storage::NodeStorage;

/// Well past the largest election timeout
pub const EXPIRE: Duration = Duration::from_millis(400);

pub fn test_config(node_id: &str, compaction_threshold: u64) -> RaftConfig {
    RaftConfig {
        node_id: node_id.to_string(),
        election_timeout_min_ms: 150,
        election_timeout_max_ms: 300,
        heartbeat_interval_ms: 20,
        tick_interval_ms: 5,
        max_entries_per_append: 8,
        compaction_threshold,
        snapshot_policy: Default::default(),
        data_dir: PathBuf::from("unused"),
    }
}

pub fn peer(id: &str) -> PeerInfo {
    PeerInfo::new(id, format!("mem://{}", id))
}

pub fn set(key: &str, value: &str) -> Vec<u8> {
    KvCommand::Set {
        key: key.to_string(),
        value: value.to_string(),
    }
    .encode()
    .unwrap()
}

pub fn previous_value(result: &[u8]) -> Option<String> {
    decode_result(result).unwrap()
}

pub struct TestNode {
    pub id: String,
    pub handle: RaftHandle,
    /// Only moves when the test says so; elections happen on demand
    pub clock: ManualClock,
    pub store: KvStore,
}

impl TestNode {
    pub async fn state(&self) -> RaftStateInfo {
        self.handle.state().await.unwrap()
    }

    /// Let this node's election timer run out. The round trip makes sure
    /// the actor has started and armed its timer before the clock moves.
    pub async fn expire_timer(&self) {
        self.state().await;
        self.clock.advance(EXPIRE);
    }
}

/// Nodes wired together over an in-process network
pub struct Cluster {
    pub network: LocalNetwork,
    pub nodes: Vec<TestNode>,
    compaction_threshold: u64,
}

impl Cluster {
    /// Start `size` voting nodes named node-1, node-2, ...
    pub fn start(size: usize) -> Self {
        Self::with_compaction(size, 1000)
    }

    pub fn with_compaction(size: usize, compaction_threshold: u64) -> Self {
        let mut cluster = Cluster {
            network: LocalNetwork::new(),
            nodes: Vec::new(),
            compaction_threshold,
        };
        let members: Vec<PeerInfo> = (1..=size).map(|i| peer(&format!("node-{}", i))).collect();
        for i in 1..=size {
            cluster.add_node(&format!("node-{}", i), members.clone());
        }
        cluster
    }

    /// Start a node that knows `members`; it votes only if listed there
    pub fn add_node(&mut self, id: &str, members: Vec<PeerInfo>) -> usize {
        let clock = ManualClock::new();
        let store = KvStore::new();
        let seed = self.nodes.len() as u64 + 1;
        let config = test_config(id, self.compaction_threshold);
        let addr = RaftNode::builder(config, format!("mem://{}", id))
            .peers(members)
            .storage(NodeStorage::in_memory())
            .state_machine(store.clone())
            .transport(self.network.transport(id))
            .clock(Arc::new(clock.clone()))
            .random(SeededRandom::new(seed))
            .build()
            .unwrap()
            .start();
        self.network.register(id, addr.clone());
        self.nodes.push(TestNode {
            id: id.to_string(),
            handle: RaftHandle::new(addr),
            clock,
            store,
        });
        self.nodes.len() - 1
    }

    pub fn node(&self, id: &str) -> &TestNode {
        self.nodes.iter().find(|n| n.id == id).unwrap()
    }

    /// Ids of nodes that currently believe they lead
    pub async fn leaders(&self) -> Vec<String> {
        let mut leaders = Vec::new();
        for node in &self.nodes {
            if let Ok(info) = node.handle.state().await {
                if info.state == NodeState::Leader {
                    leaders.push(node.id.clone());
                }
            }
        }
        leaders
    }

    /// Expire `id`'s timer and wait until it leads
    pub async fn elect(&self, id: &str) {
        let node = self.node(id);
        node.expire_timer().await;
        wait_until(&format!("{} to become leader", id), move || async move {
            node.state().await.state == NodeState::Leader
        })
        .await;
    }
}

/// Poll `check` until it holds, failing the test after a few seconds
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
