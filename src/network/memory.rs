//! In-process transport for tests and embedding.
//!
//! Nodes register their actor address; requests are delivered as actor
//! messages. Links can be cut to simulate partitions.

use actix::Addr;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::transport::{EnvelopeTransport, TransportError};
use crate::raft::actor::{HandleRaftRequest, RaftNode};
use crate::raft::rpc::{RaftRequest, RaftResponse};
use crate::raft::types::{NodeId, PeerInfo};

#[derive(Default)]
struct Registry {
    nodes: HashMap<NodeId, Addr<RaftNode>>,
    isolated: HashSet<NodeId>,
    /// Directed links that drop traffic
    cut: HashSet<(NodeId, NodeId)>,
}

impl Registry {
    fn reachable(&self, from: &NodeId, to: &NodeId) -> bool {
        !self.isolated.contains(from)
            && !self.isolated.contains(to)
            && !self.cut.contains(&(from.clone(), to.clone()))
    }
}

/// Maps node ids to running nodes
#[derive(Clone, Default)]
pub struct LocalNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a node so others can reach it
    pub fn register(&self, node_id: impl Into<NodeId>, addr: Addr<RaftNode>) {
        self.registry().nodes.insert(node_id.into(), addr);
    }

    /// Drop all traffic to and from a node
    pub fn isolate(&self, node_id: &str) {
        self.registry().isolated.insert(node_id.to_string());
    }

    /// Drop traffic between two nodes, both ways
    pub fn cut(&self, a: &str, b: &str) {
        let mut registry = self.registry();
        registry.cut.insert((a.to_string(), b.to_string()));
        registry.cut.insert((b.to_string(), a.to_string()));
    }

    /// Restore every link
    pub fn heal(&self) {
        let mut registry = self.registry();
        registry.isolated.clear();
        registry.cut.clear();
    }

    /// A transport that sends on behalf of `from`
    pub fn transport(&self, from: impl Into<NodeId>) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            from: from.into(),
            network: self.clone(),
        })
    }

    fn route(&self, from: &NodeId, to: &NodeId) -> Result<Addr<RaftNode>, TransportError> {
        let registry = self.registry();
        if !registry.reachable(from, to) {
            return Err(TransportError::Unreachable(to.clone()));
        }
        registry
            .nodes
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(to.clone()))
    }
}

pub struct LocalTransport {
    from: NodeId,
    network: LocalNetwork,
}

#[async_trait]
impl EnvelopeTransport for LocalTransport {
    async fn call(
        &self,
        peer: &PeerInfo,
        request: RaftRequest,
    ) -> Result<RaftResponse, TransportError> {
        let addr = self.network.route(&self.from, &peer.id)?;
        let response = addr
            .send(HandleRaftRequest {
                from: self.from.clone(),
                request,
            })
            .await
            .map_err(|_| TransportError::Unreachable(peer.id.clone()))?
            .map_err(|e| TransportError::Remote(e.to_string()))?;

        // The partition may have formed while the request was in flight
        self.network.route(&peer.id, &self.from)?;
        Ok(response)
    }
}
