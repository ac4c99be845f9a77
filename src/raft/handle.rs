use actix::Addr;

use super::actor::{
    Applied, GetState, HandleRaftRequest, RaftNode, RaftStateInfo, Shutdown, SubmitAndWait,
    SubmitCommand, WaitApplied,
};
use super::rpc::{RaftRequest, RaftResponse};
use super::types::{Command, LogIndex, NodeId, PeerInfo, Term};
use crate::util::errors::Result;

/// Cloneable client-side handle to a running [`RaftNode`]
#[derive(Clone)]
pub struct RaftHandle {
    addr: Addr<RaftNode>,
}

impl RaftHandle {
    pub fn new(addr: Addr<RaftNode>) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> &Addr<RaftNode> {
        &self.addr
    }

    /// Append an application command; returns where it landed
    pub async fn submit(&self, data: Vec<u8>) -> Result<(LogIndex, Term)> {
        self.addr.send(SubmitCommand::data(data)).await?
    }

    /// Append an application command and wait for its result
    pub async fn submit_and_wait(&self, data: Vec<u8>) -> Result<Applied> {
        self.addr
            .send(SubmitAndWait {
                command: Command::Data(data),
            })
            .await?
    }

    pub async fn wait_applied(&self, index: LogIndex, term: Term) -> Result<Vec<u8>> {
        self.addr.send(WaitApplied { index, term }).await?
    }

    pub async fn add_peer(&self, peer: PeerInfo) -> Result<Applied> {
        self.addr
            .send(SubmitAndWait {
                command: Command::AddPeer(peer),
            })
            .await?
    }

    pub async fn remove_peer(&self, id: NodeId) -> Result<Applied> {
        self.addr
            .send(SubmitAndWait {
                command: Command::RemovePeer(id),
            })
            .await?
    }

    pub async fn state(&self) -> Result<RaftStateInfo> {
        Ok(self.addr.send(GetState).await?)
    }

    /// Stop the node; later calls fail with `Shutdown`
    pub async fn shutdown(&self) -> Result<()> {
        Ok(self.addr.send(Shutdown).await?)
    }

    /// Deliver an RPC from a peer
    pub async fn handle_request(&self, from: NodeId, request: RaftRequest) -> Result<RaftResponse> {
        self.addr.send(HandleRaftRequest { from, request }).await?
    }
}
