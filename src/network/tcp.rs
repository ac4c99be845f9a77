//! TCP transport: one connection per request, length-prefixed bincode
//! frames in both directions.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use super::codec::{decode, encode, frame_codec, WireRequest, WireResponse};
use super::transport::{EnvelopeTransport, TransportError};
use crate::raft::handle::RaftHandle;
use crate::raft::rpc::{RaftRequest, RaftResponse};
use crate::raft::types::PeerInfo;
use crate::util::errors::RaftError;

pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl EnvelopeTransport for TcpTransport {
    async fn call(
        &self,
        peer: &PeerInfo,
        request: RaftRequest,
    ) -> Result<RaftResponse, TransportError> {
        match send_request(&peer.address, WireRequest::Raft(request), self.timeout).await? {
            WireResponse::Raft(response) => Ok(response),
            WireResponse::Error(e) => Err(TransportError::Remote(e)),
            other => Err(TransportError::Codec(format!(
                "unexpected response from {}: {:?}",
                peer.id, other
            ))),
        }
    }
}

/// Send one request to `address` and wait for its response
pub async fn send_request(
    address: &str,
    request: WireRequest,
    timeout: Duration,
) -> Result<WireResponse, TransportError> {
    tokio::time::timeout(timeout, exchange(address, &request))
        .await
        .map_err(|_| TransportError::Timeout)?
}

async fn exchange(address: &str, request: &WireRequest) -> Result<WireResponse, TransportError> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, frame_codec());

    framed.send(encode(request)?).await?;
    match framed.next().await {
        Some(frame) => decode(&frame?),
        None => Err(TransportError::Io("connection closed before response".to_string())),
    }
}

/// Accept connections and dispatch their requests to the node
pub async fn serve(listener: TcpListener, node: RaftHandle) -> std::io::Result<()> {
    tracing::info!("Listening on {}", listener.local_addr()?);
    loop {
        let (stream, remote) = listener.accept().await?;
        let node = node.clone();
        actix::spawn(async move {
            if let Err(e) = handle_connection(stream, node).await {
                tracing::debug!("Connection from {} ended: {}", remote, e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, node: RaftHandle) -> Result<(), TransportError> {
    let mut framed = Framed::new(stream, frame_codec());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let response = match decode::<WireRequest>(&frame) {
            Ok(request) => dispatch(&node, request).await,
            Err(e) => WireResponse::Error(e.to_string()),
        };
        framed.send(encode(&response)?).await?;
    }
    Ok(())
}

async fn dispatch(node: &RaftHandle, request: WireRequest) -> WireResponse {
    match request {
        WireRequest::Raft(request) => {
            let from = request.sender().clone();
            match node.handle_request(from, request).await {
                Ok(response) => WireResponse::Raft(response),
                Err(e) => WireResponse::Error(e.to_string()),
            }
        }
        WireRequest::Submit(data) => match node.submit_and_wait(data).await {
            Ok(applied) => WireResponse::Applied {
                index: applied.index,
                term: applied.term,
                result: applied.result,
            },
            Err(RaftError::NotLeader { leader }) => {
                let address = match node.state().await {
                    Ok(info) => info.leader_address().map(str::to_string),
                    Err(_) => None,
                };
                WireResponse::NotLeader { leader, address }
            }
            Err(e) => WireResponse::Error(e.to_string()),
        },
        WireRequest::Status => match node.state().await {
            Ok(info) => WireResponse::Status(info),
            Err(e) => WireResponse::Error(e.to_string()),
        },
    }
}
