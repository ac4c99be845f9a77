use actix::prelude::*;
use anyhow::{anyhow, Context as _};
use clap::Parser;
use raftd::{
    application::KvStore,
    config::Config,
    network::{serve, TcpTransport},
    raft::{RaftHandle, RaftNode},
    storage::NodeStorage,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "raftd", about = "Replicated key-value node")]
struct Args {
    /// Path to the node's TOML configuration
    #[arg(short, long, default_value = "raftd.toml")]
    config: PathBuf,

    /// trace, debug, info, warn or error
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

#[actix_rt::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    let config = Config::load(&args.config).map_err(|e| anyhow!(e))?;
    tracing::info!(
        "Starting node {} on {} ({} configured peers)",
        config.raft.node_id,
        config.network.listen_addr,
        config.network.peers.len()
    );

    let storage = NodeStorage::open(&config.raft.data_dir)
        .with_context(|| format!("opening {}", config.raft.data_dir.display()))?;
    let transport = Arc::new(TcpTransport::new(config.network.rpc_timeout()));

    let node = RaftNode::builder(config.raft.clone(), config.network.listen_addr.clone())
        .peers(config.network.peers.clone())
        .storage(storage)
        .state_machine(KvStore::new())
        .transport(transport)
        .build()?;
    let addr = node.start();

    let listener = TcpListener::bind(&config.network.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.network.listen_addr))?;
    let handle = RaftHandle::new(addr);
    let server = actix::spawn(serve(listener, handle.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    server.abort();
    if let Err(e) = handle.shutdown().await {
        tracing::warn!("Node already stopped: {}", e);
    }
    System::current().stop();
    Ok(())
}
