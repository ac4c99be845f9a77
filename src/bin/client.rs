use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use raftd::{
    application::{decode_result, KvCommand},
    network::{send_request, WireRequest, WireResponse},
};
use serde_json::json;
use std::time::Duration;

/// Redirects followed before giving up
const MAX_REDIRECTS: usize = 5;

#[derive(Parser, Debug)]
#[command(name = "raft-client", about = "Talk to a raftd cluster")]
struct Args {
    /// Any node of the cluster; requests are redirected to the leader
    #[arg(short, long, default_value = "127.0.0.1:7001")]
    addr: String,

    /// Per-request timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Set a key
    Set { key: String, value: String },
    /// Read a key through the log
    Get { key: String },
    /// Delete a key
    Delete { key: String },
    /// Show the node's Raft state
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout_ms);

    let command = match args.command {
        Cmd::Set { key, value } => KvCommand::Set { key, value },
        Cmd::Get { key } => KvCommand::Get { key },
        Cmd::Delete { key } => KvCommand::Delete { key },
        Cmd::Status => {
            return match send_request(&args.addr, WireRequest::Status, timeout).await? {
                WireResponse::Status(info) => {
                    println!("{}", serde_json::to_string_pretty(&info)?);
                    Ok(())
                }
                other => Err(unexpected(other)),
            };
        }
    };

    let data = command.encode()?;
    let mut addr = args.addr;
    for _ in 0..=MAX_REDIRECTS {
        match send_request(&addr, WireRequest::Submit(data.clone()), timeout).await? {
            WireResponse::Applied {
                index,
                term,
                result,
            } => {
                let value = decode_result(&result)?;
                let output = json!({ "index": index, "term": term, "value": value });
                println!("{}", serde_json::to_string_pretty(&output)?);
                return Ok(());
            }
            WireResponse::NotLeader {
                address: Some(leader),
                ..
            } => {
                eprintln!("{} is not the leader, retrying at {}", addr, leader);
                addr = leader;
            }
            WireResponse::NotLeader { leader, .. } => {
                bail!("no reachable leader (last known: {:?})", leader)
            }
            WireResponse::Error(e) => bail!("request failed: {}", e),
            other => return Err(unexpected(other)),
        }
    }
    bail!("gave up after {} redirects", MAX_REDIRECTS)
}

fn unexpected(response: WireResponse) -> anyhow::Error {
    anyhow!("unexpected response: {:?}", response)
}
