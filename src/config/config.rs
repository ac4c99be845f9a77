use crate::raft::types::PeerInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// When the leader ships a snapshot instead of log entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    /// Also send the snapshot when a follower is more than this many entries
    /// behind and the snapshot covers its next index. `None` only sends
    /// snapshots when the needed entries have been compacted away.
    #[serde(default)]
    pub lag_threshold: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Unique identifier for this node
    pub node_id: String,

    /// Minimum election timeout in milliseconds (e.g., 150)
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds (e.g., 300)
    pub election_timeout_max_ms: u64,

    /// Heartbeat interval in milliseconds (e.g., 50)
    /// Should be much less than election timeout
    pub heartbeat_interval_ms: u64,

    /// How often the election timer is checked
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Upper bound on entries per AppendEntries request
    #[serde(default = "default_max_entries_per_append")]
    pub max_entries_per_append: usize,

    /// Take a snapshot once this many applied entries sit in the log
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: u64,

    #[serde(default)]
    pub snapshot_policy: SnapshotPolicy,

    /// Directory for persistent storage
    pub data_dir: PathBuf,
}

fn default_tick_interval_ms() -> u64 {
    10
}

fn default_max_entries_per_append() -> usize {
    64
}

fn default_compaction_threshold() -> u64 {
    1000
}

impl RaftConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err("election_timeout_min must be less than election_timeout_max".to_string());
        }

        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err("heartbeat_interval must be less than election_timeout_min".to_string());
        }

        if self.tick_interval_ms == 0 || self.tick_interval_ms >= self.election_timeout_min_ms {
            return Err("tick_interval must be between 1 and election_timeout_min".to_string());
        }

        if self.node_id.is_empty() {
            return Err("node_id cannot be empty".to_string());
        }

        if self.max_entries_per_append == 0 {
            return Err("max_entries_per_append must be at least 1".to_string());
        }

        if self.compaction_threshold == 0 {
            return Err("compaction_threshold must be at least 1".to_string());
        }

        Ok(())
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_string(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            tick_interval_ms: default_tick_interval_ms(),
            max_entries_per_append: default_max_entries_per_append(),
            compaction_threshold: default_compaction_threshold(),
            snapshot_policy: SnapshotPolicy::default(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub listen_addr: String,
    /// Per-request timeout for outgoing RPCs
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Initial cluster members; this node may be listed too
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

fn default_rpc_timeout_ms() -> u64 {
    500
}

impl NetworkConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7001".to_string(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    pub raft: RaftConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let contents =
            fs::read_to_string(path).map_err(|e| format!("Failed to read config file: {}", e))?;

        let config: Config =
            toml::from_str(&contents).map_err(|e| format!("Failed to parse config file: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.raft.validate()?;

        let mut seen = HashSet::new();
        for peer in &self.network.peers {
            if !seen.insert(&peer.id) {
                return Err(format!("Peer {} is listed twice", peer.id));
            }
            if peer.id == self.raft.node_id && peer.address != self.network.listen_addr {
                return Err(format!(
                    "Peer entry for this node ({}) does not match listen_addr",
                    peer.id
                ));
            }
        }

        Ok(())
    }
}
