//! A replicated key-value map, the sample state machine driven by `raftd`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::raft::state_machine::StateMachine;
use crate::raft::types::LogIndex;
use crate::util::errors::{RaftError, Result};

/// Commands carried in the log's data entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
    /// Read through the log, so the answer reflects every earlier write
    Get { key: String },
}

impl KvCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Decode the result of applying a [`KvCommand`]: the previous value for
/// `Set`/`Delete`, the current value for `Get`
pub fn decode_result(bytes: &[u8]) -> Result<Option<String>> {
    Ok(bincode::deserialize(bytes)?)
}

/// Cloning shares the underlying map, so a clone kept outside the node
/// can observe what has been applied.
#[derive(Debug, Clone, Default)]
pub struct KvStore {
    data: Arc<RwLock<BTreeMap<String, String>>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, String>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, String>> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy of the whole map
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.read().clone()
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Result<Vec<u8>> {
        let command = KvCommand::decode(command)
            .map_err(|e| RaftError::StateMachine(format!("bad command at {}: {}", index, e)))?;

        let result = match command {
            KvCommand::Set { key, value } => self.write().insert(key, value),
            KvCommand::Delete { key } => self.write().remove(&key),
            KvCommand::Get { key } => self.get(&key),
        };
        Ok(bincode::serialize(&result)?)
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&*self.read())?)
    }

    fn restore(&mut self, image: &[u8]) -> Result<()> {
        // Decode fully before swapping so a bad image leaves us untouched
        let restored: BTreeMap<String, String> = bincode::deserialize(image)?;
        *self.write() = restored;
        Ok(())
    }
}
