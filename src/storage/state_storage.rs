use super::{read_if_exists, write_atomic};
use crate::raft::types::{NodeId, Term};
use crate::util::errors::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Persistent state that must survive crashes.
///
/// Term and vote are always written together, so a vote can never outlive
/// the term it was cast in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    /// Latest term server has seen (initialized to 0)
    pub current_term: Term,
    /// Candidate that received vote in current term (or None)
    pub voted_for: Option<NodeId>,
}

/// Trait for persistent state storage
pub trait StateStorage: Send {
    fn save_state(&mut self, state: &PersistentState) -> Result<()>;
    fn load_state(&self) -> Result<PersistentState>;
}

/// Keeps the vote record in memory only
#[derive(Debug, Default)]
pub struct MemStateStorage {
    state: PersistentState,
}

impl MemStateStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStorage for MemStateStorage {
    fn save_state(&mut self, state: &PersistentState) -> Result<()> {
        self.state = state.clone();
        Ok(())
    }

    fn load_state(&self) -> Result<PersistentState> {
        Ok(self.state.clone())
    }
}

/// Term and vote in one bincode file, rewritten whole on every change
pub struct FileStateStorage {
    data_dir: PathBuf,
    state: PersistentState,
}

const STATE_FILE: &str = "raft_state.bin";

impl FileStateStorage {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir)?;

        let state = match read_if_exists(&data_dir.join(STATE_FILE))? {
            Some(buffer) if !buffer.is_empty() => {
                let state: PersistentState = bincode::deserialize(&buffer)?;
                tracing::info!(
                    "Loaded persistent state: term={}, voted_for={:?}",
                    state.current_term,
                    state.voted_for
                );
                state
            }
            _ => PersistentState::default(),
        };

        Ok(Self { data_dir, state })
    }
}

impl StateStorage for FileStateStorage {
    fn save_state(&mut self, state: &PersistentState) -> Result<()> {
        write_atomic(&self.data_dir, STATE_FILE, &bincode::serialize(state)?)?;
        self.state = state.clone();
        Ok(())
    }

    fn load_state(&self) -> Result<PersistentState> {
        Ok(self.state.clone())
    }
}
