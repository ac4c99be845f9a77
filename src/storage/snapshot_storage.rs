use super::{read_if_exists, write_atomic};
use crate::raft::snapshot::Snapshot;
use crate::util::errors::Result;
use std::fs;
use std::path::PathBuf;

const SNAPSHOT_FILE: &str = "snapshot.bin";

/// Trait for persisting the latest snapshot. Only the newest one is kept.
pub trait SnapshotStorage: Send {
    fn save(&mut self, snapshot: &Snapshot) -> Result<()>;
    fn load(&self) -> Result<Option<Snapshot>>;
}

#[derive(Debug, Default)]
pub struct MemSnapshotStorage {
    snapshot: Option<Snapshot>,
}

impl MemSnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStorage for MemSnapshotStorage {
    fn save(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.clone())
    }
}

/// Stores the snapshot as a single bincode file, replaced atomically
pub struct FileSnapshotStorage {
    data_dir: PathBuf,
}

impl FileSnapshotStorage {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }
}

impl SnapshotStorage for FileSnapshotStorage {
    fn save(&mut self, snapshot: &Snapshot) -> Result<()> {
        let encoded = bincode::serialize(snapshot)?;
        write_atomic(&self.data_dir, SNAPSHOT_FILE, &encoded)?;

        tracing::debug!(
            "Persisted snapshot through index {} ({} bytes)",
            snapshot.last_index,
            encoded.len()
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        let buffer = match read_if_exists(&self.data_dir.join(SNAPSHOT_FILE))? {
            Some(buffer) => buffer,
            None => return Ok(None),
        };
        let snapshot: Snapshot = bincode::deserialize(&buffer)?;

        tracing::info!(
            "Loaded snapshot: last_index={}, last_term={}",
            snapshot.last_index,
            snapshot.last_term
        );
        Ok(Some(snapshot))
    }
}
