pub mod log_storage;
pub mod snapshot_storage;
pub mod state_storage;

pub use log_storage::{FileLogStorage, LastIncluded, LogStorage, MemLogStorage};
pub use snapshot_storage::{FileSnapshotStorage, MemSnapshotStorage, SnapshotStorage};
pub use state_storage::{FileStateStorage, MemStateStorage, PersistentState, StateStorage};

use crate::util::errors::Result;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

/// The three stores a node persists to
pub struct NodeStorage {
    pub log: Box<dyn LogStorage>,
    pub state: Box<dyn StateStorage>,
    pub snapshots: Box<dyn SnapshotStorage>,
}

impl NodeStorage {
    /// File-backed stores under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            log: Box::new(FileLogStorage::new(data_dir.join("logs"))?),
            state: Box::new(FileStateStorage::new(data_dir.join("state"))?),
            snapshots: Box::new(FileSnapshotStorage::new(data_dir.join("snapshots"))?),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            log: Box::new(MemLogStorage::new()),
            state: Box::new(MemStateStorage::new()),
            snapshots: Box::new(MemSnapshotStorage::new()),
        }
    }
}

/// Replace `dir/name` with `bytes`. Readers see the old or the new file,
/// never a partial write.
pub(crate) fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let tmp_path = dir.join(format!("{}.tmp", name));
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp_path, dir.join(name))?;
    Ok(())
}

/// Contents of `path`, or `None` if it was never written
pub(crate) fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
