use super::{read_if_exists, write_atomic};
use crate::raft::types::{LogEntry, LogIndex, Term};
use crate::util::errors::{RaftError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

const LOG_FILE: &str = "raft_log.bin";

/// Marks the last entry folded into a snapshot. Everything at or below
/// `index` has been compacted away; `(0, 0)` means nothing was compacted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastIncluded {
    pub index: LogIndex,
    pub term: Term,
}

impl LastIncluded {
    pub fn new(index: LogIndex, term: Term) -> Self {
        Self { index, term }
    }
}

/// Trait for persistent log storage
pub trait LogStorage: Send {
    fn append(&mut self, entries: Vec<LogEntry>) -> Result<()>;
    fn get(&self, index: LogIndex) -> Option<&LogEntry>;
    /// Entries in `start..=end` that are still retained
    fn get_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry>;
    fn last_included(&self) -> LastIncluded;
    fn last_index(&self) -> LogIndex;
    fn last_term(&self) -> Term;
    /// Remove every entry at or above `from_index`
    fn truncate(&mut self, from_index: LogIndex) -> Result<()>;
    /// Drop every entry at or below `through.index` and remember the marker
    fn compact(&mut self, through: LastIncluded) -> Result<()>;
    /// Drop the whole log and restart it after `through`
    fn reset(&mut self, through: LastIncluded) -> Result<()>;
}

/// In-memory log, also the working set of [`FileLogStorage`]
#[derive(Debug, Default, Clone)]
pub struct MemLogStorage {
    last_included: LastIncluded,
    logs: VecDeque<LogEntry>,
}

impl MemLogStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        if index <= self.last_included.index {
            return None;
        }
        let pos = (index - self.last_included.index - 1) as usize;
        (pos < self.logs.len()).then_some(pos)
    }

    fn check_contiguous(&self, entries: &[LogEntry]) -> Result<()> {
        let mut expected = self.last_index() + 1;
        for entry in entries {
            if entry.index != expected {
                return Err(RaftError::LogGap {
                    expected,
                    got: entry.index,
                });
            }
            expected += 1;
        }
        Ok(())
    }

    fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.logs.iter()
    }
}

impl LogStorage for MemLogStorage {
    fn append(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        self.check_contiguous(&entries)?;
        self.logs.extend(entries);
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        self.position(index).map(|pos| &self.logs[pos])
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        let start = start.max(self.last_included.index + 1);
        let end = end.min(self.last_index());
        if start > end {
            return Vec::new();
        }
        match (self.position(start), self.position(end)) {
            (Some(from), Some(to)) => self.logs.range(from..=to).cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn last_included(&self) -> LastIncluded {
        self.last_included
    }

    fn last_index(&self) -> LogIndex {
        self.logs
            .back()
            .map(|e| e.index)
            .unwrap_or(self.last_included.index)
    }

    fn last_term(&self) -> Term {
        self.logs
            .back()
            .map(|e| e.term)
            .unwrap_or(self.last_included.term)
    }

    fn truncate(&mut self, from_index: LogIndex) -> Result<()> {
        if from_index <= self.last_included.index {
            return Err(RaftError::Compacted(from_index));
        }
        if let Some(pos) = self.position(from_index) {
            self.logs.truncate(pos);
        }
        Ok(())
    }

    fn compact(&mut self, through: LastIncluded) -> Result<()> {
        if through.index <= self.last_included.index {
            return Ok(());
        }
        while self
            .logs
            .front()
            .is_some_and(|entry| entry.index <= through.index)
        {
            self.logs.pop_front();
        }
        self.last_included = through;
        Ok(())
    }

    fn reset(&mut self, through: LastIncluded) -> Result<()> {
        self.logs.clear();
        self.last_included = through;
        Ok(())
    }
}

/// One record in the on-disk log
#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    Marker(LastIncluded),
    Entry(LogEntry),
}

const RECORD_HEADER_SIZE: usize = 4;

/// File-based log storage: an append-only file of length-prefixed bincode
/// records. Truncation and compaction rewrite the file atomically.
pub struct FileLogStorage {
    data_dir: PathBuf,
    inner: MemLogStorage,
}

impl FileLogStorage {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        fs::create_dir_all(&data_dir)?;

        let mut storage = Self {
            data_dir,
            inner: MemLogStorage::new(),
        };

        // Load existing logs from disk
        storage.load_from_disk()?;

        Ok(storage)
    }

    fn log_file_path(&self) -> PathBuf {
        self.data_dir.join(LOG_FILE)
    }

    fn encode_record(record: &LogRecord, out: &mut Vec<u8>) -> Result<()> {
        let payload = bincode::serialize(record)?;
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(())
    }

    fn load_from_disk(&mut self) -> Result<()> {
        let log_path = self.log_file_path();
        let buffer = match read_if_exists(&log_path)? {
            Some(buffer) => buffer,
            None => return Ok(()),
        };

        let mut pos = 0;
        let mut torn = false;
        while pos < buffer.len() {
            if buffer.len() - pos < RECORD_HEADER_SIZE {
                torn = true;
                break;
            }
            let mut len_bytes = [0u8; RECORD_HEADER_SIZE];
            len_bytes.copy_from_slice(&buffer[pos..pos + RECORD_HEADER_SIZE]);
            let len = u32::from_be_bytes(len_bytes) as usize;
            let start = pos + RECORD_HEADER_SIZE;
            if buffer.len() - start < len {
                torn = true;
                break;
            }

            match bincode::deserialize::<LogRecord>(&buffer[start..start + len]) {
                Ok(LogRecord::Marker(marker)) => self.inner.reset(marker)?,
                Ok(LogRecord::Entry(entry)) => self.inner.append(vec![entry])?,
                Err(_) => {
                    torn = true;
                    break;
                }
            }
            pos = start + len;
        }

        if torn {
            tracing::warn!(
                "Dropping torn record at byte {} of {}",
                pos,
                log_path.display()
            );
            self.rewrite()?;
        }

        tracing::info!(
            "Loaded log from disk: last_included={}, last_index={}",
            self.inner.last_included.index,
            self.inner.last_index()
        );
        Ok(())
    }

    fn append_records(&self, entries: &[LogEntry]) -> Result<()> {
        let mut encoded = Vec::new();
        for entry in entries {
            Self::encode_record(&LogRecord::Entry(entry.clone()), &mut encoded)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_file_path())?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        Ok(())
    }

    /// Write the full working set to a temp file and swap it in
    fn rewrite(&self) -> Result<()> {
        let mut encoded = Vec::new();
        Self::encode_record(&LogRecord::Marker(self.inner.last_included), &mut encoded)?;
        for entry in self.inner.entries() {
            Self::encode_record(&LogRecord::Entry(entry.clone()), &mut encoded)?;
        }

        write_atomic(&self.data_dir, LOG_FILE, &encoded)
    }
}

impl LogStorage for FileLogStorage {
    fn append(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.inner.check_contiguous(&entries)?;
        self.append_records(&entries)?;
        self.inner.append(entries)
    }

    fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        self.inner.get(index)
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        self.inner.get_range(start, end)
    }

    fn last_included(&self) -> LastIncluded {
        self.inner.last_included()
    }

    fn last_index(&self) -> LogIndex {
        self.inner.last_index()
    }

    fn last_term(&self) -> Term {
        self.inner.last_term()
    }

    fn truncate(&mut self, from_index: LogIndex) -> Result<()> {
        if from_index > self.inner.last_index() {
            return Ok(());
        }
        self.inner.truncate(from_index)?;
        self.rewrite()?;
        tracing::info!("Truncated log from index {}", from_index);
        Ok(())
    }

    fn compact(&mut self, through: LastIncluded) -> Result<()> {
        if through.index <= self.inner.last_included.index {
            return Ok(());
        }
        self.inner.compact(through)?;
        self.rewrite()
    }

    fn reset(&mut self, through: LastIncluded) -> Result<()> {
        self.inner.reset(through)?;
        self.rewrite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(term: Term, range: std::ops::RangeInclusive<LogIndex>) -> Vec<LogEntry> {
        range
            .map(|i| LogEntry::data(term, i, vec![i as u8]))
            .collect()
    }

    #[test]
    fn test_append_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let mut storage = FileLogStorage::new(temp_dir.path().to_path_buf()).unwrap();

        let batch = entries(1, 1..=2);
        storage.append(batch.clone()).unwrap();

        assert_eq!(storage.last_index(), 2);
        assert_eq!(storage.get(1).unwrap(), &batch[0]);
        assert_eq!(storage.get(2).unwrap(), &batch[1]);
        assert!(storage.get(3).is_none());
    }

    #[test]
    fn test_append_rejects_gap() {
        let mut storage = MemLogStorage::new();
        storage.append(entries(1, 1..=2)).unwrap();

        let err = storage.append(entries(1, 4..=4)).unwrap_err();
        assert!(matches!(err, RaftError::LogGap { expected: 3, got: 4 }));
        assert_eq!(storage.last_index(), 2);
    }

    #[test]
    fn test_compact_keeps_marker() {
        let mut storage = MemLogStorage::new();
        storage.append(entries(1, 1..=5)).unwrap();
        storage.compact(LastIncluded::new(3, 1)).unwrap();

        assert!(storage.get(3).is_none());
        assert_eq!(storage.get(4).unwrap().index, 4);
        assert_eq!(storage.last_included(), LastIncluded::new(3, 1));
        assert_eq!(storage.get_range(1, 10).len(), 2);
        assert!(matches!(
            storage.truncate(2).unwrap_err(),
            RaftError::Compacted(2)
        ));
    }

    #[test]
    fn test_compact_past_end_empties_log() {
        let mut storage = MemLogStorage::new();
        storage.append(entries(1, 1..=2)).unwrap();
        storage.compact(LastIncluded::new(7, 3)).unwrap();

        assert_eq!(storage.last_index(), 7);
        assert_eq!(storage.last_term(), 3);
        storage.append(entries(3, 8..=8)).unwrap();
        assert_eq!(storage.last_index(), 8);
    }

    #[test]
    fn test_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().to_path_buf();

        {
            let mut storage = FileLogStorage::new(path.clone()).unwrap();
            storage.append(entries(1, 1..=4)).unwrap();
            storage.truncate(4).unwrap();
            storage.compact(LastIncluded::new(2, 1)).unwrap();
            storage.append(entries(2, 4..=5)).unwrap();
        }

        // Reload from disk
        let storage = FileLogStorage::new(path).unwrap();
        assert_eq!(storage.last_included(), LastIncluded::new(2, 1));
        assert_eq!(storage.last_index(), 5);
        assert_eq!(storage.get(3).unwrap().term, 1);
        assert_eq!(storage.get(4).unwrap().term, 2);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().to_path_buf();

        {
            let mut storage = FileLogStorage::new(path.clone()).unwrap();
            storage.append(entries(1, 1..=3)).unwrap();
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(path.join("raft_log.bin"))
            .unwrap();
        file.write_all(&[0, 0, 0, 42, 1, 2]).unwrap();
        drop(file);

        let storage = FileLogStorage::new(path).unwrap();
        assert_eq!(storage.last_index(), 3);
    }
}
