//! The replicated log as the consensus core sees it.
//!
//! [`LogStore`] wraps a [`LogStorage`] backend and enforces the invariants
//! the protocol relies on: entries are contiguous, committed entries are
//! never truncated, and the commit index only moves forward.

use super::types::{LogEntry, LogIndex, Term};
use crate::storage::{LastIncluded, LogStorage};
use crate::util::errors::{RaftError, Result};

pub struct LogStore {
    storage: Box<dyn LogStorage>,
    commit_index: LogIndex,
}

impl LogStore {
    pub fn new(storage: Box<dyn LogStorage>) -> Self {
        // Everything folded into a snapshot was committed
        let commit_index = storage.last_included().index;
        Self {
            storage,
            commit_index,
        }
    }

    /// Append entries that continue the log without a gap
    pub fn append(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        if let Some(first) = entries.first() {
            let expected = self.last_index() + 1;
            if first.index != expected {
                return Err(RaftError::LogGap {
                    expected,
                    got: first.index,
                });
            }
        }
        self.storage.append(entries)
    }

    /// Delete every entry at or above `index`. Committed entries are immutable.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.commit_index {
            return Err(RaftError::TruncateCommitted {
                index,
                commit_index: self.commit_index,
            });
        }
        self.storage.truncate(index)
    }

    /// Up to `max` entries starting at `index`
    pub fn entries_from(&self, index: LogIndex, max: usize) -> Result<Vec<LogEntry>> {
        if index <= self.last_included().index {
            return Err(RaftError::Compacted(index));
        }
        let last = self.last_index();
        if index > last || max == 0 {
            return Ok(Vec::new());
        }
        let end = last.min(index + max as u64 - 1);
        Ok(self.storage.get_range(index, end))
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        self.storage.get(index)
    }

    /// Term of the entry at `index`. Index 0 and the compaction marker are
    /// always known.
    pub fn term(&self, index: LogIndex) -> Result<Term> {
        let marker = self.last_included();
        if index == 0 {
            return Ok(0);
        }
        if index == marker.index {
            return Ok(marker.term);
        }
        if index < marker.index {
            return Err(RaftError::Compacted(index));
        }
        self.storage
            .get(index)
            .map(|e| e.term)
            .ok_or(RaftError::NotFound(index))
    }

    /// True if the log holds (or has compacted) an entry at `index` from `term`
    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        matches!(self.term(index), Ok(t) if t == term)
    }

    pub fn last_index(&self) -> LogIndex {
        self.storage.last_index()
    }

    pub fn last_term(&self) -> Term {
        self.storage.last_term()
    }

    /// First index still held as an entry (one past the compaction marker)
    pub fn first_index(&self) -> LogIndex {
        self.last_included().index + 1
    }

    pub fn last_included(&self) -> LastIncluded {
        self.storage.last_included()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Advance the commit index. Returns true if it moved.
    pub fn commit(&mut self, index: LogIndex) -> bool {
        if index <= self.commit_index {
            return false;
        }
        assert!(
            index <= self.last_index(),
            "commit index {} beyond last log index {}",
            index,
            self.last_index()
        );
        self.commit_index = index;
        true
    }

    /// Index of an AddPeer or RemovePeer entry that has not committed yet
    pub fn pending_membership_change(&self) -> Option<LogIndex> {
        let start = self.commit_index + 1;
        if start > self.last_index() {
            return None;
        }
        self.storage
            .get_range(start, self.last_index())
            .into_iter()
            .find(|e| e.command.is_membership_change())
            .map(|e| e.index)
    }

    /// Discard entries through `index` once a snapshot covers them
    pub fn compact_through(&mut self, index: LogIndex, term: Term) -> Result<()> {
        assert!(
            index <= self.commit_index,
            "compacting uncommitted entries ({} > {})",
            index,
            self.commit_index
        );
        self.storage.compact(LastIncluded::new(index, term))
    }

    /// Throw the log away and restart it after an installed snapshot
    pub fn reset_to(&mut self, index: LogIndex, term: Term) -> Result<()> {
        self.storage.reset(LastIncluded::new(index, term))?;
        self.commit_index = self.commit_index.max(index);
        Ok(())
    }

    /// Adopt a snapshot at boot: everything it covers counts as committed
    pub fn recover_snapshot(&mut self, index: LogIndex, term: Term) -> Result<()> {
        if index <= self.last_included().index {
            return Ok(());
        }
        self.commit_index = self.commit_index.max(index);
        if self.matches(index, term) {
            self.storage.compact(LastIncluded::new(index, term))
        } else {
            self.storage.reset(LastIncluded::new(index, term))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::{Command, PeerInfo};
    use crate::storage::MemLogStorage;

    fn store_with(terms: &[Term]) -> LogStore {
        let mut log = LogStore::new(Box::new(MemLogStorage::new()));
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, t)| LogEntry::data(*t, i as u64 + 1, vec![]))
            .collect();
        log.append(entries).unwrap();
        log
    }

    #[test]
    fn test_term_lookup() {
        let log = store_with(&[1, 1, 2]);
        assert_eq!(log.term(0).unwrap(), 0);
        assert_eq!(log.term(3).unwrap(), 2);
        assert!(matches!(log.term(4), Err(RaftError::NotFound(4))));
        assert_eq!(log.last_term(), 2);
    }

    #[test]
    fn test_truncate_rejected_for_committed() {
        let mut log = store_with(&[1, 1, 1]);
        assert!(log.commit(2));

        let err = log.truncate_from(2).unwrap_err();
        assert!(matches!(
            err,
            RaftError::TruncateCommitted {
                index: 2,
                commit_index: 2
            }
        ));
        log.truncate_from(3).unwrap();
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn test_commit_is_monotonic() {
        let mut log = store_with(&[1, 1, 1]);
        assert!(log.commit(3));
        assert!(!log.commit(1));
        assert_eq!(log.commit_index(), 3);
    }

    #[test]
    fn test_compaction_keeps_boundary_term() {
        let mut log = store_with(&[1, 2, 2, 3]);
        log.commit(3);
        log.compact_through(3, 2).unwrap();

        assert_eq!(log.first_index(), 4);
        assert_eq!(log.term(3).unwrap(), 2);
        assert!(matches!(log.term(2), Err(RaftError::Compacted(2))));
        assert!(matches!(log.entries_from(3, 10), Err(RaftError::Compacted(3))));
        assert_eq!(log.entries_from(4, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_entries_from_respects_max() {
        let log = store_with(&[1, 1, 1, 1, 1]);
        let batch = log.entries_from(2, 2).unwrap();
        assert_eq!(batch.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3]);
        assert!(log.entries_from(6, 2).unwrap().is_empty());
    }

    #[test]
    fn test_recover_snapshot_discards_covered_entries() {
        let mut log = store_with(&[1, 1, 1]);
        log.recover_snapshot(5, 2).unwrap();

        assert_eq!(log.commit_index(), 5);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.last_term(), 2);
    }

    #[test]
    fn test_pending_membership_change_until_committed() {
        let mut log = store_with(&[1, 1]);
        assert_eq!(log.pending_membership_change(), None);

        log.append(vec![
            LogEntry::new(1, 3, Command::AddPeer(PeerInfo::new("node-4", "mem://node-4"))),
            LogEntry::data(1, 4, vec![]),
        ])
        .unwrap();
        assert_eq!(log.pending_membership_change(), Some(3));

        log.commit(2);
        assert_eq!(log.pending_membership_change(), Some(3));
        log.commit(3);
        assert_eq!(log.pending_membership_change(), None);
    }
}
