// In-memory Raft log.
//
// Mirror of the persisted log suffix. Indices are 1-based and contiguous;
// index 0 is a synthetic sentinel with term 0. After compaction the log
// remembers the (index, term) of the last entry folded into the snapshot so
// consistency checks against the boundary still work.

use crate::error::{RaftError, Result};
use crate::raft::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Payload of a single log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum EntryPayload {
    /// Opaque application command, interpreted only by the FSM.
    Command(Vec<u8>),

    /// Add a voting member to the cluster.
    AddVoter(NodeId),

    /// Remove a member from the cluster.
    RemoveServer(NodeId),
}

/// Entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct LogEntry {
    /// Term when the entry was received by the leader.
    pub term: Term,

    /// Index of this entry in the log.
    pub index: LogIndex,

    /// The command carried by this entry.
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, payload: EntryPayload) -> Self {
        Self { term, index, payload }
    }
}

/// The in-memory log structure.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: VecDeque<LogEntry>,

    /// Index of the last entry folded into a snapshot (0 if none).
    snapshot_index: LogIndex,

    /// Term of the entry at `snapshot_index`.
    snapshot_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the first retained entry (1 absent compaction).
    pub fn first_index(&self) -> LogIndex {
        self.snapshot_index + 1
    }

    /// Index of the last entry, or the compaction boundary, or 0.
    pub fn last_index(&self) -> LogIndex {
        self.entries.back().map(|e| e.index).unwrap_or(self.snapshot_index)
    }

    /// Term of the last entry, or the compaction boundary term, or 0.
    pub fn last_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Term of the entry at `index`. `Some(0)` for the sentinel, `None`
    /// outside the retained range.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index() {
            return None;
        }
        let offset = (index - self.first_index()) as usize;
        self.entries.get(offset)
    }

    /// Clone up to `max` entries starting at `from`.
    pub fn entries_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        if from < self.first_index() || from > self.last_index() {
            return Vec::new();
        }
        let offset = (from - self.first_index()) as usize;
        self.entries.iter().skip(offset).take(max).cloned().collect()
    }

    /// Append a single entry. The index must directly follow the current
    /// last index.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        if entry.index != self.last_index() + 1 {
            return Err(RaftError::InvalidState(format!(
                "log entry index mismatch: expected {}, got {}",
                self.last_index() + 1,
                entry.index
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn append_entries(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        for entry in entries {
            self.append(entry)?;
        }
        Ok(())
    }

    /// Drop every entry with index >= `index`. Used when a follower detects
    /// a term conflict.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if index < self.first_index() {
            return Err(RaftError::InvalidState(
                "cannot truncate before first retained index".to_string(),
            ));
        }
        let keep = (index - self.first_index()) as usize;
        self.entries.truncate(keep);
        Ok(())
    }

    /// Drop every entry with index <= `index` after it has been folded into
    /// a snapshot with terminal term `term`.
    pub fn compact_to(&mut self, index: LogIndex, term: Term) {
        while let Some(front) = self.entries.front() {
            if front.index > index {
                break;
            }
            self.entries.pop_front();
        }
        if index > self.snapshot_index {
            self.snapshot_index = index;
            self.snapshot_term = term;
        }
    }

    /// Reset an empty log to a restored snapshot boundary.
    pub fn reset_to_snapshot(&mut self, index: LogIndex, term: Term) {
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// First index holding `term`, scanning back from `upto`. Conflict hint
    /// for a failing AppendEntries reply.
    pub fn first_index_of_term(&self, term: Term, upto: LogIndex) -> LogIndex {
        let mut index = upto;
        while index > self.first_index() {
            match self.term_at(index - 1) {
                Some(t) if t == term => index -= 1,
                _ => break,
            }
        }
        index
    }

    /// Last index holding `term`, if any. Leader-side back-off scan.
    pub fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries.iter().rev().find(|e| e.term == term).map(|e| e.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: Term, index: LogIndex) -> LogEntry {
        LogEntry::new(term, index, EntryPayload::Command(vec![index as u8]))
    }

    #[test]
    fn test_empty_log() {
        let log = RaftLog::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
    }

    #[test]
    fn test_append_and_get() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1)).unwrap();
        log.append(entry(1, 2)).unwrap();
        log.append(entry(2, 3)).unwrap();

        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.get(3).unwrap().term, 2);
    }

    #[test]
    fn test_append_with_gap_fails() {
        let mut log = RaftLog::new();
        assert!(log.append(entry(1, 5)).is_err());
        log.append(entry(1, 1)).unwrap();
        assert!(log.append(entry(1, 3)).is_err());
    }

    #[test]
    fn test_truncate_from() {
        let mut log = RaftLog::new();
        log.append_entries(vec![entry(1, 1), entry(1, 2), entry(2, 3)]).unwrap();

        log.truncate_from(2).unwrap();
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.term_at(2), None);
    }

    #[test]
    fn test_entries_from_respects_max() {
        let mut log = RaftLog::new();
        for i in 1..=10 {
            log.append(entry(1, i)).unwrap();
        }

        let batch = log.entries_from(4, 3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].index, 4);
        assert_eq!(batch[2].index, 6);
        assert!(log.entries_from(11, 3).is_empty());
    }

    #[test]
    fn test_compaction_boundary() {
        let mut log = RaftLog::new();
        log.append_entries(vec![entry(1, 1), entry(1, 2), entry(2, 3), entry(2, 4)]).unwrap();

        log.compact_to(2, 1);
        assert_eq!(log.first_index(), 3);
        assert_eq!(log.last_index(), 4);
        // The boundary keeps answering term checks.
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.term_at(1), None);

        log.compact_to(4, 2);
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.last_term(), 2);
        assert!(log.is_empty());
    }

    #[test]
    fn test_conflict_scans() {
        let mut log = RaftLog::new();
        log.append_entries(vec![entry(1, 1), entry(2, 2), entry(2, 3), entry(3, 4)]).unwrap();

        assert_eq!(log.first_index_of_term(2, 3), 2);
        assert_eq!(log.first_index_of_term(3, 4), 4);
        assert_eq!(log.last_index_of_term(2), Some(3));
        assert_eq!(log.last_index_of_term(5), None);
    }
}
