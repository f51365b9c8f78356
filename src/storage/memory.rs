// In-memory storage backend.
//
// Cloning yields another handle to the same underlying state, so tests can
// "restart" a node against the store it wrote before shutdown.

use crate::error::{RaftError, Result};
use crate::log::LogEntry;
use crate::raft::{LogIndex, NodeId, Term};
use crate::storage::Storage;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct MemoryInner {
    current_term: Term,
    voted_for: Option<NodeId>,
    logs: BTreeMap<LogIndex, LogEntry>,
    snapshot: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn current_term(&self) -> Result<Term> {
        Ok(self.inner.read().current_term)
    }

    fn set_current_term(&self, term: Term) -> Result<()> {
        self.inner.write().current_term = term;
        Ok(())
    }

    fn voted_for(&self) -> Result<Option<NodeId>> {
        Ok(self.inner.read().voted_for.clone())
    }

    fn set_voted_for(&self, id: Option<&NodeId>) -> Result<()> {
        self.inner.write().voted_for = id.cloned();
        Ok(())
    }

    fn first_index(&self) -> Result<LogIndex> {
        Ok(self.inner.read().logs.keys().next().copied().unwrap_or(0))
    }

    fn last_index(&self) -> Result<LogIndex> {
        Ok(self.inner.read().logs.keys().next_back().copied().unwrap_or(0))
    }

    fn log_entry(&self, index: LogIndex) -> Result<LogEntry> {
        self.inner
            .read()
            .logs
            .get(&index)
            .cloned()
            .ok_or(RaftError::LogNotFound(index))
    }

    fn store_logs(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write();
        let mut expected = match inner.logs.keys().next_back() {
            Some(last) => last + 1,
            None => entries[0].index,
        };
        for entry in entries {
            if entry.index != expected {
                return Err(RaftError::InvalidState(format!(
                    "non-contiguous log append: expected {}, got {}",
                    expected, entry.index
                )));
            }
            expected += 1;
        }
        for entry in entries {
            inner.logs.insert(entry.index, entry.clone());
        }
        Ok(())
    }

    fn delete_range(&self, min: LogIndex, max: LogIndex) -> Result<()> {
        if min > max {
            return Err(RaftError::InvalidLogRange(min, max));
        }
        let mut inner = self.inner.write();
        let doomed: Vec<LogIndex> = inner.logs.range(min..=max).map(|(i, _)| *i).collect();
        for index in doomed {
            inner.logs.remove(&index);
        }
        Ok(())
    }

    fn store_snapshot(&self, data: &[u8]) -> Result<()> {
        self.inner.write().snapshot = Some(data.to_vec());
        Ok(())
    }

    fn snapshot(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().snapshot.clone())
    }
}
