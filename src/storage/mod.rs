// Stable storage contract.
//
// Durability rule: when a setter returns Ok, a crash followed by a restart
// must observe the written value. The node declares its barriers by call
// order: term and vote are persisted before any vote leaves the node, and
// appended entries are persisted before an AppendEntries reply is sent.

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::error::Result;
use crate::log::LogEntry;
use crate::raft::{LogIndex, NodeId, Term};

/// Durable per-node state: current term, vote, log entries, snapshot blob.
pub trait Storage: Send + Sync {
    fn current_term(&self) -> Result<Term>;

    fn set_current_term(&self, term: Term) -> Result<()>;

    fn voted_for(&self) -> Result<Option<NodeId>>;

    fn set_voted_for(&self, id: Option<&NodeId>) -> Result<()>;

    /// Index of the first retained entry, 0 when the log is empty.
    fn first_index(&self) -> Result<LogIndex>;

    /// Index of the last retained entry, 0 when the log is empty.
    fn last_index(&self) -> Result<LogIndex>;

    /// Fetch one entry; `LogNotFound` outside the retained bounds.
    fn log_entry(&self, index: LogIndex) -> Result<LogEntry>;

    /// Append entries. Input must be internally contiguous and directly
    /// follow the retained tail.
    fn store_logs(&self, entries: &[LogEntry]) -> Result<()>;

    /// Delete all entries in `[min, max]`. Serves both tail truncation
    /// (conflict resolution) and head truncation (compaction).
    fn delete_range(&self, min: LogIndex, max: LogIndex) -> Result<()>;

    fn store_snapshot(&self, data: &[u8]) -> Result<()>;

    fn snapshot(&self) -> Result<Option<Vec<u8>>>;
}

/// Envelope persisted by `store_snapshot`: the FSM blob plus the log
/// position it covers.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct SnapshotBlob {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub data: Vec<u8>,
}

impl SnapshotBlob {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (blob, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(blob)
    }
}
