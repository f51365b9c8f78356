// Application state machine contract and the canonical in-memory KV store.

use crate::error::{RaftError, Result};
use crate::raft::LogIndex;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Finite state machine fed by the apply loop.
///
/// `apply` is invoked exactly once per committed application entry, in strict
/// index order, by a single task. It must be a deterministic function of the
/// command and previously applied commands; an error from it is a
/// programming bug and terminates the node.
pub trait Fsm: Send + 'static {
    /// Apply a committed command. May return an opaque response payload.
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Serialize a consistent point-in-time snapshot of the state.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the state from a snapshot. Called before the first apply on
    /// startup; a `Corrupt` error aborts the node.
    fn restore(&mut self, data: &[u8]) -> Result<()>;
}

/// Commands understood by the KV state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (command, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(command)
    }
}

/// In-memory key-value state machine.
///
/// Cloning yields another handle to the same map, so readers can keep a
/// handle while the apply loop owns the FSM. Reads are served from local
/// state and are not linearized through the log.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    data: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Fsm for MemoryKv {
    fn apply(&mut self, _index: LogIndex, command: &[u8]) -> Result<Option<Vec<u8>>> {
        match KvCommand::decode(command)? {
            KvCommand::Set { key, value } => {
                self.data.write().insert(key, value);
                Ok(None)
            }
            KvCommand::Delete { key } => {
                let previous = self.data.write().remove(&key);
                Ok(previous.map(String::into_bytes))
            }
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        let data = self.data.read();
        Ok(serde_json::to_vec(&*data)?)
    }

    fn restore(&mut self, data: &[u8]) -> Result<()> {
        let restored: HashMap<String, String> = serde_json::from_slice(data)
            .map_err(|e| RaftError::Corrupt(format!("kv snapshot: {e}")))?;
        *self.data.write() = restored;
        Ok(())
    }
}
