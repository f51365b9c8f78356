// Replicated key-value store facade.
//
// Writes go through consensus and are acknowledged once appended to the
// leader's log; the apply notification arrives through the node's observer
// channel. Reads are served from local state and may trail the leader.

use crate::error::Result;
use crate::fsm::{KvCommand, MemoryKv};
use crate::raft::{LogIndex, RaftNode, Term};
use std::sync::Arc;

pub struct KvStore {
    node: Arc<RaftNode>,
    kv: MemoryKv,
}

impl KvStore {
    /// Pair a node with the read handle of the `MemoryKv` it applies into.
    pub fn new(node: Arc<RaftNode>, kv: MemoryKv) -> Self {
        Self { node, kv }
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Result<(LogIndex, Term)> {
        let command = KvCommand::Set { key: key.into(), value: value.into() };
        self.node.submit(command.encode()?).await
    }

    pub async fn delete(&self, key: impl Into<String>) -> Result<(LogIndex, Term)> {
        let command = KvCommand::Delete { key: key.into() };
        self.node.submit(command.encode()?).await
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.kv.get(key)
    }

    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }
}
