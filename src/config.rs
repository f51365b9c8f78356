// Raft node configuration.

use crate::error::{RaftError, Result};
use crate::raft::NodeId;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a single Raft node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's ID. Must be unique within the cluster.
    pub node_id: NodeId,

    /// IDs of the other cluster members. May include this node's own ID,
    /// which is filtered out.
    pub peers: Vec<NodeId>,

    /// Minimum election timeout (randomized per election cycle).
    pub election_timeout_min: Duration,

    /// Maximum election timeout.
    pub election_timeout_max: Duration,

    /// Heartbeat interval. Must be shorter than half the minimum election
    /// timeout or followers will keep starting elections under a healthy
    /// leader.
    pub heartbeat_interval: Duration,

    /// Directory for durable state (term, vote, log entries, snapshot).
    pub storage_dir: PathBuf,

    /// Maximum entries shipped in a single AppendEntries RPC.
    pub max_entries_per_append: usize,

    /// Capacity of observer subscription channels.
    pub apply_channel_capacity: usize,

    /// Seed for the election-timeout RNG. Deterministic elections in tests;
    /// leave `None` in production.
    pub rng_seed: Option<u64>,
}

impl RaftConfig {
    pub fn new(node_id: impl Into<NodeId>, peers: Vec<NodeId>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.into(),
            peers,
            storage_dir: storage_dir.into(),
            ..Default::default()
        }
    }

    /// Validate the configuration before starting a node.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(RaftError::Config("node_id cannot be empty".to_string()));
        }
        if self.storage_dir.as_os_str().is_empty() {
            return Err(RaftError::Config("storage_dir cannot be empty".to_string()));
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::Config(
                "election_timeout_min must be less than election_timeout_max".to_string(),
            ));
        }
        if self.heartbeat_interval * 2 >= self.election_timeout_min {
            return Err(RaftError::Config(
                "heartbeat_interval must be less than half the minimum election timeout".to_string(),
            ));
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftError::Config("max_entries_per_append must be non-zero".to_string()));
        }
        if self.apply_channel_capacity == 0 {
            return Err(RaftError::Config("apply_channel_capacity must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Full cluster membership: the configured peers plus this node.
    pub fn members(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|id| **id != self.node_id)
            .cloned()
            .collect();
        members.push(self.node_id.clone());
        members.sort();
        members.dedup();
        members
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            peers: Vec::new(),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            storage_dir: PathBuf::new(),
            max_entries_per_append: 64,
            apply_channel_capacity: 256,
            rng_seed: None,
        }
    }
}
