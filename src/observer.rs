// Observation side channel.
//
// Every state transition of interest is published to subscribers as a
// RaftEvent. Emission never blocks the core: a subscriber that falls behind
// loses events rather than slowing consensus down.

use crate::raft::{LogIndex, NodeId, RaftRole, Term};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

/// State-change events emitted by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RaftEvent {
    RoleChanged { node: NodeId, from: RaftRole, to: RaftRole, term: Term },
    LeaderChanged { node: NodeId, leader: Option<NodeId>, term: Term },
    TermAdvanced { node: NodeId, term: Term },
    VoteGranted { node: NodeId, candidate: NodeId, term: Term },
    CommitAdvanced { node: NodeId, commit_index: LogIndex },
    EntryApplied { node: NodeId, index: LogIndex, term: Term },
    MembershipChanged { node: NodeId, members: Vec<NodeId> },
    SnapshotTaken { node: NodeId, last_included_index: LogIndex },
}

/// Fan-out registry for RaftEvent subscribers.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: std::sync::Arc<Mutex<Vec<mpsc::Sender<RaftEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber with the given channel capacity.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<RaftEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish an event to every live subscriber. Never blocks; full or
    /// closed subscribers are skipped (closed ones are pruned).
    pub fn emit(&self, event: RaftEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Point-in-time metrics snapshot, the payload a visualization bridge polls
/// and broadcasts.
#[derive(Debug, Clone, Serialize)]
pub struct RaftMetrics {
    pub node_id: NodeId,
    pub role: RaftRole,
    pub term: Term,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub commit_index: LogIndex,
    pub applied_index: LogIndex,
    pub leader: Option<NodeId>,
    pub voted_for: Option<NodeId>,
    pub peers: Vec<NodeId>,
    pub num_logs: u64,
    pub pending_logs: u64,
}
