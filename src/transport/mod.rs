// Message transport contract.
//
// Delivery is best-effort: a transport may drop, delay, or reorder messages,
// but must never duplicate or corrupt them. Every message carries the
// sender's term, so the consensus core tolerates arbitrary reordering.

pub mod memory;
pub mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

use crate::error::Result;
use crate::message::Message;
use crate::raft::NodeId;
use async_trait::async_trait;

/// A received message together with its sender.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: NodeId,
    pub message: Message,
}

/// Directed message delivery between cluster members.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to a peer. Best-effort; callers treat failures as
    /// silent losses.
    async fn send(&self, target: &NodeId, message: Message) -> Result<()>;

    /// Receive the next incoming message. Single consumer; returns `None`
    /// once the transport has shut down and the queue drained.
    async fn recv(&self) -> Option<Envelope>;

    /// Address this transport is reachable at.
    fn local_addr(&self) -> String;

    fn is_shutdown(&self) -> bool;

    /// Stop delivering messages in both directions.
    async fn shutdown(&self);
}
