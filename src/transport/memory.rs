// In-process transport for multi-node tests and demos.
//
// A MemoryNetwork routes envelopes between registered nodes through bounded
// channels. Nodes can be isolated to model partitions; a node that rejoins
// after a restart simply registers again under the same ID.

use crate::error::{RaftError, Result};
use crate::message::Message;
use crate::raft::NodeId;
use crate::transport::{Envelope, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const INBOX_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct NetworkInner {
    inboxes: Mutex<HashMap<NodeId, mpsc::Sender<Envelope>>>,
    isolated: Mutex<HashSet<NodeId>>,
}

/// Router connecting in-process transports.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and hand back its transport. Re-joining under an
    /// existing ID replaces the previous registration.
    pub fn join(&self, id: impl Into<NodeId>) -> MemoryTransport {
        let id = id.into();
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.inner.inboxes.lock().insert(id.clone(), tx);
        self.inner.isolated.lock().remove(&id);
        MemoryTransport {
            id,
            network: self.inner.clone(),
            incoming: tokio::sync::Mutex::new(rx),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Cut a node off: traffic to and from it is dropped until `reconnect`.
    pub fn isolate(&self, id: &NodeId) {
        self.inner.isolated.lock().insert(id.clone());
    }

    pub fn reconnect(&self, id: &NodeId) {
        self.inner.isolated.lock().remove(id);
    }
}

/// One node's view of a MemoryNetwork.
#[derive(Debug)]
pub struct MemoryTransport {
    id: NodeId,
    network: Arc<NetworkInner>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    shutdown: AtomicBool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, target: &NodeId, message: Message) -> Result<()> {
        if self.is_shutdown() {
            return Err(RaftError::TransportShutdown);
        }
        {
            let isolated = self.network.isolated.lock();
            if isolated.contains(&self.id) || isolated.contains(target) {
                // Partitioned links lose traffic silently.
                return Ok(());
            }
        }
        let Some(inbox) = self.network.inboxes.lock().get(target).cloned() else {
            return Ok(());
        };
        let envelope = Envelope { from: self.id.clone(), message };
        // A full inbox drops the message, matching the lossy contract.
        let _ = inbox.try_send(envelope);
        Ok(())
    }

    async fn recv(&self) -> Option<Envelope> {
        self.incoming.lock().await.recv().await
    }

    fn local_addr(&self) -> String {
        format!("mem://{}", self.id)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Dropping our inbox sender ends the recv stream once drained.
        self.network.inboxes.lock().remove(&self.id);
        self.incoming.lock().await.close();
    }
}
