// TCP transport.
//
// Frames the wire codec over short-lived TCP connections: each send dials
// the peer, writes one frame, and closes. The accept loop decodes frames
// into the single-consumer incoming queue. Connection failures surface as
// transport errors, which callers treat as message loss.

use crate::error::{RaftError, Result};
use crate::message::{decode_frame, encode_frame, Message, MAX_FRAME_LEN};
use crate::raft::NodeId;
use crate::transport::{Envelope, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

const INBOX_CAPACITY: usize = 1024;

pub struct TcpTransport {
    id: NodeId,
    local_addr: String,
    peers: HashMap<NodeId, String>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Bind a listener and start accepting frames. `peers` maps node IDs to
    /// `host:port` addresses.
    pub async fn bind(
        id: impl Into<NodeId>,
        listen_addr: &str,
        peers: HashMap<NodeId, String>,
    ) -> Result<Self> {
        let id = id.into();
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| RaftError::Transport(format!("bind {listen_addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RaftError::Transport(e.to_string()))?
            .to_string();

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(listener, tx, shutdown_rx));

        Ok(Self {
            id,
            local_addr,
            peers,
            incoming: tokio::sync::Mutex::new(rx),
            shutdown_tx,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<Envelope>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = read_frames(stream, tx).await {
                        tracing::debug!(error = %e, "dropping inbound connection");
                    }
                });
            }
        }
    }
}

async fn read_frames(mut stream: TcpStream, tx: mpsc::Sender<Envelope>) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            // Clean EOF between frames ends the connection.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_FRAME_LEN {
            return Err(RaftError::Transport(format!("bad frame length {len}")));
        }
        let mut frame = vec![0u8; len];
        stream.read_exact(&mut frame).await?;

        let (from, message) = decode_frame(&frame)?;
        if tx.send(Envelope { from, message }).await.is_err() {
            return Ok(());
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, target: &NodeId, message: Message) -> Result<()> {
        if self.is_shutdown() {
            return Err(RaftError::TransportShutdown);
        }
        let addr = self
            .peers
            .get(target)
            .ok_or_else(|| RaftError::Transport(format!("unknown peer {target}")))?;

        let frame = encode_frame(&self.id, &message)?;
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RaftError::Transport(format!("connect {addr}: {e}")))?;
        stream.write_all(&frame).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn recv(&self) -> Option<Envelope> {
        self.incoming.lock().await.recv().await
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        self.incoming.lock().await.close();
    }
}
