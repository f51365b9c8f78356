// RustyRaft - Raft consensus engine with a replicated key-value store
// Core library module

pub mod config;
pub mod error;
pub mod fsm;
pub mod kv;
pub mod log;
pub mod message;
pub mod observer;
pub mod raft;
pub mod storage;
pub mod transport;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use fsm::{Fsm, KvCommand, MemoryKv};
pub use kv::KvStore;
pub use log::{EntryPayload, LogEntry};
pub use observer::{RaftEvent, RaftMetrics};
pub use raft::{LogIndex, NodeId, RaftNode, RaftRole, Term};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use transport::{MemoryNetwork, TcpTransport, Transport};
