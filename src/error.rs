use crate::raft::{LogIndex, NodeId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("not leader{}", leader_hint(.leader))]
    NotLeader { leader: Option<NodeId> },

    #[error("node is shutting down")]
    Cancelled,

    #[error("log entry {0} not found")]
    LogNotFound(LogIndex),

    #[error("invalid log range {0}..={1}")]
    InvalidLogRange(LogIndex, LogIndex),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport shut down")]
    TransportShutdown,

    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("unsupported wire version: {0}")]
    UnsupportedWireVersion(u8),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

fn leader_hint(leader: &Option<NodeId>) -> String {
    match leader {
        Some(id) => format!(", current leader is {id}"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;

impl From<bincode::error::EncodeError> for RaftError {
    fn from(e: bincode::error::EncodeError) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for RaftError {
    fn from(e: bincode::error::DecodeError) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for RaftError {
    fn from(e: serde_json::Error) -> Self {
        RaftError::Serialization(e.to_string())
    }
}
