// Raft RPC messages and the length-prefixed wire codec.
//
// Frame layout, after a u32 big-endian length prefix covering the rest:
//
//   [version u8][sender_len u16][sender bytes][tag u8][bincode body]
//
// Bodies use bincode's standard configuration, which is deterministic.
// Unknown tags and unsupported versions decode to typed errors; there are no
// panicking branches on foreign input.

use crate::error::{RaftError, Result};
use crate::log::LogEntry;
use crate::raft::{LogIndex, NodeId, Term};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Current wire protocol version.
pub const WIRE_VERSION: u8 = 1;

/// Upper bound on a single frame, guarding against malformed prefixes.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

const TAG_REQUEST_VOTE: u8 = 0x01;
const TAG_REQUEST_VOTE_REPLY: u8 = 0x02;
const TAG_APPEND_ENTRIES: u8 = 0x03;
const TAG_APPEND_ENTRIES_REPLY: u8 = 0x04;

/// Vote request, sent by a candidate to every peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RequestVoteArgs {
    /// Candidate's term.
    pub term: Term,

    /// Candidate requesting the vote.
    pub candidate_id: NodeId,

    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,

    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// Vote reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RequestVoteReply {
    /// Receiver's current term, for the candidate to update itself.
    pub term: Term,

    /// True if the candidate received the vote.
    pub vote_granted: bool,
}

/// Log replication request; doubles as the heartbeat when `entries` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct AppendEntriesArgs {
    /// Leader's term.
    pub term: Term,

    /// Leader's ID, so followers can redirect clients.
    pub leader_id: NodeId,

    /// Index of the entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,

    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,

    /// Entries to store (empty for heartbeat).
    pub entries: Vec<LogEntry>,

    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

/// Reply to an AppendEntries request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct AppendEntriesReply {
    /// Receiver's current term, for the leader to update itself.
    pub term: Term,

    /// True if the follower's log matched `prev_log_index`/`prev_log_term`.
    pub success: bool,

    /// On success: highest index confirmed replicated by this request
    /// (`prev_log_index + entries.len()`). Zero on failure. Replies can be
    /// reordered in flight, so the leader needs the match reported rather
    /// than inferred from what it last sent.
    pub match_index: LogIndex,

    /// Conflict hint: where the leader should resume. Zero when unused.
    pub conflict_index: LogIndex,

    /// Conflict hint: term of the conflicting entry. Zero when the follower
    /// had no entry at `prev_log_index`.
    pub conflict_term: Term,
}

/// Every message kind a node can send or receive, as a closed sum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RequestVote(RequestVoteArgs),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntriesArgs),
    AppendEntriesReply(AppendEntriesReply),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestVote(_) => "request_vote",
            Message::RequestVoteReply(_) => "request_vote_reply",
            Message::AppendEntries(_) => "append_entries",
            Message::AppendEntriesReply(_) => "append_entries_reply",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Message::RequestVote(_) => TAG_REQUEST_VOTE,
            Message::RequestVoteReply(_) => TAG_REQUEST_VOTE_REPLY,
            Message::AppendEntries(_) => TAG_APPEND_ENTRIES,
            Message::AppendEntriesReply(_) => TAG_APPEND_ENTRIES_REPLY,
        }
    }
}

/// Encode a full frame, including the length prefix.
pub fn encode_frame(from: &NodeId, message: &Message) -> Result<Vec<u8>> {
    let config = bincode::config::standard();
    let body = match message {
        Message::RequestVote(args) => bincode::encode_to_vec(args, config)?,
        Message::RequestVoteReply(reply) => bincode::encode_to_vec(reply, config)?,
        Message::AppendEntries(args) => bincode::encode_to_vec(args, config)?,
        Message::AppendEntriesReply(reply) => bincode::encode_to_vec(reply, config)?,
    };

    let sender = from.as_bytes();
    let payload_len = 1 + 2 + sender.len() + 1 + body.len();
    let mut buf = BytesMut::with_capacity(4 + payload_len);
    buf.put_u32(payload_len as u32);
    buf.put_u8(WIRE_VERSION);
    buf.put_u16(sender.len() as u16);
    buf.put_slice(sender);
    buf.put_u8(message.tag());
    buf.put_slice(&body);
    Ok(buf.to_vec())
}

/// Decode a frame payload (everything after the length prefix) into the
/// sender ID and message.
pub fn decode_frame(frame: &[u8]) -> Result<(NodeId, Message)> {
    let mut buf = frame;
    if buf.remaining() < 4 {
        return Err(RaftError::Serialization("truncated frame header".to_string()));
    }
    let version = buf.get_u8();
    if version != WIRE_VERSION {
        return Err(RaftError::UnsupportedWireVersion(version));
    }
    let sender_len = buf.get_u16() as usize;
    if buf.remaining() < sender_len + 1 {
        return Err(RaftError::Serialization("truncated frame sender".to_string()));
    }
    let sender = String::from_utf8(buf[..sender_len].to_vec())
        .map_err(|e| RaftError::Serialization(format!("invalid sender id: {e}")))?;
    buf.advance(sender_len);
    let tag = buf.get_u8();

    let config = bincode::config::standard();
    let message = match tag {
        TAG_REQUEST_VOTE => {
            let (args, _) = bincode::decode_from_slice::<RequestVoteArgs, _>(buf, config)?;
            Message::RequestVote(args)
        }
        TAG_REQUEST_VOTE_REPLY => {
            let (reply, _) = bincode::decode_from_slice::<RequestVoteReply, _>(buf, config)?;
            Message::RequestVoteReply(reply)
        }
        TAG_APPEND_ENTRIES => {
            let (args, _) = bincode::decode_from_slice::<AppendEntriesArgs, _>(buf, config)?;
            Message::AppendEntries(args)
        }
        TAG_APPEND_ENTRIES_REPLY => {
            let (reply, _) = bincode::decode_from_slice::<AppendEntriesReply, _>(buf, config)?;
            Message::AppendEntriesReply(reply)
        }
        other => return Err(RaftError::UnknownMessageType(other)),
    };

    Ok((sender, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::EntryPayload;

    fn roundtrip(message: Message) {
        let frame = encode_frame(&"node1".to_string(), &message).unwrap();
        let payload_len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(payload_len, frame.len() - 4);

        let (from, decoded) = decode_frame(&frame[4..]).unwrap();
        assert_eq!(from, "node1");
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_roundtrip_request_vote() {
        roundtrip(Message::RequestVote(RequestVoteArgs {
            term: 7,
            candidate_id: "node2".to_string(),
            last_log_index: 42,
            last_log_term: 6,
        }));
        roundtrip(Message::RequestVoteReply(RequestVoteReply { term: 7, vote_granted: true }));
    }

    #[test]
    fn test_roundtrip_append_entries() {
        roundtrip(Message::AppendEntries(AppendEntriesArgs {
            term: 3,
            leader_id: "node1".to_string(),
            prev_log_index: 5,
            prev_log_term: 2,
            entries: vec![LogEntry::new(3, 6, EntryPayload::Command(b"set x".to_vec()))],
            leader_commit: 4,
        }));
        roundtrip(Message::AppendEntriesReply(AppendEntriesReply {
            term: 3,
            success: false,
            match_index: 0,
            conflict_index: 4,
            conflict_term: 2,
        }));
    }

    #[test]
    fn test_unknown_tag_is_typed_error() {
        let mut frame = encode_frame(
            &"node1".to_string(),
            &Message::RequestVoteReply(RequestVoteReply { term: 1, vote_granted: false }),
        )
        .unwrap();
        // Tag byte sits after the prefix, version, and sender.
        let tag_at = 4 + 1 + 2 + "node1".len();
        frame[tag_at] = 0x7f;
        match decode_frame(&frame[4..]) {
            Err(RaftError::UnknownMessageType(0x7f)) => {}
            other => panic!("expected unknown message type error, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut frame = encode_frame(
            &"node1".to_string(),
            &Message::RequestVoteReply(RequestVoteReply { term: 1, vote_granted: false }),
        )
        .unwrap();
        frame[4] = 99;
        assert!(matches!(decode_frame(&frame[4..]), Err(RaftError::UnsupportedWireVersion(99))));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = encode_frame(
            &"node1".to_string(),
            &Message::RequestVoteReply(RequestVoteReply { term: 1, vote_granted: false }),
        )
        .unwrap();
        assert!(decode_frame(&frame[4..frame.len() - 2]).is_err());
    }
}
