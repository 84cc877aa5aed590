//! Raft RPC payload types.
//!
//! These are the three RPC pairs every transport variant must carry:
//! RequestVote, AppendEntries, and InstallSnapshot. The structs are plain
//! serde-derived values; the wire encoding is owned by the configured
//! [`RpcSerializer`](crate::serializer::RpcSerializer).

use serde::{Deserialize, Serialize};

/// Identifier of a Raft participant.
pub type NodeId = u64;

/// Log position.
pub type LogIndex = u64;

/// Election term.
pub type Term = u64;

/// Derive a stable u64 node ID from a human-readable string identifier.
pub fn node_id_from_str(s: &str) -> NodeId {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

/// A single replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    /// Opaque state-machine command.
    #[serde(with = "serde_bytes_b64")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Highest log index known replicated on the follower.
    pub match_index: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    /// Byte offset of this chunk within the snapshot.
    pub offset: u64,
    #[serde(with = "serde_bytes_b64")]
    pub data: Vec<u8>,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
}

/// The sealed set of RPC kinds carried by the transports.
///
/// Handler registration and retry policies key off this enum rather than
/// open-ended strings so a typo cannot silently register a dead handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcKind {
    RequestVote,
    AppendEntries,
    InstallSnapshot,
}

impl RpcKind {
    /// CoAP resource path for this RPC (bit-exact for interop).
    pub fn resource_path(&self) -> &'static str {
        match self {
            RpcKind::RequestVote => "/raft/request_vote",
            RpcKind::AppendEntries => "/raft/append_entries",
            RpcKind::InstallSnapshot => "/raft/install_snapshot",
        }
    }

    /// Stable metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            RpcKind::RequestVote => "request_vote",
            RpcKind::AppendEntries => "append_entries",
            RpcKind::InstallSnapshot => "install_snapshot",
        }
    }

    /// Resolve a resource path back to the RPC kind.
    pub fn from_resource_path(path: &str) -> Option<Self> {
        match path {
            "/raft/request_vote" | "raft/request_vote" => Some(RpcKind::RequestVote),
            "/raft/append_entries" | "raft/append_entries" => Some(RpcKind::AppendEntries),
            "/raft/install_snapshot" | "raft/install_snapshot" => Some(RpcKind::InstallSnapshot),
            _ => None,
        }
    }

    pub fn all() -> [RpcKind; 3] {
        [
            RpcKind::RequestVote,
            RpcKind::AppendEntries,
            RpcKind::InstallSnapshot,
        ]
    }
}

/// Binary payloads as base64 strings inside JSON.
///
/// `Vec<u8>` would otherwise serialize as a JSON array of numbers, which
/// triples the wire size of snapshot chunks.
mod serde_bytes_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
