//! Serializer seam between the Raft payload types and the wire.
//!
//! The transports never touch serde directly; they go through
//! [`RpcSerializer`] so a deployment can swap JSON for a binary encoding
//! without touching the CoAP engine. The crate ships [`JsonSerializer`]
//! (CoAP content format 50, `application/json`).

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{Result, TransportError};
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};

/// CoAP Content-Format for `application/json` (RFC 7252 §12.3).
pub const CONTENT_FORMAT_JSON: u16 = 50;

/// Encode/decode contract for the three Raft RPC pairs.
pub trait RpcSerializer: Send + Sync {
    /// Content-Format option value advertised on the wire.
    fn content_format(&self) -> u16;

    fn encode_request_vote_request(&self, req: &RequestVoteRequest) -> Result<Vec<u8>>;
    fn decode_request_vote_request(&self, bytes: &[u8]) -> Result<RequestVoteRequest>;
    fn encode_request_vote_response(&self, resp: &RequestVoteResponse) -> Result<Vec<u8>>;
    fn decode_request_vote_response(&self, bytes: &[u8]) -> Result<RequestVoteResponse>;

    fn encode_append_entries_request(&self, req: &AppendEntriesRequest) -> Result<Vec<u8>>;
    fn decode_append_entries_request(&self, bytes: &[u8]) -> Result<AppendEntriesRequest>;
    fn encode_append_entries_response(&self, resp: &AppendEntriesResponse) -> Result<Vec<u8>>;
    fn decode_append_entries_response(&self, bytes: &[u8]) -> Result<AppendEntriesResponse>;

    fn encode_install_snapshot_request(&self, req: &InstallSnapshotRequest) -> Result<Vec<u8>>;
    fn decode_install_snapshot_request(&self, bytes: &[u8]) -> Result<InstallSnapshotRequest>;
    fn encode_install_snapshot_response(&self, resp: &InstallSnapshotResponse) -> Result<Vec<u8>>;
    fn decode_install_snapshot_response(&self, bytes: &[u8]) -> Result<InstallSnapshotResponse>;
}

/// Shared serializer handle as stored by clients and servers.
pub type SharedSerializer = Arc<dyn RpcSerializer>;

/// JSON serializer backed by `serde_json`.
#[derive(Debug, Default, Clone)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        JsonSerializer
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| TransportError::Serialization(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::Serialization(e.to_string()))
    }
}

impl RpcSerializer for JsonSerializer {
    fn content_format(&self) -> u16 {
        CONTENT_FORMAT_JSON
    }

    fn encode_request_vote_request(&self, req: &RequestVoteRequest) -> Result<Vec<u8>> {
        Self::encode(req)
    }

    fn decode_request_vote_request(&self, bytes: &[u8]) -> Result<RequestVoteRequest> {
        Self::decode(bytes)
    }

    fn encode_request_vote_response(&self, resp: &RequestVoteResponse) -> Result<Vec<u8>> {
        Self::encode(resp)
    }

    fn decode_request_vote_response(&self, bytes: &[u8]) -> Result<RequestVoteResponse> {
        Self::decode(bytes)
    }

    fn encode_append_entries_request(&self, req: &AppendEntriesRequest) -> Result<Vec<u8>> {
        Self::encode(req)
    }

    fn decode_append_entries_request(&self, bytes: &[u8]) -> Result<AppendEntriesRequest> {
        Self::decode(bytes)
    }

    fn encode_append_entries_response(&self, resp: &AppendEntriesResponse) -> Result<Vec<u8>> {
        Self::encode(resp)
    }

    fn decode_append_entries_response(&self, bytes: &[u8]) -> Result<AppendEntriesResponse> {
        Self::decode(bytes)
    }

    fn encode_install_snapshot_request(&self, req: &InstallSnapshotRequest) -> Result<Vec<u8>> {
        Self::encode(req)
    }

    fn decode_install_snapshot_request(&self, bytes: &[u8]) -> Result<InstallSnapshotRequest> {
        Self::decode(bytes)
    }

    fn encode_install_snapshot_response(&self, resp: &InstallSnapshotResponse) -> Result<Vec<u8>> {
        Self::encode(resp)
    }

    fn decode_install_snapshot_response(&self, bytes: &[u8]) -> Result<InstallSnapshotResponse> {
        Self::decode(bytes)
    }
}
