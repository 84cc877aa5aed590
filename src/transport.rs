//! The transport surface the Raft layer programs against.
//!
//! Every transport variant (CoAP here, HTTP elsewhere) exposes the same
//! three RPCs; the Raft state machine holds a `dyn RaftTransport` and
//! never learns which wire it is speaking.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::Result;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeId, RequestVoteRequest, RequestVoteResponse,
};

/// Raft-facing RPC operations. Each resolves exactly once with a value
/// or a typed error.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn send_request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
        timeout: Duration,
    ) -> Result<RequestVoteResponse>;

    async fn send_append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
        timeout: Duration,
    ) -> Result<AppendEntriesResponse>;

    async fn send_install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
        timeout: Duration,
    ) -> Result<InstallSnapshotResponse>;
}
