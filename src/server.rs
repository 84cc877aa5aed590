//! CoAP server: the inbound half of the RPC engine.
//!
//! Requests pass through a fixed pipeline: datagram screening, duplicate
//! suppression (with cached-ACK replay), concurrency gating, optional
//! Block1 reassembly, then handler dispatch. Handler failures become
//! 5.00 responses, decode failures 4.00; neither takes the server down.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::block::{BlockReassembler, ReassemblyOutcome};
use crate::config::CoapServerConfig;
use crate::dedup::{DuplicateDetector, MessageIdGenerator};
use crate::errors::{RejectionReason, Result, TransportError};
use crate::metrics;
use crate::msg::{screen_datagram, CoapMessage, Code, MessageType};
use crate::net::{DatagramTransport, Endpoint};
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse, RpcKind,
};
use crate::serializer::SharedSerializer;

/// Method Not Allowed (4.05) and Not Found (4.04); only POST reaches
/// the Raft resources.
const CODE_NOT_FOUND: Code = Code(0x84);
const CODE_METHOD_NOT_ALLOWED: Code = Code(0x85);

/// Poll granularity of the ingress loop.
const INGRESS_POLL: Duration = Duration::from_millis(250);

type HandlerFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

type RequestVoteHandler =
    Arc<dyn Fn(RequestVoteRequest) -> HandlerFuture<RequestVoteResponse> + Send + Sync>;
type AppendEntriesHandler =
    Arc<dyn Fn(AppendEntriesRequest) -> HandlerFuture<AppendEntriesResponse> + Send + Sync>;
type InstallSnapshotHandler =
    Arc<dyn Fn(InstallSnapshotRequest) -> HandlerFuture<InstallSnapshotResponse> + Send + Sync>;

/// One registration slot per RPC kind; the set is sealed.
#[derive(Default)]
struct HandlerRegistry {
    request_vote: Option<RequestVoteHandler>,
    append_entries: Option<AppendEntriesHandler>,
    install_snapshot: Option<InstallSnapshotHandler>,
}

impl HandlerRegistry {
    fn registered_paths(&self) -> Vec<&'static str> {
        let mut paths = Vec::new();
        if self.request_vote.is_some() {
            paths.push(RpcKind::RequestVote.resource_path());
        }
        if self.append_entries.is_some() {
            paths.push(RpcKind::AppendEntries.resource_path());
        }
        if self.install_snapshot.is_some() {
            paths.push(RpcKind::InstallSnapshot.resource_path());
        }
        paths
    }
}

struct ServerState {
    serializer: SharedSerializer,
    transport: Arc<dyn DatagramTransport>,
    handlers: Mutex<HandlerRegistry>,
    dedup: Mutex<DuplicateDetector>,
    reassembler: Mutex<BlockReassembler>,
    slots: Arc<Semaphore>,
    running: AtomicBool,
    max_request_size: usize,
    /// IDs for non-confirmable replies, which carry the server's own
    /// message-ID sequence rather than echoing the request's.
    msg_ids: MessageIdGenerator,
}

/// The CoAP RPC server.
pub struct CoapServer {
    config: CoapServerConfig,
    state: Arc<ServerState>,
    ingress: Mutex<Option<JoinHandle<()>>>,
}

impl CoapServer {
    pub fn new(
        config: CoapServerConfig,
        transport: Arc<dyn DatagramTransport>,
        serializer: SharedSerializer,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| TransportError::Configuration(e.to_string()))?;

        let state = Arc::new(ServerState {
            serializer,
            transport,
            handlers: Mutex::new(HandlerRegistry::default()),
            dedup: Mutex::new(DuplicateDetector::new()),
            reassembler: Mutex::new(BlockReassembler::new(
                config.max_request_size,
                config.block_transfer_timeout,
            )),
            slots: Arc::new(Semaphore::new(config.max_concurrent_sessions)),
            running: AtomicBool::new(false),
            max_request_size: config.max_request_size,
            msg_ids: MessageIdGenerator::new(),
        });

        Ok(Self {
            config,
            state,
            ingress: Mutex::new(None),
        })
    }

    pub fn register_request_vote_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(RequestVoteRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RequestVoteResponse>> + Send + 'static,
    {
        let handler: RequestVoteHandler = Arc::new(move |req| Box::pin(handler(req)));
        self.state.handlers.lock().unwrap().request_vote = Some(handler);
    }

    pub fn register_append_entries_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(AppendEntriesRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AppendEntriesResponse>> + Send + 'static,
    {
        let handler: AppendEntriesHandler = Arc::new(move |req| Box::pin(handler(req)));
        self.state.handlers.lock().unwrap().append_entries = Some(handler);
    }

    pub fn register_install_snapshot_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(InstallSnapshotRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<InstallSnapshotResponse>> + Send + 'static,
    {
        let handler: InstallSnapshotHandler = Arc::new(move |req| Box::pin(handler(req)));
        self.state.handlers.lock().unwrap().install_snapshot = Some(handler);
    }

    /// Start serving. Installs a resource per registered handler and
    /// joins the multicast group when configured. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.state.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.config.dtls.enable_dtls {
            if let Err(e) = crate::dtls::validate_credentials(&self.config.dtls) {
                self.state.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        if self.config.enable_multicast {
            let group = Endpoint::new(
                self.config.multicast_address.clone(),
                self.config.multicast_port,
            );
            self.state.transport.join_multicast(&group).await?;
            info!(group = %group, "Joined multicast group");
        }

        let paths = self.state.handlers.lock().unwrap().registered_paths();
        info!(
            local = %self.state.transport.local_endpoint(),
            resources = ?paths,
            "CoAP server started"
        );

        let state = Arc::clone(&self.state);
        *self.ingress.lock().unwrap() = Some(tokio::spawn(ingress_loop(state)));
        Ok(())
    }

    /// Stop serving. Idempotent; in-flight handlers finish on their own.
    pub fn stop(&self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.ingress.lock().unwrap().take() {
            handle.abort();
        }
        info!("CoAP server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.state.transport.local_endpoint()
    }
}

impl Drop for CoapServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn ingress_loop(state: Arc<ServerState>) {
    while state.running.load(Ordering::SeqCst) {
        let datagram = match state.transport.recv_from(INGRESS_POLL).await {
            Ok(datagram) => datagram,
            Err(TransportError::Timeout { .. }) => continue,
            Err(e) => {
                debug!(error = %e, "Server receive failed, backing off");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        ingest_datagram(&state, datagram.payload, datagram.source).await;
    }
}

async fn ingest_datagram(state: &Arc<ServerState>, raw: Vec<u8>, source: Endpoint) {
    // Step 1: datagram screening. Reject with 4.00 where a message ID
    // is recoverable, otherwise drop.
    if let Some(reason) = screen_datagram(&raw) {
        reject(state, reason);
        if raw.len() >= 4 {
            let message_id = u16::from_be_bytes([raw[2], raw[3]]);
            let bad = CoapMessage::new(
                MessageType::Acknowledgement,
                Code::BAD_REQUEST,
                message_id,
                Vec::new(),
            );
            send_reply(state, &bad, &source).await;
        }
        return;
    }

    let msg = match CoapMessage::decode(&raw) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(error = %e, source = %source, "Undecodable request");
            reject(state, RejectionReason::DecodeFailure);
            return;
        }
    };

    // Only requests are served; stray responses and empty messages are
    // dropped silently.
    if !msg.code.is_request() {
        return;
    }

    let confirmable = msg.mtype == MessageType::Confirmable;

    // Step 2: duplicate suppression with cached-ACK replay.
    if confirmable {
        let source_key = source.to_string();
        let cached = {
            let mut dedup = state.dedup.lock().unwrap();
            if dedup.check_and_record(&source_key, msg.message_id) {
                Some(dedup.cached_ack(&source_key, msg.message_id).map(|b| b.to_vec()))
            } else {
                None
            }
        };
        if let Some(maybe_ack) = cached {
            metrics::DUPLICATES_SUPPRESSED_TOTAL.inc();
            match maybe_ack {
                Some(ack) => {
                    debug!(message_id = msg.message_id, "Replaying cached ACK for duplicate");
                    send_raw(state, &ack, &source).await;
                }
                None => {
                    debug!(message_id = msg.message_id, "Duplicate dropped, no cached ACK yet");
                }
            }
            return;
        }
    }

    // Step 3: concurrency gate, fail-fast.
    let permit = match Arc::clone(&state.slots).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!(source = %source, "Concurrent session limit reached, request dropped");
            reject(state, RejectionReason::Saturated);
            return;
        }
    };

    let state = Arc::clone(state);
    tokio::spawn(async move {
        let _permit = permit;
        process_request(&state, msg, source).await;
    });
}

async fn process_request(state: &Arc<ServerState>, msg: CoapMessage, source: Endpoint) {
    let reply_type = if msg.mtype == MessageType::Confirmable {
        MessageType::Acknowledgement
    } else {
        MessageType::NonConfirmable
    };
    // ACKs echo the request's message ID; NON replies carry our own.
    let reply_mid = if reply_type == MessageType::Acknowledgement {
        msg.message_id
    } else {
        state.msg_ids.next_id()
    };

    // Step 4: Block1 reassembly.
    let payload = match msg.block1() {
        Some(Ok(option)) => {
            let outcome = {
                let mut reassembler = state.reassembler.lock().unwrap();
                reassembler.accept(&msg.token, option, &msg.payload)
            };
            match outcome {
                Ok(ReassemblyOutcome::Continue) => {
                    let mut cont = CoapMessage::new(
                        reply_type,
                        Code::CONTINUE,
                        reply_mid,
                        msg.token.clone(),
                    );
                    cont.set_block1(option);
                    reply_and_cache(state, &cont, &source, msg.message_id).await;
                    return;
                }
                Ok(ReassemblyOutcome::Complete(payload)) => {
                    metrics::BLOCK_TRANSFERS_COMPLETED_TOTAL.inc();
                    payload
                }
                Err(e) => {
                    debug!(error = %e, "Block reassembly aborted");
                    reject(state, RejectionReason::BlockSequence);
                    respond_code(state, &msg, reply_type, reply_mid, Code::BAD_REQUEST, &source).await;
                    return;
                }
            }
        }
        Some(Err(e)) => {
            debug!(error = %e, "Malformed block option");
            reject(state, RejectionReason::DecodeFailure);
            respond_code(state, &msg, reply_type, reply_mid, Code::BAD_REQUEST, &source).await;
            return;
        }
        None => msg.payload.clone(),
    };

    if payload.len() > state.max_request_size {
        reject(state, RejectionReason::DecodeFailure);
        respond_code(state, &msg, reply_type, reply_mid, Code::BAD_REQUEST, &source).await;
        return;
    }

    // Step 5: route and dispatch.
    if msg.code != Code::POST {
        respond_code(state, &msg, reply_type, reply_mid, CODE_METHOD_NOT_ALLOWED, &source).await;
        return;
    }

    let path = msg.uri_path();
    let Some(kind) = RpcKind::from_resource_path(&path) else {
        debug!(path = %path, "Request for unknown resource");
        respond_code(state, &msg, reply_type, reply_mid, CODE_NOT_FOUND, &source).await;
        return;
    };

    let (code, response_payload) = dispatch(state, kind, &payload).await;
    metrics::SERVER_REQUESTS_TOTAL
        .with_label_values(&[
            kind.label(),
            if code.is_success() { "success" } else { "error" },
        ])
        .inc();

    let mut response = CoapMessage::new(reply_type, code, reply_mid, msg.token.clone());
    if !response_payload.is_empty() {
        response.set_content_format(state.serializer.content_format());
        response = response.with_payload(response_payload);
    }
    reply_and_cache(state, &response, &source, msg.message_id).await;
}

/// Deserialize, dispatch to the registered handler, serialize. Decode
/// failures map to 4.00, handler and encode failures to 5.00.
async fn dispatch(state: &Arc<ServerState>, kind: RpcKind, payload: &[u8]) -> (Code, Vec<u8>) {
    let handler = {
        let handlers = state.handlers.lock().unwrap();
        match kind {
            RpcKind::RequestVote => handlers.request_vote.clone().map(HandlerKind::RequestVote),
            RpcKind::AppendEntries => handlers
                .append_entries
                .clone()
                .map(HandlerKind::AppendEntries),
            RpcKind::InstallSnapshot => handlers
                .install_snapshot
                .clone()
                .map(HandlerKind::InstallSnapshot),
        }
    };
    let Some(handler) = handler else {
        return (CODE_NOT_FOUND, Vec::new());
    };

    let serializer = &state.serializer;
    let result: std::result::Result<Vec<u8>, DispatchError> = match handler {
        HandlerKind::RequestVote(h) => match serializer.decode_request_vote_request(payload) {
            Ok(request) => match h(request).await {
                Ok(response) => serializer
                    .encode_request_vote_response(&response)
                    .map_err(internal),
                Err(e) => Err(internal(e)),
            },
            Err(e) => Err(bad_request(e)),
        },
        HandlerKind::AppendEntries(h) => match serializer.decode_append_entries_request(payload) {
            Ok(request) => match h(request).await {
                Ok(response) => serializer
                    .encode_append_entries_response(&response)
                    .map_err(internal),
                Err(e) => Err(internal(e)),
            },
            Err(e) => Err(bad_request(e)),
        },
        HandlerKind::InstallSnapshot(h) => {
            match serializer.decode_install_snapshot_request(payload) {
                Ok(request) => match h(request).await {
                    Ok(response) => serializer
                        .encode_install_snapshot_response(&response)
                        .map_err(internal),
                    Err(e) => Err(internal(e)),
                },
                Err(e) => Err(bad_request(e)),
            }
        }
    };

    match result {
        Ok(bytes) => (Code::CONTENT, bytes),
        Err(DispatchError::BadRequest(e)) => {
            debug!(error = %e, rpc = kind.label(), "Request decode failed");
            (Code::BAD_REQUEST, Vec::new())
        }
        Err(DispatchError::Internal(e)) => {
            warn!(error = %e, rpc = kind.label(), "Handler failed");
            (Code::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}

enum HandlerKind {
    RequestVote(RequestVoteHandler),
    AppendEntries(AppendEntriesHandler),
    InstallSnapshot(InstallSnapshotHandler),
}

/// Internal dispatch error split deciding between 4.00 and 5.00.
enum DispatchError {
    BadRequest(TransportError),
    Internal(TransportError),
}

fn bad_request(e: TransportError) -> DispatchError {
    DispatchError::BadRequest(e)
}

fn internal(e: TransportError) -> DispatchError {
    DispatchError::Internal(e)
}

fn reject(state: &Arc<ServerState>, reason: RejectionReason) {
    metrics::SERVER_REJECTIONS_TOTAL
        .with_label_values(&[reason.label()])
        .inc();
    debug!(reason = %reason, "Request rejected");
}

async fn respond_code(
    state: &Arc<ServerState>,
    request: &CoapMessage,
    reply_type: MessageType,
    reply_mid: u16,
    code: Code,
    dest: &Endpoint,
) {
    let response = CoapMessage::new(reply_type, code, reply_mid, request.token.clone());
    reply_and_cache(state, &response, dest, request.message_id).await;
}

async fn reply_and_cache(
    state: &Arc<ServerState>,
    response: &CoapMessage,
    dest: &Endpoint,
    request_mid: u16,
) {
    let wire = response.encode();
    if response.mtype == MessageType::Acknowledgement {
        state
            .dedup
            .lock()
            .unwrap()
            .cache_ack(&dest.to_string(), request_mid, wire.clone());
    }
    send_raw(state, &wire, dest).await;
}

async fn send_reply(state: &Arc<ServerState>, response: &CoapMessage, dest: &Endpoint) {
    send_raw(state, &response.encode(), dest).await;
}

async fn send_raw(state: &Arc<ServerState>, wire: &[u8], dest: &Endpoint) {
    if let Err(e) = state
        .transport
        .send_to(wire, dest, Duration::from_secs(5))
        .await
    {
        debug!(error = %e, dest = %dest, "Reply send failed");
    }
}
