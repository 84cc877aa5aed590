//! CoAP client: the outbound half of the RPC engine.
//!
//! One client serves one Raft node. It owns the pending-request table,
//! the dedup window, the session pool, the serialization cache, and the
//! multicast collectors, all behind short-lived locks that are never
//! held across an await. A background receiver task drains the
//! transport and resolves pending futures; senders race those futures
//! against the CON retransmission schedule.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{cache_key, SerializationCache};
use crate::config::{validate_multicast_address, CoapClientConfig};
use crate::dedup::{DuplicateDetector, MessageIdGenerator, TokenGenerator};
use crate::dtls::DtlsProvider;
use crate::errors::{Result, TransportError};
use crate::metrics;
use crate::msg::{screen_datagram, CoapMessage, Code, MessageType};
use crate::net::{enforce_scheme, parse_coap_uri, CoapUri, DatagramTransport, Endpoint};
use crate::pool::MemoryPool;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeId, RequestVoteRequest, RequestVoteResponse, RpcKind,
};
use crate::serializer::SharedSerializer;
use crate::session::SessionPool;
use crate::transport::RaftTransport;
use crate::{block, config};

/// How long the receiver task blocks per poll before rechecking the
/// shutdown flag.
const RECEIVER_POLL: Duration = Duration::from_millis(250);

/// Hard ceiling on a single retransmission timeout.
const MAX_RTO: Duration = Duration::from_secs(60);

/// Exponent cap for the RTO backoff arithmetic.
const MAX_RTO_EXPONENT: u32 = 20;

struct PendingEntry {
    message_id: u16,
    response_tx: oneshot::Sender<CoapMessage>,
    acked: Arc<AtomicBool>,
}

#[derive(Default)]
struct MulticastCollector {
    /// Responses in arrival order, one per sender.
    responses: Vec<Vec<u8>>,
    seen_senders: HashSet<String>,
}

struct PartitionRecord {
    first_failure: Instant,
    reported: bool,
}

struct ClientState {
    endpoints: Mutex<HashMap<NodeId, CoapUri>>,
    pending: Mutex<HashMap<Vec<u8>, PendingEntry>>,
    dedup: Mutex<DuplicateDetector>,
    sessions: Mutex<SessionPool>,
    cache: Mutex<SerializationCache>,
    collectors: Mutex<HashMap<Vec<u8>, MulticastCollector>>,
    partitions: Mutex<HashMap<String, PartitionRecord>>,
    running: AtomicBool,
}

/// RAII guard pairing the concurrency gauge with the semaphore permit.
struct SlotGuard {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl SlotGuard {
    fn new(permit: tokio::sync::OwnedSemaphorePermit) -> Self {
        metrics::CONCURRENT_REQUESTS.inc();
        Self { _permit: permit }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        metrics::CONCURRENT_REQUESTS.dec();
    }
}

/// The CoAP RPC client.
pub struct CoapClient {
    config: CoapClientConfig,
    serializer: SharedSerializer,
    transport: Arc<dyn DatagramTransport>,
    provider: Arc<dyn DtlsProvider>,
    state: Arc<ClientState>,
    slots: Arc<Semaphore>,
    msg_ids: MessageIdGenerator,
    tokens: TokenGenerator,
    memory_pool: Option<MemoryPool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl CoapClient {
    /// Validate `config` and start the client's receiver task over
    /// `transport`.
    pub fn new(
        config: CoapClientConfig,
        transport: Arc<dyn DatagramTransport>,
        serializer: SharedSerializer,
        provider: Arc<dyn DtlsProvider>,
    ) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|e| TransportError::Configuration(e.to_string()))?;
        if config.dtls.enable_dtls {
            // Fail at construction, not on the first RPC.
            crate::dtls::validate_credentials(&config.dtls)?;
        }

        let memory_pool = if config.enable_memory_optimization {
            Some(MemoryPool::new(config::MemoryPoolConfig::new(
                config.memory_pool_size,
                config.max_block_size.max(1024),
            ))?)
        } else {
            None
        };

        let state = Arc::new(ClientState {
            endpoints: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            dedup: Mutex::new(DuplicateDetector::new()),
            sessions: Mutex::new(SessionPool::new(
                config.connection_pool_size.max(1),
                config.max_sessions.max(1),
                config.session_timeout,
            )),
            cache: Mutex::new(SerializationCache::new(config.serialization_cache_size)),
            collectors: Mutex::new(HashMap::new()),
            partitions: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        });

        // With gating disabled the semaphore still exists but can never
        // refuse.
        let slot_count = if config.enable_concurrent_processing {
            config.max_concurrent_requests.max(1)
        } else {
            Semaphore::MAX_PERMITS
        };
        let slots = Arc::new(Semaphore::new(slot_count));

        let client = Arc::new(Self {
            config,
            serializer,
            transport,
            provider,
            state,
            slots,
            msg_ids: MessageIdGenerator::new(),
            tokens: TokenGenerator::new(),
            memory_pool,
            receiver: Mutex::new(None),
        });

        let handle = tokio::spawn(receiver_loop(
            Arc::clone(&client.state),
            Arc::clone(&client.transport),
        ));
        *client.receiver.lock().unwrap() = Some(handle);

        info!(local = %client.transport.local_endpoint(), "CoAP client started");
        Ok(client)
    }

    /// Map `node` to a CoAP endpoint URI (`coap://` or `coaps://`).
    pub fn register_endpoint(&self, node: NodeId, uri: &str) -> Result<()> {
        let parsed = parse_coap_uri(uri)?;
        self.state.endpoints.lock().unwrap().insert(node, parsed);
        Ok(())
    }

    /// Fail every outstanding future and stop the receiver task.
    pub fn shutdown(&self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Dropping the pending senders resolves every waiter with a
        // shutdown error.
        self.state.pending.lock().unwrap().clear();
        self.state.collectors.lock().unwrap().clear();
        if let Some(handle) = self.receiver.lock().unwrap().take() {
            handle.abort();
        }
        info!("CoAP client shut down");
    }

    /// True when consecutive failures to `endpoint` have spanned the
    /// partition threshold without an intervening success.
    pub fn is_partitioned(&self, endpoint: &Endpoint) -> bool {
        self.state
            .partitions
            .lock()
            .unwrap()
            .get(&endpoint.to_string())
            .map(|r| r.reported)
            .unwrap_or(false)
    }

    /// Cache statistics: (hits, misses, entries).
    pub fn cache_stats(&self) -> (u64, u64, usize) {
        let cache = self.state.cache.lock().unwrap();
        (cache.hits(), cache.misses(), cache.len())
    }

    pub fn session_pool_stats(&self) -> crate::session::SessionPoolStats {
        self.state.sessions.lock().unwrap().stats()
    }

    fn resolve_endpoint(&self, node: NodeId) -> Result<CoapUri> {
        self.state
            .endpoints
            .lock()
            .unwrap()
            .get(&node)
            .cloned()
            .ok_or_else(|| TransportError::Network(format!("no endpoint mapping for node {node}")))
    }

    fn acquire_slot(&self) -> Result<SlotGuard> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => Ok(SlotGuard::new(permit)),
            Err(_) => Err(TransportError::ResourceExhausted(format!(
                "{} concurrent requests already in flight",
                self.config.max_concurrent_requests
            ))),
        }
    }

    fn record_endpoint_failure(&self, endpoint: &Endpoint) {
        let key = endpoint.to_string();
        let mut partitions = self.state.partitions.lock().unwrap();
        let record = partitions.entry(key.clone()).or_insert(PartitionRecord {
            first_failure: Instant::now(),
            reported: false,
        });
        if !record.reported && record.first_failure.elapsed() > self.config.partition_threshold {
            record.reported = true;
            metrics::NETWORK_PARTITIONS_DETECTED_TOTAL.inc();
            error!(
                endpoint = %endpoint,
                failing_for_ms = record.first_failure.elapsed().as_millis() as u64,
                "Network partition detected"
            );
        }
    }

    fn record_endpoint_success(&self, endpoint: &Endpoint) {
        let key = endpoint.to_string();
        let mut partitions = self.state.partitions.lock().unwrap();
        if let Some(record) = partitions.remove(&key) {
            if record.reported {
                info!(endpoint = %endpoint, "Network partition recovered");
            }
        }
    }

    /// Stage the payload through the arena when memory optimization is
    /// on; the round trip catches size violations early and keeps the
    /// arena metrics live.
    fn stage_payload(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let Some(pool) = &self.memory_pool else {
            return Ok(payload);
        };
        if payload.len() > pool.block_size() {
            // Oversized payloads bypass the arena; block transfer will
            // split them on the wire anyway.
            return Ok(payload);
        }
        let Some(handle) = pool.allocate(payload.len(), "outbound payload") else {
            return Ok(payload);
        };
        pool.copy_in(handle, &payload)?;
        let staged = pool.copy_out(handle, payload.len())?;
        pool.deallocate(handle)?;
        Ok(staged)
    }

    /// Check a session out of the pool, completing a DTLS handshake for
    /// fresh sessions when security is on.
    async fn checkout_session(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Option<crate::session::Session>> {
        if !self.config.enable_connection_pooling && !self.config.dtls.enable_dtls {
            return Ok(None);
        }

        let mut session = {
            let mut pool = self.state.sessions.lock().unwrap();
            pool.get_or_create(endpoint, self.config.dtls.enable_dtls)?
        };

        if self.config.dtls.enable_dtls && !session.secured {
            let handshake = self.provider.handshake(endpoint, &self.config.dtls);
            match tokio::time::timeout(self.config.dtls.handshake_timeout, handshake).await {
                Ok(Ok(_established)) => {
                    session.secured = true;
                }
                Ok(Err(e)) => {
                    self.state.sessions.lock().unwrap().discard(session);
                    return Err(e);
                }
                Err(_) => {
                    self.state.sessions.lock().unwrap().discard(session);
                    return Err(TransportError::timeout(
                        "handshake",
                        self.config.dtls.handshake_timeout,
                    ));
                }
            }
        }

        metrics::SESSIONS_ACTIVE.inc();
        Ok(Some(session))
    }

    fn checkin_session(&self, session: Option<crate::session::Session>, failed: bool) {
        let Some(session) = session else { return };
        metrics::SESSIONS_ACTIVE.dec();
        let mut pool = self.state.sessions.lock().unwrap();
        if failed || !self.config.enable_session_reuse {
            pool.discard(session);
        } else {
            pool.return_session(session);
        }
    }

    /// Send one encoded request to `kind`'s resource on `target` and
    /// return the raw response payload.
    pub async fn send_rpc(
        &self,
        target: NodeId,
        kind: RpcKind,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        if !self.state.running.load(Ordering::SeqCst) {
            return Err(TransportError::Network("client is shut down".into()));
        }

        let uri = self.resolve_endpoint(target)?;
        enforce_scheme(&uri, self.config.dtls.enable_dtls)?;
        let endpoint = uri.endpoint.clone();

        let _slot = self.acquire_slot()?;
        let payload = self.stage_payload(payload)?;

        let session = self.checkout_session(&endpoint).await?;
        let result = self
            .send_rpc_inner(kind, &endpoint, payload, timeout)
            .await;
        self.checkin_session(session, result.is_err());

        match &result {
            Ok(_) => {
                self.record_endpoint_success(&endpoint);
                metrics::RPC_REQUESTS_TOTAL
                    .with_label_values(&[kind.label(), "success"])
                    .inc();
            }
            Err(e) => {
                if matches!(e, TransportError::Network(_) | TransportError::Timeout { .. }) {
                    self.record_endpoint_failure(&endpoint);
                }
                metrics::RPC_REQUESTS_TOTAL
                    .with_label_values(&[kind.label(), "error"])
                    .inc();
                metrics::RPC_ERRORS_TOTAL
                    .with_label_values(&[e.kind_label()])
                    .inc();
            }
        }
        result
    }

    async fn send_rpc_inner(
        &self,
        kind: RpcKind,
        endpoint: &Endpoint,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let token = self.tokens.next_token();
        let deadline = Instant::now() + timeout;

        let response = if self.config.enable_block_transfer
            && payload.len() > self.config.max_block_size
        {
            self.send_blockwise(kind, endpoint, &token, payload, deadline)
                .await?
        } else {
            let msg = self.build_request(kind, &token, payload);
            self.exchange_confirmable(msg, endpoint, deadline).await?
        };

        if response.code.is_success() {
            Ok(response.payload)
        } else {
            Err(TransportError::Protocol(format!(
                "server replied {} for {}",
                response.code.dotted(),
                kind.resource_path()
            )))
        }
    }

    fn build_request(&self, kind: RpcKind, token: &[u8], payload: Vec<u8>) -> CoapMessage {
        let mut msg = CoapMessage::new(
            MessageType::Confirmable,
            Code::POST,
            self.msg_ids.next_id(),
            token.to_vec(),
        );
        msg.set_uri_path(kind.resource_path());
        msg.set_content_format(self.serializer.content_format());
        msg.with_payload(payload)
    }

    async fn send_blockwise(
        &self,
        kind: RpcKind,
        endpoint: &Endpoint,
        token: &[u8],
        payload: Vec<u8>,
        deadline: Instant,
    ) -> Result<CoapMessage> {
        let blocks = block::split_payload(&payload, self.config.max_block_size);
        debug!(
            blocks = blocks.len(),
            total = payload.len(),
            "Splitting oversized payload"
        );

        let mut last_response = None;
        for (option, chunk) in blocks {
            let mut msg = self.build_request(kind, token, chunk);
            msg.set_block1(option);
            let response = self.exchange_confirmable(msg, endpoint, deadline).await?;

            if option.more {
                if response.code != Code::CONTINUE {
                    return Err(TransportError::Protocol(format!(
                        "expected 2.31 Continue for block {}, got {}",
                        option.num,
                        response.code.dotted()
                    )));
                }
            } else {
                last_response = Some(response);
            }
        }
        last_response.ok_or_else(|| TransportError::Protocol("empty block sequence".into()))
    }

    /// One CON exchange: register the pending entry, send, and race the
    /// response future against the retransmission schedule.
    async fn exchange_confirmable(
        &self,
        msg: CoapMessage,
        endpoint: &Endpoint,
        deadline: Instant,
    ) -> Result<CoapMessage> {
        let token = msg.token.clone();
        let acked = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = oneshot::channel();
        self.state.pending.lock().unwrap().insert(
            token.clone(),
            PendingEntry {
                message_id: msg.message_id,
                response_tx: tx,
                acked: Arc::clone(&acked),
            },
        );

        let wire = msg.encode();
        let result = self
            .drive_retransmission(&wire, endpoint, deadline, &acked, &mut rx)
            .await;
        // Whatever happened, the table entry must not outlive the call.
        self.state.pending.lock().unwrap().remove(&token);
        result
    }

    async fn drive_retransmission(
        &self,
        wire: &[u8],
        endpoint: &Endpoint,
        deadline: Instant,
        acked: &AtomicBool,
        rx: &mut oneshot::Receiver<CoapMessage>,
    ) -> Result<CoapMessage> {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        let remaining = |now: Instant| deadline.saturating_duration_since(now);
        if remaining(started).is_zero() {
            return Err(TransportError::timeout("request", Duration::ZERO));
        }

        self.transport
            .send_to(wire, endpoint, remaining(Instant::now()))
            .await?;

        loop {
            let left = remaining(Instant::now());
            if left.is_zero() {
                return Err(TransportError::timeout("request", started.elapsed()));
            }

            let wait = if acked.load(Ordering::SeqCst) {
                // The peer has the request; retransmission stops and
                // only the overall deadline applies.
                left
            } else {
                self.rto_for_attempt(attempts).min(left)
            };

            match tokio::time::timeout(wait, &mut *rx).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(_closed)) => {
                    return Err(TransportError::Network("client torn down".into()))
                }
                Err(_elapsed) => {
                    if acked.load(Ordering::SeqCst) || remaining(Instant::now()).is_zero() {
                        return Err(TransportError::timeout("request", started.elapsed()));
                    }
                    attempts += 1;
                    if attempts > self.config.max_retransmit {
                        warn!(
                            endpoint = %endpoint,
                            retransmissions = attempts - 1,
                            "Retransmission budget exhausted"
                        );
                        return Err(TransportError::timeout("request", started.elapsed()));
                    }
                    metrics::RETRANSMISSIONS_TOTAL.inc();
                    debug!(endpoint = %endpoint, attempt = attempts, "Retransmitting CON");
                    self.transport
                        .send_to(wire, endpoint, remaining(Instant::now()))
                        .await?;
                }
            }
        }
    }

    /// `ack_timeout * multiplier^attempts`, exponent- and value-capped.
    fn rto_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(MAX_RTO_EXPONENT);
        let factor = self.config.ack_backoff_multiplier.powi(exponent as i32);
        let rto_ms = (self.config.ack_timeout.as_millis() as f64) * factor;
        Duration::from_millis(rto_ms.min(MAX_RTO.as_millis() as f64) as u64)
    }

    /// Fan a non-confirmable request out to a multicast group and
    /// collect unicast responses until `timeout` elapses.
    ///
    /// The result holds at most one response per sender, in arrival
    /// order; an empty collection is a normal outcome.
    pub async fn send_multicast(
        &self,
        addr: &str,
        port: u16,
        path: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<Vec<u8>>> {
        if !self.config.enable_multicast {
            return Err(TransportError::Configuration(
                "multicast is disabled".into(),
            ));
        }
        validate_multicast_address(addr)
            .map_err(|e| TransportError::Configuration(e.to_string()))?;
        if port == 0 {
            return Err(TransportError::Configuration(
                "multicast port must be nonzero".into(),
            ));
        }

        let token = self.tokens.next_token();
        let mut msg = CoapMessage::new(
            MessageType::NonConfirmable,
            Code::POST,
            self.msg_ids.next_id(),
            token.clone(),
        );
        msg.set_uri_path(path);
        msg.set_content_format(self.serializer.content_format());
        let msg = msg.with_payload(payload);

        self.state
            .collectors
            .lock()
            .unwrap()
            .insert(token.clone(), MulticastCollector::default());
        metrics::MULTICAST_REQUESTS_TOTAL.inc();

        let group = Endpoint::new(addr, port);
        let send_result = self
            .transport
            .send_to(&msg.encode(), &group, timeout)
            .await;
        if let Err(e) = send_result {
            self.state.collectors.lock().unwrap().remove(&token);
            return Err(e);
        }

        // Collection window: responses accumulate in the background
        // receiver until the timeout finalizes the set.
        tokio::time::sleep(timeout).await;

        let collector = self
            .state
            .collectors
            .lock()
            .unwrap()
            .remove(&token)
            .unwrap_or_default();
        debug!(
            responders = collector.responses.len(),
            "Multicast collection finalized"
        );
        Ok(collector.responses)
    }
}

impl Drop for CoapClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn receiver_loop(state: Arc<ClientState>, transport: Arc<dyn DatagramTransport>) {
    while state.running.load(Ordering::SeqCst) {
        let datagram = match transport.recv_from(RECEIVER_POLL).await {
            Ok(datagram) => datagram,
            Err(TransportError::Timeout { .. }) => continue,
            Err(e) => {
                debug!(error = %e, "Receive failed, backing off");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        if screen_datagram(&datagram.payload).is_some() {
            continue;
        }
        let msg = match CoapMessage::decode(&datagram.payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, source = %datagram.source, "Undecodable datagram dropped");
                continue;
            }
        };

        handle_inbound(&state, msg, &datagram.source);
    }
}

fn handle_inbound(state: &Arc<ClientState>, msg: CoapMessage, source: &Endpoint) {
    // Empty ACK: arms the "request received" flag; the response is
    // still to come as a separate message.
    if msg.mtype == MessageType::Acknowledgement && msg.code == Code::EMPTY {
        let pending = state.pending.lock().unwrap();
        if let Some(entry) = pending.values().find(|e| e.message_id == msg.message_id) {
            entry.acked.store(true, Ordering::SeqCst);
        }
        return;
    }

    if msg.mtype == MessageType::Reset {
        debug!(message_id = msg.message_id, "RST received");
        return;
    }

    // Response path dedup, keyed per source since message IDs are only
    // unique within one sender's sequence.
    {
        let source_key = source.to_string();
        let mut dedup = state.dedup.lock().unwrap();
        if dedup.check_and_record(&source_key, msg.message_id) {
            metrics::DUPLICATES_SUPPRESSED_TOTAL.inc();
            return;
        }
    }

    // Unicast response correlated by token.
    {
        let mut pending = state.pending.lock().unwrap();
        if let Some(entry) = pending.remove(&msg.token) {
            let _ = entry.response_tx.send(msg);
            return;
        }
    }

    // Multicast response: first response per sender wins.
    {
        let mut collectors = state.collectors.lock().unwrap();
        if let Some(collector) = collectors.get_mut(&msg.token) {
            if collector.seen_senders.insert(source.host.clone()) {
                collector.responses.push(msg.payload);
                metrics::MULTICAST_RESPONSES_TOTAL.inc();
            } else {
                debug!(sender = %source, "Duplicate multicast response discarded");
            }
            return;
        }
    }

    debug!(source = %source, "Response with unknown token dropped");
}

#[async_trait]
impl RaftTransport for CoapClient {
    async fn send_request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
        timeout: Duration,
    ) -> Result<RequestVoteResponse> {
        let payload = self.encode_cached(RpcKind::RequestVote, &request, |s, r| {
            s.encode_request_vote_request(r)
        })?;
        let response = self
            .send_rpc(target, RpcKind::RequestVote, payload, timeout)
            .await?;
        self.serializer.decode_request_vote_response(&response)
    }

    async fn send_append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
        timeout: Duration,
    ) -> Result<AppendEntriesResponse> {
        let payload = self.encode_cached(RpcKind::AppendEntries, &request, |s, r| {
            s.encode_append_entries_request(r)
        })?;
        let response = self
            .send_rpc(target, RpcKind::AppendEntries, payload, timeout)
            .await?;
        self.serializer.decode_append_entries_response(&response)
    }

    async fn send_install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
        timeout: Duration,
    ) -> Result<InstallSnapshotResponse> {
        let payload = self.encode_cached(RpcKind::InstallSnapshot, &request, |s, r| {
            s.encode_install_snapshot_request(r)
        })?;
        let response = self
            .send_rpc(target, RpcKind::InstallSnapshot, payload, timeout)
            .await?;
        self.serializer.decode_install_snapshot_response(&response)
    }
}

impl CoapClient {
    /// Serialize through the cache: hits reuse the encoded bytes,
    /// misses encode and insert.
    fn encode_cached<T, F>(&self, kind: RpcKind, request: &T, encode: F) -> Result<Vec<u8>>
    where
        T: std::hash::Hash,
        F: Fn(&dyn crate::serializer::RpcSerializer, &T) -> Result<Vec<u8>>,
    {
        if !self.config.enable_serialization_caching {
            return encode(self.serializer.as_ref(), request);
        }

        let key = cache_key(kind, request);
        {
            let mut cache = self.state.cache.lock().unwrap();
            if let Some(bytes) = cache.get(key) {
                metrics::SERIALIZATION_CACHE_HITS_TOTAL.inc();
                return Ok(bytes.as_ref().clone());
            }
        }
        metrics::SERIALIZATION_CACHE_MISSES_TOTAL.inc();
        let bytes = encode(self.serializer.as_ref(), request)?;
        self.state
            .cache
            .lock()
            .unwrap()
            .insert(key, bytes.clone());
        Ok(bytes)
    }
}
