//! Deterministic in-process network simulator.
//!
//! A directed graph of named nodes; each edge carries a latency and a
//! reliability in `[0, 1]`. A started simulator owns a scheduler task
//! that delivers in-flight datagrams once their edge latency elapses.
//! Datagrams, connections, and listeners are all single-hop: no edge
//! means no delivery, ever.
//!
//! The simulator doubles as a [`DatagramTransport`] provider (via
//! [`SimSocket`]) so the CoAP client and server run over it unchanged.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::errors::{Result, TransportError};
use crate::net::{Datagram, DatagramTransport, Endpoint};

/// First port handed out by the ephemeral allocator.
const EPHEMERAL_PORT_FLOOR: u16 = 49152;

/// A directed edge's transmission characteristics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkEdge {
    pub latency: Duration,
    /// Probability a datagram on this edge is actually delivered.
    pub reliability: f64,
}

impl NetworkEdge {
    pub fn new(latency: Duration, reliability: f64) -> Self {
        NetworkEdge {
            latency,
            reliability,
        }
    }
}

/// One datagram in flight between two endpoints.
#[derive(Debug, Clone)]
pub struct NetworkMessage {
    pub source: Endpoint,
    pub dest: Endpoint,
    pub payload: Vec<u8>,
}

/// Inbound connection handshake delivered to a listener.
struct ConnectRequest {
    remote: Endpoint,
    /// Sender half the server uses to reach the client.
    to_client: mpsc::UnboundedSender<Vec<u8>>,
    /// Receiver half carrying client-to-server bytes.
    from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Fired by `accept` to complete the client's `connect`.
    accepted: oneshot::Sender<()>,
}

#[derive(Default, Debug)]
struct NodeState {
    /// Datagram receivers keyed by bound port.
    ports: HashMap<u16, mpsc::UnboundedSender<Datagram>>,
    /// Listener queues keyed by listening port.
    listeners: HashMap<u16, mpsc::UnboundedSender<ConnectRequest>>,
    /// Every port ever in use on this node; the ephemeral allocator
    /// never hands one of these out again while it stays live.
    used_ports: HashSet<u16>,
    next_ephemeral: u16,
}

impl NodeState {
    fn allocate_ephemeral(&mut self) -> Result<u16> {
        if self.next_ephemeral < EPHEMERAL_PORT_FLOOR {
            self.next_ephemeral = EPHEMERAL_PORT_FLOOR;
        }
        for _ in 0..=(u16::MAX - EPHEMERAL_PORT_FLOOR) {
            let candidate = self.next_ephemeral;
            self.next_ephemeral = if candidate == u16::MAX {
                EPHEMERAL_PORT_FLOOR
            } else {
                candidate + 1
            };
            if !self.used_ports.contains(&candidate) {
                self.used_ports.insert(candidate);
                return Ok(candidate);
            }
        }
        Err(TransportError::ResourceExhausted(
            "ephemeral port range exhausted".into(),
        ))
    }
}

#[derive(Debug)]
struct SimState {
    nodes: HashMap<String, NodeState>,
    edges: HashMap<(String, String), NetworkEdge>,
    /// Multicast membership: group host -> set of (node, port).
    groups: HashMap<String, HashSet<(String, u16)>>,
    rng: StdRng,
}

/// An entry in the scheduler's delivery heap, ordered by deadline then
/// submission order so equal-latency sends keep their causal order.
struct InFlight {
    deliver_at: Instant,
    seq: u64,
    msg: NetworkMessage,
}

impl PartialEq for InFlight {
    fn eq(&self, other: &Self) -> bool {
        self.deliver_at == other.deliver_at && self.seq == other.seq
    }
}
impl Eq for InFlight {}
impl PartialOrd for InFlight {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for InFlight {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the earliest deadline
        // (lowest seq on ties) surfaces first.
        other
            .deliver_at
            .cmp(&self.deliver_at)
            .then(other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct SimInner {
    state: Mutex<SimState>,
    scheduler: Mutex<Option<mpsc::UnboundedSender<InFlight>>>,
    running: AtomicBool,
    seq: AtomicU64,
}

/// The simulator handle. Cheap to clone; all clones share the graph.
#[derive(Clone, Debug)]
pub struct NetworkSimulator {
    inner: Arc<SimInner>,
}

impl NetworkSimulator {
    /// Build a simulator seeded for reproducible drop decisions.
    pub fn new(seed: u64) -> Self {
        NetworkSimulator {
            inner: Arc::new(SimInner {
                state: Mutex::new(SimState {
                    nodes: HashMap::new(),
                    edges: HashMap::new(),
                    groups: HashMap::new(),
                    rng: StdRng::seed_from_u64(seed),
                }),
                scheduler: Mutex::new(None),
                running: AtomicBool::new(false),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Start the delivery scheduler. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.scheduler.lock().unwrap() = Some(tx);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(scheduler_loop(inner, rx));
        debug!("Simulator scheduler started");
    }

    /// Stop the scheduler. In-flight messages are discarded. Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender ends the scheduler loop.
        *self.inner.scheduler.lock().unwrap() = None;
        debug!("Simulator scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn add_node(&self, name: impl Into<String>) {
        let mut state = self.inner.state.lock().unwrap();
        state.nodes.entry(name.into()).or_default();
    }

    /// Add (or replace) the directed edge `src -> dst`. Both nodes are
    /// created if absent.
    pub fn add_edge(&self, src: impl Into<String>, dst: impl Into<String>, edge: NetworkEdge) {
        let (src, dst) = (src.into(), dst.into());
        let mut state = self.inner.state.lock().unwrap();
        state.nodes.entry(src.clone()).or_default();
        state.nodes.entry(dst.clone()).or_default();
        state.edges.insert((src, dst), edge);
    }

    /// Exact configured characteristics of `src -> dst`, if the edge exists.
    pub fn edge(&self, src: &str, dst: &str) -> Option<NetworkEdge> {
        let state = self.inner.state.lock().unwrap();
        state.edges.get(&(src.to_string(), dst.to_string())).copied()
    }

    pub fn remove_edge(&self, src: &str, dst: &str) {
        let mut state = self.inner.state.lock().unwrap();
        state.edges.remove(&(src.to_string(), dst.to_string()));
    }

    /// Bind a datagram socket on `node`. `port` 0 requests a fresh
    /// ephemeral port; binding an in-use port fails.
    pub fn bind(&self, node: &str, port: u16) -> Result<SimSocket> {
        let mut state = self.inner.state.lock().unwrap();
        let node_state = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| TransportError::Network(format!("unknown node {node}")))?;

        let port = if port == 0 {
            node_state.allocate_ephemeral()?
        } else {
            if node_state.used_ports.contains(&port) {
                return Err(TransportError::Network(format!(
                    "port {port} already in use on {node}"
                )));
            }
            node_state.used_ports.insert(port);
            port
        };

        let (tx, rx) = mpsc::unbounded_channel();
        node_state.ports.insert(port, tx);

        Ok(SimSocket {
            sim: self.clone(),
            local: Endpoint::new(node, port),
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Submit one datagram.
    ///
    /// `Ok(false)` means the datagram was not accepted for
    /// transmission: there is no edge from source to destination, or
    /// the edge's reliability draw came up unlucky and the datagram was
    /// dropped silently. Over many sends the fraction of `Ok(true)`
    /// approaches the edge reliability. `Ok(true)` still does not
    /// guarantee arrival: the destination port must be bound when the
    /// latency elapses. The `timeout` bounds scheduler submission,
    /// which only blocks when the simulator is not running.
    pub async fn send(&self, msg: NetworkMessage, _timeout: Duration) -> Result<bool> {
        if !self.is_running() {
            return Err(TransportError::Network("simulator not running".into()));
        }

        let targets = {
            let mut state = self.inner.state.lock().unwrap();

            if let Some(members) = state.groups.get(&msg.dest.host).cloned() {
                // Multicast fan-out: one copy per member reachable over
                // an existing edge from the source node.
                let mut targets = Vec::new();
                for (node, port) in members {
                    if port != msg.dest.port {
                        continue;
                    }
                    let key = (msg.source.host.clone(), node.clone());
                    if let Some(edge) = state.edges.get(&key).copied() {
                        let deliver = state.rng.gen::<f64>() <= edge.reliability;
                        if deliver {
                            targets.push((Endpoint::new(node, port), edge.latency));
                        }
                    }
                }
                targets
            } else {
                let key = (msg.source.host.clone(), msg.dest.host.clone());
                let edge = match state.edges.get(&key).copied() {
                    Some(edge) => edge,
                    None => {
                        trace!(src = %msg.source, dst = %msg.dest, "No edge, send refused");
                        return Ok(false);
                    }
                };
                if state.rng.gen::<f64>() > edge.reliability {
                    trace!(src = %msg.source, dst = %msg.dest, "Unlucky draw, datagram dropped");
                    return Ok(false);
                }
                vec![(msg.dest.clone(), edge.latency)]
            }
        };

        let scheduler = self.inner.scheduler.lock().unwrap().clone();
        let scheduler =
            scheduler.ok_or_else(|| TransportError::Network("simulator not running".into()))?;

        for (dest, latency) in targets {
            let in_flight = InFlight {
                deliver_at: Instant::now() + latency,
                seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
                msg: NetworkMessage {
                    source: msg.source.clone(),
                    dest,
                    payload: msg.payload.clone(),
                },
            };
            if scheduler.send(in_flight).is_err() {
                return Err(TransportError::Network("simulator stopped".into()));
            }
        }
        Ok(true)
    }

    /// Register `(node, port)` as a member of the multicast group.
    pub fn join_group(&self, group: &str, node: &str, port: u16) {
        let mut state = self.inner.state.lock().unwrap();
        state
            .groups
            .entry(group.to_string())
            .or_default()
            .insert((node.to_string(), port));
    }

    /// Open a listener on `node:port` (port 0 for ephemeral).
    pub fn listen(&self, node: &str, port: u16) -> Result<SimListener> {
        let mut state = self.inner.state.lock().unwrap();
        let node_state = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| TransportError::Network(format!("unknown node {node}")))?;

        let port = if port == 0 {
            node_state.allocate_ephemeral()?
        } else {
            if node_state.used_ports.contains(&port) {
                return Err(TransportError::Network(format!(
                    "port {port} already in use on {node}"
                )));
            }
            node_state.used_ports.insert(port);
            port
        };

        let (tx, rx) = mpsc::unbounded_channel();
        node_state.listeners.insert(port, tx);

        Ok(SimListener {
            local: Endpoint::new(node, port),
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Connect from `src_node` (ephemeral source port) to `dst`.
    ///
    /// Completes when the peer's `accept` picks the handshake up, or
    /// fails with a timeout. Requires an edge `src -> dst`; the
    /// handshake is subject to its latency but not its drop rate.
    pub async fn connect(
        &self,
        src_node: &str,
        dst: &Endpoint,
        timeout: Duration,
    ) -> Result<SimConnection> {
        let (local, listener_tx, latency) = {
            let mut state = self.inner.state.lock().unwrap();

            let key = (src_node.to_string(), dst.host.clone());
            let edge = state
                .edges
                .get(&key)
                .copied()
                .ok_or_else(|| TransportError::Network(format!("no route {src_node} -> {}", dst.host)))?;

            let src_state = state
                .nodes
                .get_mut(src_node)
                .ok_or_else(|| TransportError::Network(format!("unknown node {src_node}")))?;
            let src_port = src_state.allocate_ephemeral()?;

            let listener_tx = state
                .nodes
                .get(&dst.host)
                .and_then(|n| n.listeners.get(&dst.port))
                .cloned()
                .ok_or_else(|| {
                    TransportError::Network(format!("connection refused by {dst}"))
                })?;

            (Endpoint::new(src_node, src_port), listener_tx, edge.latency)
        };

        let (client_to_server_tx, client_to_server_rx) = mpsc::unbounded_channel();
        let (server_to_client_tx, server_to_client_rx) = mpsc::unbounded_channel();
        let (accepted_tx, accepted_rx) = oneshot::channel();

        let request = ConnectRequest {
            remote: local.clone(),
            to_client: server_to_client_tx,
            from_client: client_to_server_rx,
            accepted: accepted_tx,
        };

        // The handshake crosses the edge: apply its latency before the
        // listener sees the request.
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            if listener_tx.send(request).is_err() {
                warn!("Listener closed before handshake arrived");
            }
        });

        match tokio::time::timeout(timeout, accepted_rx).await {
            Ok(Ok(())) => Ok(SimConnection {
                local,
                remote: dst.clone(),
                tx: client_to_server_tx,
                rx: tokio::sync::Mutex::new(server_to_client_rx),
            }),
            Ok(Err(_)) => Err(TransportError::Network("listener dropped handshake".into())),
            Err(_) => Err(TransportError::timeout("connect", timeout)),
        }
    }
}

async fn scheduler_loop(inner: Arc<SimInner>, mut rx: mpsc::UnboundedReceiver<InFlight>) {
    let mut heap: BinaryHeap<InFlight> = BinaryHeap::new();

    loop {
        let next_deadline = heap.peek().map(|f| f.deliver_at);

        tokio::select! {
            submitted = rx.recv() => {
                match submitted {
                    Some(in_flight) => heap.push(in_flight),
                    // Sender dropped: simulator stopped.
                    None => break,
                }
            }
            _ = async {
                match next_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Some(due) = heap.pop() {
                    deliver(&inner, due.msg);
                }
            }
        }
    }
    debug!(undelivered = heap.len(), "Scheduler loop exited");
}

fn deliver(inner: &Arc<SimInner>, msg: NetworkMessage) {
    let state = inner.state.lock().unwrap();
    let Some(node) = state.nodes.get(&msg.dest.host) else {
        return;
    };
    let Some(port_tx) = node.ports.get(&msg.dest.port) else {
        trace!(dest = %msg.dest, "No receiver bound, datagram dropped");
        return;
    };
    let datagram = Datagram {
        source: msg.source,
        payload: msg.payload,
    };
    // A closed receiver is equivalent to an unbound port.
    let _ = port_tx.send(datagram);
}

/// A datagram socket bound inside the simulator.
#[derive(Debug)]
pub struct SimSocket {
    sim: NetworkSimulator,
    local: Endpoint,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl SimSocket {
    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    /// Receive the next datagram, bounded by `timeout`.
    pub async fn receive(&self, timeout: Duration) -> Result<Datagram> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(datagram)) => Ok(datagram),
            Ok(None) => Err(TransportError::Network("socket closed".into())),
            Err(_) => Err(TransportError::timeout("receive", timeout)),
        }
    }
}

#[async_trait]
impl DatagramTransport for SimSocket {
    async fn send_to(&self, payload: &[u8], dest: &Endpoint, timeout: Duration) -> Result<()> {
        // Datagram semantics: acceptance is success, delivery is not
        // guaranteed. A missing edge behaves like a silent black hole.
        self.sim
            .send(
                NetworkMessage {
                    source: self.local.clone(),
                    dest: dest.clone(),
                    payload: payload.to_vec(),
                },
                timeout,
            )
            .await
            .map(|_| ())
    }

    async fn recv_from(&self, timeout: Duration) -> Result<Datagram> {
        self.receive(timeout).await
    }

    fn local_endpoint(&self) -> Endpoint {
        self.local.clone()
    }

    async fn join_multicast(&self, group: &Endpoint) -> Result<()> {
        self.sim
            .join_group(&group.host, &self.local.host, self.local.port);
        Ok(())
    }
}

/// A listening socket holding a pending-accept queue.
pub struct SimListener {
    local: Endpoint,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ConnectRequest>>,
}

impl SimListener {
    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    /// Accept the next pending connection, bounded by `timeout`.
    ///
    /// The accepted connection's `(local, remote)` mirrors the
    /// connector's `(remote, local)` exactly.
    pub async fn accept(&self, timeout: Duration) -> Result<SimConnection> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(request)) => {
                let _ = request.accepted.send(());
                Ok(SimConnection {
                    local: self.local.clone(),
                    remote: request.remote,
                    tx: request.to_client,
                    rx: tokio::sync::Mutex::new(request.from_client),
                })
            }
            Ok(None) => Err(TransportError::Network("listener closed".into())),
            Err(_) => Err(TransportError::timeout("accept", timeout)),
        }
    }
}

/// A bidirectional byte stream between two simulator endpoints.
#[derive(Debug)]
pub struct SimConnection {
    local: Endpoint,
    remote: Endpoint,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl SimConnection {
    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    pub fn remote(&self) -> &Endpoint {
        &self.remote
    }

    /// Write one frame, bounded by `timeout`.
    pub async fn write(&self, data: &[u8], _timeout: Duration) -> Result<()> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| TransportError::Network("peer closed connection".into()))
    }

    /// Read the next frame, bounded by `timeout`.
    pub async fn read(&self, timeout: Duration) -> Result<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(data)) => Ok(data),
            Ok(None) => Err(TransportError::Network("peer closed connection".into())),
            Err(_) => Err(TransportError::timeout("read", timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_query_returns_exact_values() {
        let sim = NetworkSimulator::new(7);
        let edge = NetworkEdge::new(Duration::from_millis(42), 0.85);
        sim.add_edge("a", "b", edge);
        assert_eq!(sim.edge("a", "b"), Some(edge));
        // Directed: the reverse edge does not exist.
        assert_eq!(sim.edge("b", "a"), None);
    }

    #[test]
    fn ephemeral_allocator_never_reuses_live_ports() {
        let sim = NetworkSimulator::new(7);
        sim.add_node("a");
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let socket = sim.bind("a", 0).unwrap();
            let port = socket.local().port;
            assert!(port >= EPHEMERAL_PORT_FLOOR);
            assert!(seen.insert(port), "port {port} handed out twice");
        }
    }

    #[test]
    fn rebinding_a_port_fails() {
        let sim = NetworkSimulator::new(7);
        sim.add_node("a");
        let _first = sim.bind("a", 5683).unwrap();
        assert!(sim.bind("a", 5683).is_err());
    }
}
