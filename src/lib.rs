//! Raft RPC transport runtime.
//!
//! The crate provides the plumbing a Raft node needs to talk to its
//! peers over constrained networks:
//!
//! - a CoAP/DTLS RPC engine ([`client`], [`server`], [`msg`], [`block`],
//!   [`dedup`], [`session`], [`dtls`]) with confirmable delivery,
//!   duplicate suppression, block-wise transfer, session pooling, and
//!   multicast fan-out with response aggregation;
//! - a deterministic in-process [`simulator`] that stands in for the OS
//!   UDP stack in tests, with per-edge latency and drop probability;
//! - a [`retry`] engine with per-operation exponential backoff
//!   policies;
//! - an [`availability`] tracker computing quorums over the nodes that
//!   are actually responding;
//! - a fixed-block memory [`pool`] with live metrics and leak
//!   detection.
//!
//! The Raft state machine itself is external; it programs against
//! [`transport::RaftTransport`] and never sees the wire.

pub mod availability;
pub mod block;
pub mod cache;
pub mod client;
pub mod config;
pub mod dedup;
pub mod dtls;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod msg;
pub mod net;
pub mod pool;
pub mod retry;
pub mod rpc;
pub mod serializer;
pub mod server;
pub mod session;
pub mod simulator;
pub mod transport;

pub use client::CoapClient;
pub use config::{CoapClientConfig, CoapServerConfig, MemoryPoolConfig};
pub use errors::{Result, TransportError};
pub use retry::{RetryEngine, RetryPolicy};
pub use server::CoapServer;
pub use simulator::{NetworkEdge, NetworkSimulator};
pub use transport::RaftTransport;
