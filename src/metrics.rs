//! Prometheus metrics for the transport runtime.
//!
//! Metric statics follow the same shape as any other long-running
//! service: created once via `lazy_static`, registered explicitly into a
//! `Registry` by the embedding process, and updated from the hot paths
//! without further coordination.

use std::env;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::error;

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "raft_transport".to_string());

    // === RPC client metrics ===

    pub static ref RPC_REQUESTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("rpc_requests_total", "RPC requests sent, by RPC kind and outcome")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["rpc", "outcome"] // outcome: success, error
        ).unwrap();

    pub static ref RPC_ERRORS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("rpc_errors_total", "RPC failures by error kind")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["kind"]
        ).unwrap();

    pub static ref CONCURRENT_REQUESTS: IntGauge =
        IntGauge::with_opts(
            Opts::new("concurrent_requests", "RPC requests currently in flight")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref RETRANSMISSIONS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("retransmissions_total", "Confirmable messages retransmitted")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref DUPLICATES_SUPPRESSED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("duplicates_suppressed_total", "Messages dropped by the dedup window")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref SERIALIZATION_CACHE_HITS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("serialization_cache_hits_total", "Serialization cache hits")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref SERIALIZATION_CACHE_MISSES_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("serialization_cache_misses_total", "Serialization cache misses")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref SESSIONS_ACTIVE: IntGauge =
        IntGauge::with_opts(
            Opts::new("sessions_active", "Sessions currently checked out of pools")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref HANDSHAKE_DURATION_SECONDS: Histogram =
        Histogram::with_opts(
            HistogramOpts::new(
                "handshake_duration_seconds",
                "DTLS handshake latencies in seconds"
            ).namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref MULTICAST_REQUESTS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("multicast_requests_total", "Multicast fan-outs issued")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref MULTICAST_RESPONSES_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("multicast_responses_total", "Unique multicast responses collected")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref NETWORK_PARTITIONS_DETECTED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("network_partitions_detected_total", "Endpoints marked partitioned")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    // === CoAP server metrics ===

    pub static ref SERVER_REQUESTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("server_requests_total", "Requests handled, by RPC kind and outcome")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["rpc", "outcome"]
        ).unwrap();

    pub static ref SERVER_REJECTIONS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("server_rejections_total", "Requests rejected before dispatch, by reason")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["reason"]
        ).unwrap();

    pub static ref BLOCK_TRANSFERS_COMPLETED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("block_transfers_completed_total", "Block transfers fully reassembled")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    // === Retry engine metrics ===

    pub static ref RETRY_ATTEMPTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("retry_attempts_total", "Operation attempts made by the retry engine")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["operation"]
        ).unwrap();

    // === Memory pool metrics ===

    pub static ref MEMORY_POOL_ALLOCATED_BYTES: IntGauge =
        IntGauge::with_opts(
            Opts::new("memory_pool_allocated_bytes", "Bytes currently allocated from the pool")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref MEMORY_POOL_ALLOCATIONS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("memory_pool_allocations_total", "Pool blocks handed out")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref MEMORY_POOL_DEALLOCATIONS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("memory_pool_deallocations_total", "Pool blocks returned")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Register every transport metric into `registry`.
pub fn register_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(RPC_REQUESTS_TOTAL.clone()),
        Box::new(RPC_ERRORS_TOTAL.clone()),
        Box::new(CONCURRENT_REQUESTS.clone()),
        Box::new(RETRANSMISSIONS_TOTAL.clone()),
        Box::new(DUPLICATES_SUPPRESSED_TOTAL.clone()),
        Box::new(SERIALIZATION_CACHE_HITS_TOTAL.clone()),
        Box::new(SERIALIZATION_CACHE_MISSES_TOTAL.clone()),
        Box::new(SESSIONS_ACTIVE.clone()),
        Box::new(HANDSHAKE_DURATION_SECONDS.clone()),
        Box::new(MULTICAST_REQUESTS_TOTAL.clone()),
        Box::new(MULTICAST_RESPONSES_TOTAL.clone()),
        Box::new(NETWORK_PARTITIONS_DETECTED_TOTAL.clone()),
        Box::new(SERVER_REQUESTS_TOTAL.clone()),
        Box::new(SERVER_REJECTIONS_TOTAL.clone()),
        Box::new(BLOCK_TRANSFERS_COMPLETED_TOTAL.clone()),
        Box::new(RETRY_ATTEMPTS_TOTAL.clone()),
        Box::new(MEMORY_POOL_ALLOCATED_BYTES.clone()),
        Box::new(MEMORY_POOL_ALLOCATIONS_TOTAL.clone()),
        Box::new(MEMORY_POOL_DEALLOCATIONS_TOTAL.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            // Double registration is harmless in tests; anything else is not.
            error!(error = %e, "Failed to register metric");
        }
    }
}

/// Encode `registry` in the Prometheus text exposition format.
pub fn gather_text(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
