//! Logging initialization for embedding processes and tests.
//!
//! The library itself only emits `tracing` events; installing a
//! subscriber is the embedder's choice. These helpers cover the two
//! common setups. Both are idempotent so test binaries can call them
//! from every test.

use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Human-readable output, filtered by `RUST_LOG` (default `info`).
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .try_init();
}

/// JSON output for log pipelines, filtered by `RUST_LOG`.
pub fn init_json() {
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter())
        .try_init();
}
