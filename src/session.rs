//! Transport session pooling.
//!
//! A [`Session`] is the peer association an RPC rides on: a completed
//! DTLS handshake when security is enabled, otherwise a nominal UDP flow
//! identity. Handshakes are expensive, so sessions are pooled per
//! endpoint and reused in LIFO order (the most recently returned session
//! is the least likely to have gone stale).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::errors::{Result, TransportError};
use crate::net::Endpoint;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One established peer association.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: u64,
    pub endpoint: Endpoint,
    pub secured: bool,
    pub created_at: Instant,
    pub last_used: Instant,
}

impl Session {
    pub fn new(endpoint: Endpoint, secured: bool) -> Self {
        let now = Instant::now();
        Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            secured,
            created_at: now,
            last_used: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

/// Pool statistics for monitoring session reuse.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionPoolStats {
    pub created: u64,
    pub reused: u64,
    pub closed: u64,
    pub refused: u64,
}

impl SessionPoolStats {
    /// Fraction of acquisitions served from the pool, as a percentage.
    pub fn reuse_rate(&self) -> f64 {
        let total = self.created + self.reused;
        if total == 0 {
            return 0.0;
        }
        (self.reused as f64 / total as f64) * 100.0
    }
}

/// Per-endpoint bounded LIFO pool of idle sessions, with a global cap
/// across endpoints.
#[derive(Debug)]
pub struct SessionPool {
    pools: HashMap<Endpoint, Vec<Session>>,
    /// Cap on idle + outstanding sessions per endpoint.
    max_per_endpoint: usize,
    /// Cap on sessions alive across every endpoint.
    max_total: usize,
    /// Sessions idle past this are swept.
    idle_timeout: Duration,
    /// Outstanding (checked-out) session count per endpoint.
    outstanding: HashMap<Endpoint, usize>,
    stats: SessionPoolStats,
}

impl SessionPool {
    pub fn new(max_per_endpoint: usize, max_total: usize, idle_timeout: Duration) -> Self {
        Self {
            pools: HashMap::new(),
            max_per_endpoint,
            max_total,
            idle_timeout,
            outstanding: HashMap::new(),
            stats: SessionPoolStats::default(),
        }
    }

    fn total_alive(&self) -> usize {
        self.pools.values().map(|p| p.len()).sum::<usize>()
            + self.outstanding.values().sum::<usize>()
    }

    /// Pop an idle session for `endpoint`, or create one while under
    /// both caps. Refuses with `ResourceExhausted` when the endpoint
    /// already has `max_per_endpoint` sessions alive, or the pool as a
    /// whole is at `max_total`.
    pub fn get_or_create(&mut self, endpoint: &Endpoint, secured: bool) -> Result<Session> {
        self.sweep_idle();

        if let Some(mut session) = self.pools.get_mut(endpoint).and_then(|p| p.pop()) {
            session.touch();
            self.stats.reused += 1;
            *self.outstanding.entry(endpoint.clone()).or_insert(0) += 1;
            debug!(endpoint = %endpoint, session_id = session.id, "Session reused from pool");
            return Ok(session);
        }

        let idle = self.pools.get(endpoint).map(|p| p.len()).unwrap_or(0);
        let outstanding = self.outstanding.get(endpoint).copied().unwrap_or(0);
        if idle + outstanding >= self.max_per_endpoint {
            self.stats.refused += 1;
            return Err(TransportError::ResourceExhausted(format!(
                "session pool for {endpoint} at cap {}",
                self.max_per_endpoint
            )));
        }
        if self.total_alive() >= self.max_total {
            self.stats.refused += 1;
            return Err(TransportError::ResourceExhausted(format!(
                "session pool at global cap {}",
                self.max_total
            )));
        }

        let session = Session::new(endpoint.clone(), secured);
        self.stats.created += 1;
        *self.outstanding.entry(endpoint.clone()).or_insert(0) += 1;
        debug!(endpoint = %endpoint, session_id = session.id, "Session created");
        Ok(session)
    }

    /// Return a session to its endpoint's pool; closes it instead when
    /// the pool is already at cap.
    pub fn return_session(&mut self, mut session: Session) {
        session.touch();
        let endpoint = session.endpoint.clone();

        if let Some(count) = self.outstanding.get_mut(&endpoint) {
            *count = count.saturating_sub(1);
        }

        let pool = self.pools.entry(endpoint.clone()).or_default();
        if pool.len() < self.max_per_endpoint {
            pool.push(session);
        } else {
            self.stats.closed += 1;
            debug!(endpoint = %endpoint, "Pool at cap, session closed instead of pooled");
        }
    }

    /// Drop a session without pooling it (failed request paths).
    pub fn discard(&mut self, session: Session) {
        if let Some(count) = self.outstanding.get_mut(&session.endpoint) {
            *count = count.saturating_sub(1);
        }
        self.stats.closed += 1;
    }

    /// Sweep idle sessions past the timeout, across all endpoints.
    pub fn sweep_idle(&mut self) {
        let idle_timeout = self.idle_timeout;
        let mut closed = 0u64;
        for pool in self.pools.values_mut() {
            let before = pool.len();
            pool.retain(|s| s.idle_for() < idle_timeout);
            closed += (before - pool.len()) as u64;
        }
        self.pools.retain(|_, p| !p.is_empty());
        if closed > 0 {
            self.stats.closed += closed;
            debug!(closed, "Swept idle sessions");
        }
    }

    pub fn idle_count(&self, endpoint: &Endpoint) -> usize {
        self.pools.get(endpoint).map(|p| p.len()).unwrap_or(0)
    }

    pub fn total_idle(&self) -> usize {
        self.pools.values().map(|p| p.len()).sum()
    }

    pub fn stats(&self) -> SessionPoolStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("10.0.0.1", 5683)
    }

    #[test]
    fn create_then_reuse_lifo() {
        let mut pool = SessionPool::new(4, 64, Duration::from_secs(60));
        let a = pool.get_or_create(&endpoint(), false).unwrap();
        let b = pool.get_or_create(&endpoint(), false).unwrap();
        assert_ne!(a.id, b.id);

        pool.return_session(a);
        pool.return_session(b.clone());

        // LIFO: most recently returned comes back first.
        let next = pool.get_or_create(&endpoint(), false).unwrap();
        assert_eq!(next.id, b.id);
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn cap_refuses_when_all_outstanding() {
        let mut pool = SessionPool::new(2, 64, Duration::from_secs(60));
        let _a = pool.get_or_create(&endpoint(), false).unwrap();
        let _b = pool.get_or_create(&endpoint(), false).unwrap();
        let err = pool.get_or_create(&endpoint(), false).unwrap_err();
        assert_eq!(err.kind_label(), "resource_exhausted");
        assert_eq!(pool.stats().refused, 1);
    }

    #[test]
    fn release_frees_capacity() {
        let mut pool = SessionPool::new(1, 64, Duration::from_secs(60));
        let a = pool.get_or_create(&endpoint(), false).unwrap();
        assert!(pool.get_or_create(&endpoint(), false).is_err());
        pool.return_session(a);
        assert!(pool.get_or_create(&endpoint(), false).is_ok());
    }

    #[test]
    fn idle_sessions_swept() {
        let mut pool = SessionPool::new(4, 64, Duration::from_millis(5));
        let a = pool.get_or_create(&endpoint(), false).unwrap();
        pool.return_session(a);
        assert_eq!(pool.total_idle(), 1);
        std::thread::sleep(Duration::from_millis(10));
        pool.sweep_idle();
        assert_eq!(pool.total_idle(), 0);
    }

    #[test]
    fn distinct_endpoints_have_distinct_pools() {
        let mut pool = SessionPool::new(1, 64, Duration::from_secs(60));
        let other = Endpoint::new("10.0.0.2", 5683);
        let _a = pool.get_or_create(&endpoint(), false).unwrap();
        assert!(pool.get_or_create(&other, true).is_ok());
    }

    #[test]
    fn global_cap_spans_endpoints() {
        let mut pool = SessionPool::new(4, 2, Duration::from_secs(60));
        let _a = pool
            .get_or_create(&Endpoint::new("10.0.0.1", 5683), false)
            .unwrap();
        let _b = pool
            .get_or_create(&Endpoint::new("10.0.0.2", 5683), false)
            .unwrap();
        // A third endpoint is under its per-endpoint cap but over the
        // global one.
        let err = pool
            .get_or_create(&Endpoint::new("10.0.0.3", 5683), false)
            .unwrap_err();
        assert_eq!(err.kind_label(), "resource_exhausted");
    }
}
