//! Message-ID and token generation plus duplicate suppression.
//!
//! Both the client and the server keep a [`DuplicateDetector`]: a bounded
//! table of recently-seen message IDs, scoped per source endpoint since
//! message IDs are only unique within one peer's sequence. Records older
//! than the 5-minute window are evicted; for duplicate CONs the server
//! can replay the ACK it originally produced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

/// How long a received message ID is remembered.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(300);

/// Monotonic wire message-ID source (wraps at u16::MAX).
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    next: AtomicU16,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a given value; used by tests to pin the sequence.
    pub fn starting_at(value: u16) -> Self {
        Self {
            next: AtomicU16::new(value),
        }
    }

    pub fn next_id(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Monotonic token source. Tokens are the minimal big-endian encoding of
/// a per-client counter, at most 8 bytes per RFC 7252.
#[derive(Debug, Default)]
pub struct TokenGenerator {
    next: AtomicU64,
}

impl TokenGenerator {
    pub fn new() -> Self {
        // Token 0 would encode as an empty byte string; start at 1 so
        // every request carries a non-empty token.
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_token(&self) -> Vec<u8> {
        let value = self.next.fetch_add(1, Ordering::Relaxed);
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        bytes[skip.min(7)..].to_vec()
    }
}

/// A message ID seen recently, with the time it arrived.
#[derive(Debug, Clone)]
struct ReceivedRecord {
    received_at: Instant,
}

/// Duplicate-suppression table keyed by `(source, message_id)`.
#[derive(Debug)]
pub struct DuplicateDetector {
    window: Duration,
    records: HashMap<(String, u16), ReceivedRecord>,
    /// Serialized ACKs cached for duplicate CON replay.
    cached_acks: HashMap<(String, u16), Vec<u8>>,
    duplicates_seen: u64,
}

impl DuplicateDetector {
    pub fn new() -> Self {
        Self::with_window(DEDUP_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            records: HashMap::new(),
            cached_acks: HashMap::new(),
            duplicates_seen: 0,
        }
    }

    /// Record `message_id` from `source` if unseen within the window.
    ///
    /// Returns `true` when the message is a duplicate and must be
    /// suppressed. Expired records are treated as unseen.
    pub fn check_and_record(&mut self, source: &str, message_id: u16) -> bool {
        self.sweep_expired();
        let now = Instant::now();
        let key = (source.to_string(), message_id);
        match self.records.get(&key) {
            Some(record) if now.duration_since(record.received_at) < self.window => {
                self.duplicates_seen += 1;
                debug!(source, message_id, "Duplicate message suppressed");
                true
            }
            _ => {
                self.records.insert(key, ReceivedRecord { received_at: now });
                false
            }
        }
    }

    /// Store the wire-encoded ACK produced for `(source, message_id)`
    /// so a retransmitted CON receives the identical reply.
    pub fn cache_ack(&mut self, source: &str, message_id: u16, ack: Vec<u8>) {
        self.cached_acks
            .insert((source.to_string(), message_id), ack);
    }

    pub fn cached_ack(&self, source: &str, message_id: u16) -> Option<&[u8]> {
        self.cached_acks
            .get(&(source.to_string(), message_id))
            .map(|v| v.as_slice())
    }

    /// Drop records (and their cached ACKs) past the window.
    pub fn sweep_expired(&mut self) {
        let now = Instant::now();
        let window = self.window;
        let expired: Vec<(String, u16)> = self
            .records
            .iter()
            .filter(|(_, r)| now.duration_since(r.received_at) >= window)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.records.remove(&key);
            self.cached_acks.remove(&key);
        }
    }

    pub fn duplicates_seen(&self) -> u64 {
        self.duplicates_seen
    }

    pub fn tracked(&self) -> usize {
        self.records.len()
    }
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new()
    }
}
