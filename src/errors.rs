//! Error taxonomy for the transport runtime.
//!
//! Every failure surfaced to a caller's future is one of the kinds below.
//! Kinds map 1:1 onto stable metric labels so that dashboards can slice
//! failures by category without parsing error text.

use std::fmt;

use thiserror::Error;

/// Errors surfaced by the transport layer, the simulator, and the
/// supporting engines.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection refused, no route to the peer, socket-level failures.
    #[error("Network error: {0}")]
    Network(String),

    /// A bounded operation did not complete in time.
    #[error("Timeout during {operation} after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// Certificate, PSK, or URI-scheme violations.
    #[error("Security error: {0}")]
    Security(String),

    /// Wire-format violations: bad version bits, oversized tokens,
    /// all-zero / all-0xFF payloads, block sequencing errors.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Protocol-level conditions: duplicate suppressed, unknown token.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Encode or decode failure in the configured serializer.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Concurrent-slot saturation, session-pool full, memory-pool empty.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Missing endpoint mapping, invalid multicast address,
    /// contradictory DTLS settings.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl TransportError {
    /// Build a timeout error for a named operation.
    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        TransportError::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// True when the error is a timeout of any operation.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    /// True for failures the retry engine is allowed to absorb.
    ///
    /// Security, malformed, serialization, and configuration errors are
    /// deterministic: retrying them burns attempts without any chance of
    /// success.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Network(_)
                | TransportError::Timeout { .. }
                | TransportError::ResourceExhausted(_)
        )
    }

    /// Stable Prometheus label for this error kind.
    pub fn kind_label(&self) -> &'static str {
        match self {
            TransportError::Network(_) => "network",
            TransportError::Timeout { .. } => "timeout",
            TransportError::Security(_) => "security",
            TransportError::Malformed(_) => "malformed",
            TransportError::Protocol(_) => "protocol",
            TransportError::Serialization(_) => "serialization",
            TransportError::ResourceExhausted(_) => "resource_exhausted",
            TransportError::Configuration(_) => "configuration",
        }
    }

    /// All kind labels in a consistent order, for metric pre-registration.
    pub fn all_kind_labels() -> &'static [&'static str] {
        &[
            "network",
            "timeout",
            "security",
            "malformed",
            "protocol",
            "serialization",
            "resource_exhausted",
            "configuration",
        ]
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Where in the server ingress pipeline a request was rejected.
///
/// Recorded alongside the rejection counter so that a spike in 4.00
/// responses can be attributed to a concrete validation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    BadVersion,
    TokenTooLong,
    EmptyPayload,
    AllZeroPayload,
    AllOnesPayload,
    BlockSequence,
    DecodeFailure,
    Saturated,
}

impl RejectionReason {
    pub fn label(&self) -> &'static str {
        match self {
            RejectionReason::BadVersion => "bad_version",
            RejectionReason::TokenTooLong => "token_too_long",
            RejectionReason::EmptyPayload => "empty_payload",
            RejectionReason::AllZeroPayload => "all_zero_payload",
            RejectionReason::AllOnesPayload => "all_ones_payload",
            RejectionReason::BlockSequence => "block_sequence",
            RejectionReason::DecodeFailure => "decode_failure",
            RejectionReason::Saturated => "saturated",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
