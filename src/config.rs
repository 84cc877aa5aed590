//! Configuration surface for the CoAP transports and supporting engines.
//!
//! Configuration is programmatic: callers construct a config, chain
//! `with_*` builders for the fields they care about, and the constructors
//! run [`validate`](CoapClientConfig::validate) before any socket is
//! touched. Validation failures are typed so callers can distinguish a
//! bad multicast address from a contradictory DTLS setup.

use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;

/// Configuration validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("DTLS enabled but neither PSK nor certificate authentication is configured")]
    DtlsModeMissing,

    #[error("DTLS PSK and certificate authentication are mutually exclusive")]
    DtlsModeConflict,

    #[error("PSK identity exceeds 128 characters (got {0})")]
    PskIdentityTooLong(usize),

    #[error("PSK key length must be within 4..=64 bytes (got {0})")]
    PskKeyLength(usize),

    #[error("Certificate authentication requires both cert_file and key_file")]
    CertFilesIncomplete,

    #[error("Invalid multicast address '{0}': must be within 224.0.0.0-239.255.255.255")]
    InvalidMulticastAddress(String),

    #[error("Multicast port must be nonzero")]
    InvalidMulticastPort,

    #[error("DTLS min_version {min:?} exceeds max_version {max:?}")]
    TlsVersionRange { min: TlsVersion, max: TlsVersion },

    #[error("Field '{field}' must be nonzero")]
    ZeroField { field: &'static str },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

/// TLS/DTLS protocol versions the session layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls1_0,
    Tls1_1,
    Tls1_2,
    Tls1_3,
}

impl TlsVersion {
    /// Versions older than 1.2 are never acceptable for a handshake.
    pub fn meets_floor(&self) -> bool {
        *self >= TlsVersion::Tls1_2
    }
}

/// DTLS settings shared by client and server configurations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DtlsSettings {
    pub enable_dtls: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub ca_file: Option<String>,
    pub verify_peer_cert: bool,
    pub psk_identity: Option<String>,
    pub psk_key: Option<Vec<u8>>,
    /// Handshake deadline. Expiry tears the session down with a timeout error.
    pub handshake_timeout: Duration,
    pub min_version: Option<TlsVersion>,
    pub max_version: Option<TlsVersion>,
}

impl DtlsSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enable_dtls {
            return Ok(());
        }

        let has_psk = self.psk_identity.is_some() || self.psk_key.is_some();
        let has_cert = self.cert_file.is_some() || self.key_file.is_some();
        if has_psk && has_cert {
            return Err(ConfigError::DtlsModeConflict);
        }
        if !has_psk && !has_cert {
            return Err(ConfigError::DtlsModeMissing);
        }

        if has_psk {
            let identity = self.psk_identity.as_deref().unwrap_or("");
            if identity.len() > 128 {
                return Err(ConfigError::PskIdentityTooLong(identity.len()));
            }
            let key_len = self.psk_key.as_ref().map(|k| k.len()).unwrap_or(0);
            if !(4..=64).contains(&key_len) {
                return Err(ConfigError::PskKeyLength(key_len));
            }
        }

        if has_cert && (self.cert_file.is_none() || self.key_file.is_none()) {
            return Err(ConfigError::CertFilesIncomplete);
        }

        let min = self.min_version.unwrap_or(TlsVersion::Tls1_2);
        let max = self.max_version.unwrap_or(TlsVersion::Tls1_3);
        if min > max {
            return Err(ConfigError::TlsVersionRange { min, max });
        }

        Ok(())
    }
}

/// Validate a dotted-quad multicast group address.
///
/// The full 224.0.0.0/4 block is admitted, including the
/// administratively-scoped 239/8 range.
pub fn validate_multicast_address(addr: &str) -> Result<Ipv4Addr, ConfigError> {
    let parsed: Ipv4Addr = addr
        .parse()
        .map_err(|_| ConfigError::InvalidMulticastAddress(addr.to_string()))?;
    if !(224..=239).contains(&parsed.octets()[0]) {
        return Err(ConfigError::InvalidMulticastAddress(addr.to_string()));
    }
    Ok(parsed)
}

/// CoAP client configuration.
#[derive(Debug, Clone)]
pub struct CoapClientConfig {
    pub dtls: DtlsSettings,

    /// Base ACK wait before the first retransmission of a CON message.
    pub ack_timeout: Duration,
    /// Multiplier applied to the ACK timeout per retransmission.
    pub ack_backoff_multiplier: f64,
    /// Retransmissions attempted before the request fails with a timeout.
    pub max_retransmit: u32,

    pub max_sessions: usize,
    pub enable_session_reuse: bool,
    pub enable_connection_pooling: bool,
    pub connection_pool_size: usize,
    /// Idle sessions older than this are swept from the pool.
    pub session_timeout: Duration,

    pub enable_block_transfer: bool,
    pub max_block_size: usize,

    pub enable_memory_optimization: bool,
    pub memory_pool_size: usize,

    pub enable_serialization_caching: bool,
    pub serialization_cache_size: usize,

    pub enable_concurrent_processing: bool,
    pub max_concurrent_requests: usize,

    pub enable_multicast: bool,
    pub multicast_address: String,
    pub multicast_port: u16,

    /// Consecutive failures to one endpoint spanning longer than this
    /// mark it partitioned; the first success clears the marker.
    pub partition_threshold: Duration,
}

impl Default for CoapClientConfig {
    fn default() -> Self {
        Self {
            dtls: DtlsSettings {
                handshake_timeout: Duration::from_secs(10),
                ..DtlsSettings::default()
            },
            ack_timeout: Duration::from_millis(2000),
            ack_backoff_multiplier: 2.0,
            max_retransmit: 4,
            max_sessions: 100,
            enable_session_reuse: true,
            enable_connection_pooling: true,
            connection_pool_size: 16,
            session_timeout: Duration::from_secs(300),
            enable_block_transfer: true,
            max_block_size: 1024,
            enable_memory_optimization: false,
            memory_pool_size: 1024 * 1024,
            enable_serialization_caching: true,
            serialization_cache_size: 128,
            enable_concurrent_processing: true,
            max_concurrent_requests: 100,
            enable_multicast: false,
            multicast_address: "224.0.1.187".to_string(),
            multicast_port: 5683,
            partition_threshold: Duration::from_secs(120),
        }
    }
}

impl CoapClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dtls(mut self, dtls: DtlsSettings) -> Self {
        self.dtls = dtls;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_max_retransmit(mut self, max: u32) -> Self {
        self.max_retransmit = max;
        self
    }

    pub fn with_block_transfer(mut self, enabled: bool, max_block_size: usize) -> Self {
        self.enable_block_transfer = enabled;
        self.max_block_size = max_block_size;
        self
    }

    pub fn with_connection_pool_size(mut self, size: usize) -> Self {
        self.connection_pool_size = size;
        self
    }

    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    pub fn with_multicast(mut self, address: impl Into<String>, port: u16) -> Self {
        self.enable_multicast = true;
        self.multicast_address = address.into();
        self.multicast_port = port;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dtls.validate()?;

        if self.max_block_size == 0 {
            return Err(ConfigError::ZeroField {
                field: "max_block_size",
            });
        }
        if self.enable_connection_pooling && self.connection_pool_size == 0 {
            return Err(ConfigError::ZeroField {
                field: "connection_pool_size",
            });
        }
        if self.enable_serialization_caching && self.serialization_cache_size == 0 {
            return Err(ConfigError::ZeroField {
                field: "serialization_cache_size",
            });
        }
        if self.enable_concurrent_processing && self.max_concurrent_requests == 0 {
            return Err(ConfigError::ZeroField {
                field: "max_concurrent_requests",
            });
        }
        if self.ack_backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "ack_backoff_multiplier",
                message: format!("must be >= 1.0, got {}", self.ack_backoff_multiplier),
            });
        }

        if self.enable_multicast {
            validate_multicast_address(&self.multicast_address)?;
            if self.multicast_port == 0 {
                return Err(ConfigError::InvalidMulticastPort);
            }
        }

        Ok(())
    }
}

/// CoAP server configuration: mirrors the client knobs that apply to the
/// ingress path, plus the server-only limits.
#[derive(Debug, Clone)]
pub struct CoapServerConfig {
    pub dtls: DtlsSettings,

    /// Concurrent request-processing slots. Requests beyond this are
    /// dropped with a diagnostic.
    pub max_concurrent_sessions: usize,
    /// Largest accepted request payload after reassembly.
    pub max_request_size: usize,

    pub enable_block_transfer: bool,
    pub max_block_size: usize,
    /// Reassembly states idle longer than this are swept.
    pub block_transfer_timeout: Duration,

    pub enable_memory_optimization: bool,
    pub memory_pool_size: usize,

    pub enable_multicast: bool,
    pub multicast_address: String,
    pub multicast_port: u16,
}

impl Default for CoapServerConfig {
    fn default() -> Self {
        Self {
            dtls: DtlsSettings {
                handshake_timeout: Duration::from_secs(10),
                ..DtlsSettings::default()
            },
            max_concurrent_sessions: 200,
            max_request_size: 1024 * 1024,
            enable_block_transfer: true,
            max_block_size: 1024,
            block_transfer_timeout: Duration::from_secs(120),
            enable_memory_optimization: false,
            memory_pool_size: 1024 * 1024,
            enable_multicast: false,
            multicast_address: "224.0.1.187".to_string(),
            multicast_port: 5683,
        }
    }
}

impl CoapServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dtls(mut self, dtls: DtlsSettings) -> Self {
        self.dtls = dtls;
        self
    }

    pub fn with_max_concurrent_sessions(mut self, max: usize) -> Self {
        self.max_concurrent_sessions = max;
        self
    }

    pub fn with_block_transfer(mut self, enabled: bool, max_block_size: usize) -> Self {
        self.enable_block_transfer = enabled;
        self.max_block_size = max_block_size;
        self
    }

    pub fn with_multicast(mut self, address: impl Into<String>, port: u16) -> Self {
        self.enable_multicast = true;
        self.multicast_address = address.into();
        self.multicast_port = port;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dtls.validate()?;

        if self.max_concurrent_sessions == 0 {
            return Err(ConfigError::ZeroField {
                field: "max_concurrent_sessions",
            });
        }
        if self.max_request_size == 0 {
            return Err(ConfigError::ZeroField {
                field: "max_request_size",
            });
        }
        if self.max_block_size == 0 {
            return Err(ConfigError::ZeroField {
                field: "max_block_size",
            });
        }

        if self.enable_multicast {
            validate_multicast_address(&self.multicast_address)?;
            if self.multicast_port == 0 {
                return Err(ConfigError::InvalidMulticastPort);
            }
        }

        Ok(())
    }
}

/// Memory pool configuration.
#[derive(Debug, Clone)]
pub struct MemoryPoolConfig {
    /// Total arena size in bytes.
    pub total_size: usize,
    /// Fixed block size; allocations larger than this fail.
    pub block_size: usize,
    /// Allocations older than this are reported by leak detection.
    pub leak_threshold: Duration,
    pub leak_detection_enabled: bool,
}

impl Default for MemoryPoolConfig {
    fn default() -> Self {
        Self {
            total_size: 1024 * 1024,
            block_size: 4096,
            leak_threshold: Duration::from_secs(60),
            leak_detection_enabled: true,
        }
    }
}

impl MemoryPoolConfig {
    pub fn new(total_size: usize, block_size: usize) -> Self {
        Self {
            total_size,
            block_size,
            ..Self::default()
        }
    }

    pub fn with_leak_threshold(mut self, threshold: Duration) -> Self {
        self.leak_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::ZeroField { field: "block_size" });
        }
        if self.total_size == 0 {
            return Err(ConfigError::ZeroField { field: "total_size" });
        }
        if self.total_size % self.block_size != 0 {
            return Err(ConfigError::InvalidValue {
                field: "total_size",
                message: format!(
                    "{} is not a multiple of block_size {}",
                    self.total_size, self.block_size
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_client_config_is_valid() {
        CoapClientConfig::default().validate().unwrap();
    }

    #[test]
    fn default_server_config_is_valid() {
        CoapServerConfig::default().validate().unwrap();
    }

    #[test]
    fn dtls_requires_exactly_one_auth_mode() {
        let mut dtls = DtlsSettings {
            enable_dtls: true,
            ..DtlsSettings::default()
        };
        assert_eq!(dtls.validate(), Err(ConfigError::DtlsModeMissing));

        dtls.psk_identity = Some("client-1".into());
        dtls.psk_key = Some(vec![1, 2, 3, 4]);
        dtls.cert_file = Some("/tmp/cert.pem".into());
        assert_eq!(dtls.validate(), Err(ConfigError::DtlsModeConflict));
    }

    #[test]
    fn psk_bounds_enforced() {
        let mut dtls = DtlsSettings {
            enable_dtls: true,
            psk_identity: Some("x".repeat(129)),
            psk_key: Some(vec![0; 16]),
            ..DtlsSettings::default()
        };
        assert_eq!(dtls.validate(), Err(ConfigError::PskIdentityTooLong(129)));

        dtls.psk_identity = Some("ok".into());
        dtls.psk_key = Some(vec![0; 3]);
        assert_eq!(dtls.validate(), Err(ConfigError::PskKeyLength(3)));

        dtls.psk_key = Some(vec![0; 65]);
        assert_eq!(dtls.validate(), Err(ConfigError::PskKeyLength(65)));

        dtls.psk_key = Some(vec![0; 64]);
        assert!(dtls.validate().is_ok());
    }

    #[test]
    fn cert_mode_requires_both_files() {
        let dtls = DtlsSettings {
            enable_dtls: true,
            cert_file: Some("/tmp/cert.pem".into()),
            ..DtlsSettings::default()
        };
        assert_eq!(dtls.validate(), Err(ConfigError::CertFilesIncomplete));
    }

    #[test]
    fn tls_version_range_checked() {
        let dtls = DtlsSettings {
            enable_dtls: true,
            psk_identity: Some("id".into()),
            psk_key: Some(vec![0; 8]),
            min_version: Some(TlsVersion::Tls1_3),
            max_version: Some(TlsVersion::Tls1_2),
            ..DtlsSettings::default()
        };
        assert!(matches!(
            dtls.validate(),
            Err(ConfigError::TlsVersionRange { .. })
        ));
    }

    #[test]
    fn multicast_range_is_the_full_class_d_block() {
        assert!(validate_multicast_address("224.0.0.0").is_ok());
        assert!(validate_multicast_address("224.0.1.187").is_ok());
        assert!(validate_multicast_address("239.255.255.255").is_ok());

        assert!(validate_multicast_address("223.255.255.255").is_err());
        assert!(validate_multicast_address("240.0.0.0").is_err());
        assert!(validate_multicast_address("10.0.0.1").is_err());
        assert!(validate_multicast_address("not-an-address").is_err());
    }

    #[test]
    fn multicast_port_must_be_nonzero() {
        let config = CoapClientConfig::default().with_multicast("224.0.1.187", 0);
        assert_eq!(config.validate(), Err(ConfigError::InvalidMulticastPort));
    }
}
