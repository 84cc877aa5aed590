//! DTLS session layer: credential validation, cipher-suite gating, and
//! the handshake provider seam.
//!
//! The cryptography itself lives behind [`DtlsProvider`]; this module
//! owns everything that must be checked *before* a handshake is worth
//! attempting: PEM framing, certificate validity dates, key/cert
//! agreement, chain verification, PSK bounds, and the TLS version
//! floor. Validation runs at configuration load and again per
//! handshake, so a certificate that expires while the process is up is
//! caught at the next session establishment.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use openssl::asn1::Asn1Time;
use openssl::pkey::PKey;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509StoreContext, X509};
use tracing::{debug, info};

use crate::config::{DtlsSettings, TlsVersion};
use crate::errors::{Result, TransportError};
use crate::metrics;
use crate::net::Endpoint;

/// A cipher suite the session layer may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuite {
    pub name: &'static str,
    /// Lowest protocol version this suite can run under.
    pub min_version: TlsVersion,
}

/// Suites the provider may negotiate, newest first.
pub const SUPPORTED_CIPHER_SUITES: &[CipherSuite] = &[
    CipherSuite {
        name: "TLS_AES_256_GCM_SHA384",
        min_version: TlsVersion::Tls1_3,
    },
    CipherSuite {
        name: "TLS_AES_128_GCM_SHA256",
        min_version: TlsVersion::Tls1_3,
    },
    CipherSuite {
        name: "ECDHE-ECDSA-AES128-GCM-SHA256",
        min_version: TlsVersion::Tls1_2,
    },
    CipherSuite {
        name: "ECDHE-RSA-AES128-GCM-SHA256",
        min_version: TlsVersion::Tls1_2,
    },
    CipherSuite {
        name: "ECDHE-PSK-AES128-CBC-SHA256",
        min_version: TlsVersion::Tls1_2,
    },
    // Legacy suites kept in the table so version gating has something
    // to reject.
    CipherSuite {
        name: "AES128-SHA",
        min_version: TlsVersion::Tls1_0,
    },
];

/// The suites acceptable under `settings`: at or above both the
/// configured floor and the hard TLS 1.2 floor, and within the
/// configured ceiling.
pub fn acceptable_cipher_suites(settings: &DtlsSettings) -> Vec<CipherSuite> {
    let floor = settings.min_version.unwrap_or(TlsVersion::Tls1_2);
    let ceiling = settings.max_version.unwrap_or(TlsVersion::Tls1_3);
    SUPPORTED_CIPHER_SUITES
        .iter()
        .copied()
        .filter(|suite| suite.min_version.meets_floor())
        .filter(|suite| suite.min_version >= floor && suite.min_version <= ceiling)
        .collect()
}

/// Validate PEM framing without touching the filesystem.
///
/// Checks the BEGIN/END markers, a non-empty body of at least 10
/// characters, and a body drawn from the base64 alphabet, then hands
/// the text to the `pem` parser as the final arbiter.
pub fn validate_pem_text(text: &str) -> Result<()> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(TransportError::Security("empty PEM input".into()));
    }

    let begin = trimmed
        .lines()
        .position(|l| l.starts_with("-----BEGIN ") && l.trim_end().ends_with("-----"));
    let end = trimmed
        .lines()
        .position(|l| l.starts_with("-----END ") && l.trim_end().ends_with("-----"));
    let (begin, end) = match (begin, end) {
        (Some(b), Some(e)) if b < e => (b, e),
        _ => {
            return Err(TransportError::Security(
                "PEM BEGIN/END markers missing or out of order".into(),
            ))
        }
    };

    let body: String = trimmed
        .lines()
        .skip(begin + 1)
        .take(end - begin - 1)
        .collect::<Vec<_>>()
        .join("");
    let body = body.trim().to_string();

    if body.is_empty() {
        return Err(TransportError::Security("PEM body is empty".into()));
    }
    if body.len() < 10 {
        return Err(TransportError::Security(format!(
            "PEM body of {} characters is implausibly short",
            body.len()
        )));
    }
    if !body
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
    {
        return Err(TransportError::Security(
            "PEM body contains non-base64 characters".into(),
        ));
    }

    pem::parse(trimmed)
        .map_err(|e| TransportError::Security(format!("PEM parse failed: {e}")))?;
    Ok(())
}

fn security_err(context: &str, e: impl std::fmt::Display) -> TransportError {
    TransportError::Security(format!("{context}: {e}"))
}

/// Validate a certificate/key pair (and optionally its chain) from PEM
/// text.
///
/// Applied checks, in order: PEM framing on both inputs, not-before /
/// not-after against the current time, private-key-to-certificate
/// match, and chain verification against `ca_pem` (or the system roots
/// when absent) when `verify_peer` is set.
pub fn validate_certificate_pair(
    cert_pem: &str,
    key_pem: &str,
    ca_pem: Option<&str>,
    verify_peer: bool,
) -> Result<()> {
    validate_pem_text(cert_pem)?;
    validate_pem_text(key_pem)?;
    if let Some(ca) = ca_pem {
        validate_pem_text(ca)?;
    }

    let cert = X509::from_pem(cert_pem.as_bytes())
        .map_err(|e| security_err("certificate parse failed", e))?;

    let now = Asn1Time::days_from_now(0).map_err(|e| security_err("clock read failed", e))?;
    if cert
        .not_before()
        .compare(&now)
        .map_err(|e| security_err("not-before comparison failed", e))?
        == Ordering::Greater
    {
        return Err(TransportError::Security(
            "certificate is not yet valid".into(),
        ));
    }
    if cert
        .not_after()
        .compare(&now)
        .map_err(|e| security_err("not-after comparison failed", e))?
        == Ordering::Less
    {
        return Err(TransportError::Security("certificate has expired".into()));
    }

    let key = PKey::private_key_from_pem(key_pem.as_bytes())
        .map_err(|e| security_err("private key parse failed", e))?;
    let cert_key = cert
        .public_key()
        .map_err(|e| security_err("certificate public key extraction failed", e))?;
    if !key.public_eq(&cert_key) {
        return Err(TransportError::Security(
            "private key does not match the certificate".into(),
        ));
    }

    if verify_peer {
        let mut store = X509StoreBuilder::new().map_err(|e| security_err("store build", e))?;
        match ca_pem {
            Some(ca) => {
                let ca_cert = X509::from_pem(ca.as_bytes())
                    .map_err(|e| security_err("CA certificate parse failed", e))?;
                store
                    .add_cert(ca_cert)
                    .map_err(|e| security_err("CA store insert failed", e))?;
            }
            None => {
                store
                    .set_default_paths()
                    .map_err(|e| security_err("system CA load failed", e))?;
            }
        }
        let store = store.build();

        let chain = Stack::new().map_err(|e| security_err("chain stack", e))?;
        let mut ctx =
            X509StoreContext::new().map_err(|e| security_err("verification context", e))?;
        let verified = ctx
            .init(&store, &cert, &chain, |c| c.verify_cert())
            .map_err(|e| security_err("chain verification errored", e))?;
        if !verified {
            return Err(TransportError::Security(
                "certificate chain verification failed".into(),
            ));
        }
    }

    debug!("Certificate pair validated");
    Ok(())
}

/// Validate the DTLS credentials named by `settings`, reading the
/// configured files. No-op when DTLS is disabled.
pub fn validate_credentials(settings: &DtlsSettings) -> Result<()> {
    settings
        .validate()
        .map_err(|e| TransportError::Configuration(e.to_string()))?;

    if !settings.enable_dtls {
        return Ok(());
    }

    if let (Some(cert_file), Some(key_file)) = (&settings.cert_file, &settings.key_file) {
        let cert_pem = std::fs::read_to_string(cert_file)
            .map_err(|e| TransportError::Security(format!("read {cert_file}: {e}")))?;
        let key_pem = std::fs::read_to_string(key_file)
            .map_err(|e| TransportError::Security(format!("read {key_file}: {e}")))?;
        let ca_pem = match &settings.ca_file {
            Some(ca_file) => Some(std::fs::read_to_string(ca_file).map_err(|e| {
                TransportError::Security(format!("read {ca_file}: {e}"))
            })?),
            None => None,
        };
        validate_certificate_pair(
            &cert_pem,
            &key_pem,
            ca_pem.as_deref(),
            settings.verify_peer_cert,
        )?;
    }

    if acceptable_cipher_suites(settings).is_empty() {
        return Err(TransportError::Security(
            "no acceptable cipher suites under the configured version bounds".into(),
        ));
    }

    Ok(())
}

/// An established DTLS session (or its plain-UDP stand-in).
#[derive(Debug, Clone)]
pub struct DtlsSession {
    pub peer: Endpoint,
    pub cipher_suite: &'static str,
    pub established_at: Instant,
}

/// Handshake seam. Production backs this with a real DTLS stack; the
/// simulator path uses [`LoopbackProvider`], which enforces the same
/// validation rules without cryptography.
#[async_trait]
pub trait DtlsProvider: Send + Sync {
    /// Complete a handshake with `peer`. Implementations must respect
    /// cancellation: callers bound this with the configured handshake
    /// timeout and drop the future on expiry.
    async fn handshake(&self, peer: &Endpoint, settings: &DtlsSettings) -> Result<DtlsSession>;
}

/// Validation-only provider used with the network simulator and in
/// tests. Re-runs credential validation per handshake and negotiates
/// the first acceptable suite after an optional simulated delay.
pub struct LoopbackProvider {
    pub simulated_delay: Duration,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self {
            simulated_delay: Duration::ZERO,
        }
    }

    pub fn with_delay(simulated_delay: Duration) -> Self {
        Self { simulated_delay }
    }
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DtlsProvider for LoopbackProvider {
    async fn handshake(&self, peer: &Endpoint, settings: &DtlsSettings) -> Result<DtlsSession> {
        let started = Instant::now();
        validate_credentials(settings)?;

        let suites = acceptable_cipher_suites(settings);
        let suite = suites
            .first()
            .ok_or_else(|| TransportError::Security("no acceptable cipher suites".into()))?;

        if !self.simulated_delay.is_zero() {
            tokio::time::sleep(self.simulated_delay).await;
        }

        metrics::HANDSHAKE_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        info!(peer = %peer, cipher_suite = suite.name, "DTLS handshake complete");
        Ok(DtlsSession {
            peer: peer.clone(),
            cipher_suite: suite.name,
            established_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_framing_rules() {
        assert!(validate_pem_text("").is_err());
        assert!(validate_pem_text("no markers at all").is_err());

        // END before BEGIN.
        let swapped = "-----END CERTIFICATE-----\nQUJDREVGRw==\n-----BEGIN CERTIFICATE-----";
        assert!(validate_pem_text(swapped).is_err());

        // Empty body.
        let empty = "-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----";
        assert!(validate_pem_text(empty).is_err());

        // Too-short body.
        let short = "-----BEGIN CERTIFICATE-----\nQUJD\n-----END CERTIFICATE-----";
        assert!(validate_pem_text(short).is_err());

        // Non-base64 body.
        let garbage = "-----BEGIN CERTIFICATE-----\n!!!not base64 at all!!!\n-----END CERTIFICATE-----";
        assert!(validate_pem_text(garbage).is_err());
    }

    #[test]
    fn version_gate_drops_legacy_suites() {
        let settings = DtlsSettings {
            enable_dtls: true,
            psk_identity: Some("id".into()),
            psk_key: Some(vec![0; 8]),
            ..DtlsSettings::default()
        };
        let suites = acceptable_cipher_suites(&settings);
        assert!(!suites.is_empty());
        assert!(suites.iter().all(|s| s.min_version >= TlsVersion::Tls1_2));
        assert!(!suites.iter().any(|s| s.name == "AES128-SHA"));
    }

    #[test]
    fn ceiling_excludes_newer_suites() {
        let settings = DtlsSettings {
            enable_dtls: true,
            psk_identity: Some("id".into()),
            psk_key: Some(vec![0; 8]),
            max_version: Some(TlsVersion::Tls1_2),
            ..DtlsSettings::default()
        };
        let suites = acceptable_cipher_suites(&settings);
        assert!(suites.iter().all(|s| s.min_version == TlsVersion::Tls1_2));
    }
}
