//! Endpoint addressing and the datagram transport seam.
//!
//! The CoAP engine is written against [`DatagramTransport`], not a
//! concrete socket: production binds a tokio [`UdpSocket`] through
//! [`UdpTransport`], tests bind a node of the in-process network
//! simulator. The two are interchangeable; the engine cannot tell them
//! apart.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::errors::{Result, TransportError};

/// A `(host, port)` pair. The host is any hashable identifier: an IP
/// address in production, a bare node name inside the simulator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A parsed CoAP endpoint URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapUri {
    pub endpoint: Endpoint,
    /// True for `coaps://`.
    pub secure: bool,
}

/// Default ports from RFC 7252.
pub const COAP_DEFAULT_PORT: u16 = 5683;
pub const COAPS_DEFAULT_PORT: u16 = 5684;

/// Parse `coap://host[:port]` or `coaps://host[:port]`.
pub fn parse_coap_uri(uri: &str) -> Result<CoapUri> {
    let (secure, rest) = if let Some(rest) = uri.strip_prefix("coaps://") {
        (true, rest)
    } else if let Some(rest) = uri.strip_prefix("coap://") {
        (false, rest)
    } else {
        return Err(TransportError::Configuration(format!(
            "endpoint URI '{uri}' must use the coap:// or coaps:// scheme"
        )));
    };

    let authority = rest.split('/').next().unwrap_or("");
    if authority.is_empty() {
        return Err(TransportError::Configuration(format!(
            "endpoint URI '{uri}' has no host"
        )));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_str)) => {
            let port: u16 = port_str.parse().map_err(|_| {
                TransportError::Configuration(format!("invalid port in endpoint URI '{uri}'"))
            })?;
            (host, port)
        }
        None => (
            authority,
            if secure {
                COAPS_DEFAULT_PORT
            } else {
                COAP_DEFAULT_PORT
            },
        ),
    };

    if host.is_empty() {
        return Err(TransportError::Configuration(format!(
            "endpoint URI '{uri}' has no host"
        )));
    }

    Ok(CoapUri {
        endpoint: Endpoint::new(host, port),
        secure,
    })
}

/// Enforce the scheme/DTLS agreement rule: `coaps://` requires DTLS,
/// `coap://` forbids it.
pub fn enforce_scheme(uri: &CoapUri, dtls_enabled: bool) -> Result<()> {
    if uri.secure != dtls_enabled {
        return Err(TransportError::Security(format!(
            "URI scheme {} disagrees with DTLS {}",
            if uri.secure { "coaps://" } else { "coap://" },
            if dtls_enabled { "enabled" } else { "disabled" },
        )));
    }
    Ok(())
}

/// One received datagram.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub source: Endpoint,
    pub payload: Vec<u8>,
}

/// Message-oriented transport surface shared by the OS UDP stack and the
/// network simulator.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram to `dest`, bounded by `timeout`.
    async fn send_to(&self, payload: &[u8], dest: &Endpoint, timeout: Duration) -> Result<()>;

    /// Receive the next datagram, bounded by `timeout`.
    async fn recv_from(&self, timeout: Duration) -> Result<Datagram>;

    /// The local endpoint this transport is bound to.
    fn local_endpoint(&self) -> Endpoint;

    /// Join a multicast group so group datagrams are delivered here.
    async fn join_multicast(&self, group: &Endpoint) -> Result<()>;
}

/// OS-backed transport over a tokio [`UdpSocket`].
pub struct UdpTransport {
    socket: UdpSocket,
    local: Endpoint,
}

impl UdpTransport {
    /// Bind a UDP socket on `addr` (use port 0 for an ephemeral port).
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::Network(format!("bind {addr}: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            socket,
            local: Endpoint::new(local_addr.ip().to_string(), local_addr.port()),
        })
    }

    fn resolve(dest: &Endpoint) -> Result<SocketAddr> {
        format!("{}:{}", dest.host, dest.port)
            .parse()
            .map_err(|_| TransportError::Network(format!("unresolvable endpoint {dest}")))
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send_to(&self, payload: &[u8], dest: &Endpoint, timeout: Duration) -> Result<()> {
        let addr = Self::resolve(dest)?;
        match tokio::time::timeout(timeout, self.socket.send_to(payload, addr)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Network(format!("send to {dest}: {e}"))),
            Err(_) => Err(TransportError::timeout("send", timeout)),
        }
    }

    async fn recv_from(&self, timeout: Duration) -> Result<Datagram> {
        let mut buf = vec![0u8; 64 * 1024];
        match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, source))) => {
                buf.truncate(len);
                Ok(Datagram {
                    source: Endpoint::new(source.ip().to_string(), source.port()),
                    payload: buf,
                })
            }
            Ok(Err(e)) => Err(TransportError::Network(format!("recv: {e}"))),
            Err(_) => Err(TransportError::timeout("receive", timeout)),
        }
    }

    fn local_endpoint(&self) -> Endpoint {
        self.local.clone()
    }

    async fn join_multicast(&self, group: &Endpoint) -> Result<()> {
        let group_addr: std::net::Ipv4Addr = group
            .host
            .parse()
            .map_err(|_| TransportError::Configuration(format!("invalid group {}", group.host)))?;
        self.socket
            .join_multicast_v4(group_addr, std::net::Ipv4Addr::UNSPECIFIED)
            .map_err(|e| TransportError::Network(format!("join {group_addr}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_uri_with_port() {
        let uri = parse_coap_uri("coap://10.0.0.1:5683").unwrap();
        assert_eq!(uri.endpoint, Endpoint::new("10.0.0.1", 5683));
        assert!(!uri.secure);
    }

    #[test]
    fn parse_secure_uri_defaults_to_5684() {
        let uri = parse_coap_uri("coaps://node-b").unwrap();
        assert_eq!(uri.endpoint, Endpoint::new("node-b", 5684));
        assert!(uri.secure);
    }

    #[test]
    fn parse_ignores_path_suffix() {
        let uri = parse_coap_uri("coap://node-a:7000/raft/request_vote").unwrap();
        assert_eq!(uri.endpoint, Endpoint::new("node-a", 7000));
    }

    #[test]
    fn parse_rejects_foreign_schemes() {
        assert!(parse_coap_uri("http://example.com").is_err());
        assert!(parse_coap_uri("node-a:5683").is_err());
        assert!(parse_coap_uri("coap://").is_err());
    }

    #[test]
    fn scheme_enforcement() {
        let plain = parse_coap_uri("coap://a:1").unwrap();
        let secure = parse_coap_uri("coaps://a:1").unwrap();

        assert!(enforce_scheme(&plain, false).is_ok());
        assert!(enforce_scheme(&secure, true).is_ok());

        let err = enforce_scheme(&plain, true).unwrap_err();
        assert_eq!(err.kind_label(), "security");
        assert!(enforce_scheme(&secure, false).is_err());
    }
}
