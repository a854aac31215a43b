//! Network utility functions
//!
//! This module provides the URL type used for the listen and upstream
//! addresses, and helpers to turn it into socket addresses.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use super::error::{ProxyError, Result};

/// Schemes the proxy can listen on and dial
pub const SUPPORTED_SCHEMES: &[&str] = &["tcp"];

/// A `scheme://host:port` address
///
/// An empty host (`tcp://:0`) means the loopback interface; port 0 asks the
/// operating system for an ephemeral port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeshUrl {
    scheme: String,
    host: String,
}

impl MeshUrl {
    /// Create a URL from its parts without validating them
    pub fn new(scheme: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
        }
    }

    /// A `tcp://` URL for a concrete socket address
    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new("tcp", addr.to_string())
    }

    /// URL scheme
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host and port part
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Check scheme and host without resolving names
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_SCHEMES.contains(&self.scheme.as_str()) {
            return Err(ProxyError::ConfigInvalid(format!(
                "Unsupported scheme '{}' in {}. Valid schemes are: {}",
                self.scheme,
                self,
                SUPPORTED_SCHEMES.join(", ")
            )));
        }

        let (_, port) = self.split_host_port()?;
        port.parse::<u16>().map_err(|_| {
            ProxyError::ConfigInvalid(format!("Invalid port '{}' in {}", port, self))
        })?;

        Ok(())
    }

    fn split_host_port(&self) -> Result<(&str, &str)> {
        self.host
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::ConfigInvalid(format!("Missing port in {}", self)))
    }

    /// Resolve to a socket address
    ///
    /// Literal addresses are parsed directly; names go through the system
    /// resolver and the first result wins.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.validate()?;
        let (host, port) = self.split_host_port()?;

        if host.is_empty() {
            let port = port.parse::<u16>().map_err(|_| {
                ProxyError::ConfigInvalid(format!("Invalid port '{}' in {}", port, self))
            })?;
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
        }

        parse_socket_addr(&self.host)
    }
}

impl fmt::Display for MeshUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)
    }
}

impl FromStr for MeshUrl {
    type Err = ProxyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (scheme, host) = s.split_once("://").ok_or_else(|| {
            ProxyError::ConfigInvalid(format!("Invalid URL '{}': expected scheme://host:port", s))
        })?;

        if scheme.is_empty() || host.is_empty() {
            return Err(ProxyError::ConfigInvalid(format!(
                "Invalid URL '{}': scheme and host are required",
                s
            )));
        }

        Ok(Self::new(scheme.to_lowercase(), host))
    }
}

impl Serialize for MeshUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MeshUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MeshUrl::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse a socket address
///
/// # Arguments
///
/// * `addr` - The address string to parse
///
/// # Returns
///
/// The parsed `SocketAddr`
pub fn parse_socket_addr(addr: &str) -> Result<SocketAddr> {
    // Try direct parsing first
    if let Ok(socket_addr) = SocketAddr::from_str(addr) {
        return Ok(socket_addr);
    }

    match addr.to_socket_addrs() {
        Ok(mut addrs) => addrs
            .next()
            .ok_or_else(|| ProxyError::ConfigInvalid(format!("Failed to resolve address: {}", addr))),
        Err(e) => Err(ProxyError::ConfigInvalid(format!("Failed to parse address {}: {}", addr, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_socket_addr() {
        let addr = parse_socket_addr("127.0.0.1:8080");
        assert!(addr.is_ok(), "Should be able to parse a valid address");
        assert_eq!(addr.unwrap().port(), 8080);

        let addr = parse_socket_addr("invalid-address");
        assert!(addr.is_err(), "Should fail to parse an invalid address");
    }

    #[test]
    fn test_mesh_url_parse() {
        let url: MeshUrl = "tcp://127.0.0.1:5001".parse().unwrap();
        assert_eq!(url.scheme(), "tcp");
        assert_eq!(url.host(), "127.0.0.1:5001");
        assert_eq!(url.to_string(), "tcp://127.0.0.1:5001");
        assert_eq!(url.socket_addr().unwrap().port(), 5001);
    }

    #[test]
    fn test_empty_host_is_loopback() {
        let url: MeshUrl = "tcp://:0".parse().unwrap();
        let addr = url.socket_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 0);
    }

    #[test]
    fn test_mesh_url_rejects_malformed() {
        assert!("127.0.0.1:5001".parse::<MeshUrl>().is_err());
        assert!("tcp://".parse::<MeshUrl>().is_err());

        let unix: MeshUrl = "unix:///var/run/nsm.sock".parse().unwrap();
        assert!(matches!(unix.validate(), Err(ProxyError::ConfigInvalid(_))));

        let no_port: MeshUrl = "tcp://localhost".parse().unwrap();
        assert!(no_port.validate().is_err());
    }

    #[test]
    fn test_mesh_url_serde() {
        let url: MeshUrl = serde_json::from_str("\"tcp://:5000\"").unwrap();
        assert_eq!(url.host(), ":5000");
        assert_eq!(serde_json::to_string(&url).unwrap(), "\"tcp://:5000\"");
    }
}
