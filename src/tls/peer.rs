//! Authenticated peer information

use openssl::pkey::{PKey, Public};
use openssl::ssl::SslRef;

use crate::identity::identity_of;

/// What the TLS handshake proved about the other side
#[derive(Clone, Default)]
pub struct PeerInfo {
    /// SPIFFE id (or CN) of the peer certificate
    pub identity: Option<String>,
    /// Public key of the peer certificate
    pub public_key: Option<PKey<Public>>,
}

impl std::fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerInfo")
            .field("identity", &self.identity)
            .field("has_public_key", &self.public_key.is_some())
            .finish()
    }
}

impl PeerInfo {
    /// Extract peer details from an established session
    pub fn from_ssl(ssl: &SslRef) -> Self {
        match ssl.peer_certificate() {
            Some(cert) => Self {
                identity: identity_of(&cert),
                public_key: cert.public_key().ok(),
            },
            None => Self::default(),
        }
    }

    /// Peer identity, or `"unknown"` when the peer sent no certificate
    pub fn name(&self) -> &str {
        self.identity.as_deref().unwrap_or("unknown")
    }
}
