//! Authorization stage

use log::{debug, warn};
use std::sync::Arc;

use super::RequestStage;
use crate::api::{Connection, NetworkServiceRequest};
use crate::common::{ProxyError, Result};
use crate::identity::{decode_claims, verify_token};
use crate::tls::PeerInfo;

/// Authorization decision for a connection whose path is already verified
pub trait AuthorizationPolicy: Send + Sync {
    fn check(&self, connection: &Connection, peer: &PeerInfo) -> Result<()>;
}

impl<F> AuthorizationPolicy for F
where
    F: Fn(&Connection, &PeerInfo) -> Result<()> + Send + Sync,
{
    fn check(&self, connection: &Connection, peer: &PeerInfo) -> Result<()> {
        self(connection, peer)
    }
}

/// Accept every verified path
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthorizationPolicy for AllowAll {
    fn check(&self, _connection: &Connection, _peer: &PeerInfo) -> Result<()> {
        Ok(())
    }
}

/// Reject everything
#[derive(Debug, Clone)]
pub struct DenyAll {
    reason: String,
}

impl DenyAll {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl AuthorizationPolicy for DenyAll {
    fn check(&self, _connection: &Connection, _peer: &PeerInfo) -> Result<()> {
        Err(ProxyError::AuthorizationDenied(self.reason.clone()))
    }
}

fn denied(reason: impl Into<String>) -> ProxyError {
    ProxyError::AuthorizationDenied(reason.into())
}

/// Verify the path of an incoming request, then consult the policy
///
/// Every token must be well formed and unexpired, tokens must be unique, and
/// the segment at the path index must be signed by the TLS peer.
pub struct Authorize {
    policy: Arc<dyn AuthorizationPolicy>,
    audience: Option<String>,
}

impl Authorize {
    pub fn new(policy: Arc<dyn AuthorizationPolicy>) -> Self {
        Self { policy, audience: None }
    }

    /// Additionally require the peer's token to be addressed to `audience`
    pub fn with_audience(mut self, audience: Option<String>) -> Self {
        self.audience = audience;
        self
    }

    fn verify_path(&self, connection: &Connection, peer: &PeerInfo) -> Result<()> {
        let path = &connection.path;
        if path.is_empty() {
            return Err(denied("request carries an empty path"));
        }

        for segment in &path.path_segments {
            let claims = decode_claims(&segment.token)
                .map_err(|_| denied(format!("segment '{}' carries a malformed token", segment.name)))?;
            if claims.is_expired() {
                return Err(denied(format!("token of segment '{}' has expired", segment.name)));
            }
        }

        if !path.has_unique_tokens() {
            return Err(denied("path contains duplicate tokens"));
        }

        let current = path
            .current()
            .ok_or_else(|| denied(format!("path index {} out of range", path.index)))?;
        let key = peer
            .public_key
            .as_ref()
            .ok_or_else(|| denied("peer presented no certificate"))?;
        let claims = verify_token(&current.token, key)
            .map_err(|e| denied(format!("segment '{}' is not signed by the peer: {}", current.name, e.message())))?;

        if let Some(audience) = &self.audience {
            if &claims.aud != audience {
                return Err(denied(format!(
                    "token of segment '{}' is addressed to {}, not {}",
                    current.name, claims.aud, audience
                )));
            }
        }
        Ok(())
    }
}

impl RequestStage for Authorize {
    fn name(&self) -> &'static str {
        "authorize"
    }

    fn on_request(&self, request: &mut NetworkServiceRequest, peer: &PeerInfo) -> Result<()> {
        let connection = request
            .connection
            .as_ref()
            .ok_or_else(|| denied("request carries no connection"))?;

        let result = self
            .verify_path(connection, peer)
            .and_then(|_| self.policy.check(connection, peer));
        match &result {
            Ok(()) => debug!("Authorized connection {} from {}", connection.id, peer.name()),
            Err(e) => warn!("Rejected connection {} from {}: {}", connection.id, peer.name(), e),
        }
        result
    }
}
