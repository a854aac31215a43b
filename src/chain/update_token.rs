//! Token stages

use std::sync::Arc;
use std::time::Duration;

use super::RequestStage;
use crate::api::{NetworkServiceRequest, PathSegment};
use crate::common::{ProxyError, Result};
use crate::identity::TokenIssuer;
use crate::tls::PeerInfo;

fn mint(
    issuer: &dyn TokenIssuer,
    segment: &mut PathSegment,
    peer: &PeerInfo,
    max_lifetime: Duration,
) -> Result<()> {
    let audience = peer
        .identity
        .as_deref()
        .ok_or_else(|| ProxyError::AuthorizationDenied("peer presented no identity".to_string()))?;

    let (token, expires) = issuer.issue(audience, max_lifetime).map_err(|e| match e {
        ProxyError::TokenExpired(_) => e,
        other => ProxyError::TokenExpired(format!("unable to mint token: {}", other.message())),
    })?;

    segment.token = token;
    segment.expires = expires;
    Ok(())
}

/// Sign this hop's segment for the upstream peer
pub struct UpdateToken {
    issuer: Arc<dyn TokenIssuer>,
    max_lifetime: Duration,
}

impl UpdateToken {
    pub fn new(issuer: Arc<dyn TokenIssuer>, max_lifetime: Duration) -> Self {
        Self { issuer, max_lifetime }
    }
}

impl RequestStage for UpdateToken {
    fn name(&self) -> &'static str {
        "update-token"
    }

    fn on_request(&self, request: &mut NetworkServiceRequest, peer: &PeerInfo) -> Result<()> {
        let segment = request
            .connection_mut()
            .path
            .current_mut()
            .ok_or_else(|| ProxyError::Protocol("no path segment to sign".to_string()))?;
        mint(self.issuer.as_ref(), segment, peer, self.max_lifetime)
    }
}

/// Replace the local caller's token with one minted by this proxy
///
/// Local callers are unauthenticated; whatever token they put in their own
/// segment is discarded and the proxy vouches for them instead. A current
/// segment carrying this proxy's name is left to [`UpdateToken`]. Runs before
/// [`UpdatePath`](super::UpdatePath), while the index still points at the
/// caller's segment.
pub struct UpdateCallerToken {
    name: String,
    issuer: Arc<dyn TokenIssuer>,
    max_lifetime: Duration,
}

impl UpdateCallerToken {
    pub fn new(name: impl Into<String>, issuer: Arc<dyn TokenIssuer>, max_lifetime: Duration) -> Self {
        Self {
            name: name.into(),
            issuer,
            max_lifetime,
        }
    }
}

impl RequestStage for UpdateCallerToken {
    fn name(&self) -> &'static str {
        "update-caller-token"
    }

    fn on_request(&self, request: &mut NetworkServiceRequest, peer: &PeerInfo) -> Result<()> {
        match request.connection.as_mut().and_then(|c| c.path.current_mut()) {
            Some(segment) if segment.name != self.name => mint(self.issuer.as_ref(), segment, peer, self.max_lifetime),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::test_support::Hop;
    use crate::identity::{decode_claims, SelfSignedCa};
    use chrono::{DateTime, Utc};

    struct FailingIssuer;

    impl TokenIssuer for FailingIssuer {
        fn issue(&self, _peer: &str, _max_lifetime: Duration) -> Result<(String, DateTime<Utc>)> {
            Err(ProxyError::IdentityUnavailable("agent restarting".to_string()))
        }
    }

    fn request_with_segment(name: &str, token: &str) -> NetworkServiceRequest {
        let mut request = NetworkServiceRequest::default();
        request.connection_mut().path.path_segments.push(PathSegment {
            name: name.to_string(),
            id: String::new(),
            token: token.to_string(),
            expires: Utc::now(),
        });
        request
    }

    #[test]
    fn test_update_token_signs_for_peer() {
        let ca = SelfSignedCa::new("example.org").unwrap();
        let proxy = Hop::new(&ca, "proxy-nsc");
        let endpoint = Hop::new(&ca, "nse");

        let mut request = request_with_segment("proxy-nsc", "");
        UpdateToken::new(Arc::clone(&proxy.issuer), Duration::from_secs(60))
            .on_request(&mut request, &endpoint.peer_info())
            .unwrap();

        let segment = &request.connection.unwrap().path.path_segments[0];
        let claims = decode_claims(&segment.token).unwrap();
        assert_eq!(claims.sub, "spiffe://example.org/proxy-nsc");
        assert_eq!(claims.aud, "spiffe://example.org/nse");
        assert!(segment.expires > Utc::now());
    }

    #[test]
    fn test_mint_failure_is_token_expired() {
        let mut request = request_with_segment("proxy-nsc", "");
        let peer = PeerInfo {
            identity: Some("spiffe://example.org/nse".to_string()),
            public_key: None,
        };
        let result = UpdateToken::new(Arc::new(FailingIssuer), Duration::from_secs(60)).on_request(&mut request, &peer);
        assert!(matches!(result, Err(ProxyError::TokenExpired(_))));
    }

    #[test]
    fn test_caller_token_is_replaced() {
        let ca = SelfSignedCa::new("example.org").unwrap();
        let proxy = Hop::new(&ca, "proxy-nsc");
        let endpoint = Hop::new(&ca, "nse");

        let mut request = request_with_segment("nsc", "TestToken");
        UpdateCallerToken::new("proxy-nsc", Arc::clone(&proxy.issuer), Duration::from_secs(60))
            .on_request(&mut request, &endpoint.peer_info())
            .unwrap();
        let token = &request.connection.as_ref().unwrap().path.path_segments[0].token;
        assert_ne!(token, "TestToken");

        // nothing to do without a caller segment
        let mut empty = NetworkServiceRequest::default();
        UpdateCallerToken::new("proxy-nsc", Arc::clone(&proxy.issuer), Duration::from_secs(60))
            .on_request(&mut empty, &endpoint.peer_info())
            .unwrap();
        assert!(empty.connection.is_none());

        // the proxy's own segment is not a caller segment
        let mut own = request_with_segment("proxy-nsc", "own-token");
        UpdateCallerToken::new("proxy-nsc", Arc::clone(&proxy.issuer), Duration::from_secs(60))
            .on_request(&mut own, &endpoint.peer_info())
            .unwrap();
        assert_eq!(own.connection.unwrap().path.path_segments[0].token, "own-token");
    }
}
