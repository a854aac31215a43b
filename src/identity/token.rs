//! Identity-bound path tokens
//!
//! Tokens are compact JWS (header.claims.signature, base64url without
//! padding) signed with the workload's SVID key. The audience is the
//! identity of the peer the token is presented to, so a token is only valid
//! on the hop it was minted for.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use log::trace;
use openssl::bn::BigNum;
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, Id, PKeyRef, Private};
use openssl::sign::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::IdentitySource;
use crate::common::{ProxyError, Result};

/// Size of one P-256 signature coordinate
const P256_COORD_LEN: i32 = 32;

/// Claims carried by a path token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    /// Identity of the signer
    pub sub: String,
    /// Identity of the peer the token is meant for
    pub aud: String,
    /// Issued at, seconds since the epoch
    pub iat: i64,
    /// Expiry, seconds since the epoch
    pub exp: i64,
    /// Unique token id
    pub jti: String,
}

impl TokenClaims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at().map_or(true, |exp| exp <= Utc::now())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Mints tokens for a peer
pub trait TokenIssuer: Send + Sync {
    /// Issue a token for `peer` valid for at most `max_lifetime`
    ///
    /// Returns the encoded token and its expiry.
    fn issue(&self, peer: &str, max_lifetime: Duration) -> Result<(String, DateTime<Utc>)>;
}

/// Issues tokens signed with the current SVID key
pub struct JwtTokenIssuer {
    identity: Arc<dyn IdentitySource>,
    allowed_lifetime: Duration,
}

impl JwtTokenIssuer {
    /// `allowed_lifetime` caps every token regardless of what callers ask for
    pub fn new(identity: Arc<dyn IdentitySource>, allowed_lifetime: Duration) -> Self {
        Self {
            identity,
            allowed_lifetime,
        }
    }
}

impl TokenIssuer for JwtTokenIssuer {
    fn issue(&self, peer: &str, max_lifetime: Duration) -> Result<(String, DateTime<Utc>)> {
        let svid = self.identity.svid()?;
        let lifetime = max_lifetime.min(self.allowed_lifetime);
        let lifetime = chrono::Duration::from_std(lifetime)
            .map_err(|e| ProxyError::TokenExpired(format!("token lifetime out of range: {}", e)))?;

        let now = Utc::now();
        let mut expires = now + lifetime;
        // never outlive the certificate that signs it
        let not_after = svid.not_after()?;
        if not_after < expires {
            expires = not_after;
        }

        let exp = expires.timestamp();
        let expires = DateTime::from_timestamp(exp, 0)
            .ok_or_else(|| ProxyError::TokenExpired(format!("token expiry out of range: {}", exp)))?;
        if expires <= now {
            return Err(ProxyError::TokenExpired(format!(
                "token for {} would already be expired at {}",
                peer, expires
            )));
        }

        let claims = TokenClaims {
            sub: svid.id().to_string(),
            aud: peer.to_string(),
            iat: now.timestamp(),
            exp,
            jti: Uuid::new_v4().to_string(),
        };
        trace!("Minting token {} for {} expiring at {}", claims.jti, peer, expires);

        Ok((sign(&claims, svid.private_key())?, expires))
    }
}

fn decode_part(part: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|_| ProxyError::AuthorizationDenied("malformed token encoding".to_string()))
}

fn algorithm<T>(key: &PKeyRef<T>) -> Result<&'static str>
where
    T: HasPublic,
{
    match key.id() {
        Id::EC => {
            let curve = key.ec_key()?.group().curve_name();
            if curve == Some(Nid::X9_62_PRIME256V1) {
                Ok("ES256")
            } else {
                Err(ProxyError::IdentityUnavailable(format!("unsupported EC curve {:?}", curve)))
            }
        }
        Id::RSA => Ok("RS256"),
        other => Err(ProxyError::IdentityUnavailable(format!("unsupported key type {:?}", other))),
    }
}

/// Sign `claims` with `key`
pub fn sign(claims: &TokenClaims, key: &PKeyRef<Private>) -> Result<String> {
    let alg = algorithm(key)?;
    let header = Header {
        alg: alg.to_string(),
        typ: "JWT".to_string(),
    };

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(&serde_json::to_vec(&header)?),
        URL_SAFE_NO_PAD.encode(&serde_json::to_vec(claims)?)
    );

    let mut signer = Signer::new(MessageDigest::sha256(), key)?;
    signer.update(signing_input.as_bytes())?;
    let der = signer.sign_to_vec()?;

    let signature = if alg == "ES256" {
        // JWS carries the raw r || s pair instead of DER
        let sig = EcdsaSig::from_der(&der)?;
        let mut raw = sig.r().to_vec_padded(P256_COORD_LEN)?;
        raw.extend(sig.s().to_vec_padded(P256_COORD_LEN)?);
        raw
    } else {
        der
    };

    Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(&signature)))
}

fn split(token: &str) -> Result<(&str, &str, &str)> {
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(c), Some(s), None) => Ok((h, c, s)),
        _ => Err(ProxyError::AuthorizationDenied("token is not a compact JWS".to_string())),
    }
}

/// Decode the claims of a token without checking its signature
pub fn decode_claims(token: &str) -> Result<TokenClaims> {
    let (_, claims, _) = split(token)?;
    serde_json::from_slice(&decode_part(claims)?)
        .map_err(|e| ProxyError::AuthorizationDenied(format!("malformed token claims: {}", e)))
}

/// Verify a token's signature against `key` and check its expiry
pub fn verify_token<T>(token: &str, key: &PKeyRef<T>) -> Result<TokenClaims>
where
    T: HasPublic,
{
    let (header_b64, claims_b64, signature_b64) = split(token)?;

    let header: Header = serde_json::from_slice(&decode_part(header_b64)?)
        .map_err(|e| ProxyError::AuthorizationDenied(format!("malformed token header: {}", e)))?;
    let alg = algorithm(key)?;
    if header.alg != alg {
        return Err(ProxyError::AuthorizationDenied(format!(
            "token algorithm {} does not match key ({})",
            header.alg, alg
        )));
    }

    let raw = decode_part(signature_b64)?;
    let signature = if alg == "ES256" {
        if raw.len() != 2 * P256_COORD_LEN as usize {
            return Err(ProxyError::AuthorizationDenied("malformed token signature".to_string()));
        }
        let (r, s) = raw.split_at(P256_COORD_LEN as usize);
        EcdsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?.to_der()?
    } else {
        raw
    };

    let mut verifier = Verifier::new(MessageDigest::sha256(), key)?;
    verifier.update(format!("{}.{}", header_b64, claims_b64).as_bytes())?;
    // OpenSSL reports a bad signature either as false or as an error stack
    if !verifier.verify(&signature).unwrap_or(false) {
        return Err(ProxyError::AuthorizationDenied("token signature is invalid".to_string()));
    }

    let claims = decode_claims(token)?;
    if claims.is_expired() {
        return Err(ProxyError::AuthorizationDenied(format!(
            "token {} expired at {}",
            claims.jti, claims.exp
        )));
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{MockIdentitySource, SelfSignedCa, StaticIdentitySource};
    use openssl::rsa::Rsa;
    use openssl::pkey::PKey;

    fn make_issuer(workload: &str, allowed: Duration) -> (JwtTokenIssuer, Arc<crate::identity::Svid>) {
        let ca = SelfSignedCa::new("example.org").unwrap();
        let svid = ca.issue(workload).unwrap();
        let source = StaticIdentitySource::new(svid);
        let svid = source.svid().unwrap();
        (JwtTokenIssuer::new(Arc::new(source), allowed), svid)
    }

    #[test]
    fn test_issue_and_verify() {
        let (issuer, svid) = make_issuer("nsc", Duration::from_secs(600));
        let (token, expires) = issuer.issue("spiffe://example.org/nse", Duration::from_secs(60)).unwrap();

        let public = svid.certificate().public_key().unwrap();
        let claims = verify_token(&token, &public).unwrap();
        assert_eq!(claims.sub, "spiffe://example.org/nsc");
        assert_eq!(claims.aud, "spiffe://example.org/nse");
        assert_eq!(claims.expires_at(), Some(expires));

        let remaining = expires - Utc::now();
        assert!(remaining.num_seconds() <= 60 && remaining.num_seconds() >= 58);
    }

    #[test]
    fn test_lifetime_capped_by_allowed() {
        let (issuer, _) = make_issuer("nsc", Duration::from_secs(30));
        let (_, expires) = issuer.issue("peer", Duration::from_secs(3600)).unwrap();
        assert!((expires - Utc::now()).num_seconds() <= 30);
    }

    #[test]
    fn test_tokens_are_unique() {
        let (issuer, _) = make_issuer("nsc", Duration::from_secs(30));
        let (a, _) = issuer.issue("peer", Duration::from_secs(30)).unwrap();
        let (b, _) = issuer.issue("peer", Duration::from_secs(30)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_sub_second_lifetime_is_rejected() {
        let (issuer, _) = make_issuer("nsc", Duration::from_secs(30));
        let result = issuer.issue("peer", Duration::from_millis(0));
        assert!(matches!(result, Err(ProxyError::TokenExpired(_))));
    }

    #[test]
    fn test_verify_rejects_other_key() {
        let (issuer, _) = make_issuer("nsc", Duration::from_secs(30));
        let (token, _) = issuer.issue("peer", Duration::from_secs(30)).unwrap();

        let ca = SelfSignedCa::new("example.org").unwrap();
        let other = ca.issue("other").unwrap();
        let public = other.certificate().public_key().unwrap();
        assert!(matches!(verify_token(&token, &public), Err(ProxyError::AuthorizationDenied(_))));
    }

    #[test]
    fn test_verify_rejects_tampered_claims() {
        let (issuer, svid) = make_issuer("nsc", Duration::from_secs(30));
        let (token, _) = issuer.issue("peer", Duration::from_secs(30)).unwrap();
        let (header, _, signature) = split(&token).unwrap();

        let mut claims = decode_claims(&token).unwrap();
        claims.aud = "someone-else".to_string();
        let forged = format!(
            "{}.{}.{}",
            header,
            URL_SAFE_NO_PAD.encode(&serde_json::to_vec(&claims).unwrap()),
            signature
        );

        let public = svid.certificate().public_key().unwrap();
        assert!(verify_token(&forged, &public).is_err());
    }

    #[test]
    fn test_rsa_keys_sign_rs256() {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let claims = TokenClaims {
            sub: "a".to_string(),
            aud: "b".to_string(),
            iat: Utc::now().timestamp(),
            exp: Utc::now().timestamp() + 60,
            jti: Uuid::new_v4().to_string(),
        };
        let token = sign(&claims, &key).unwrap();
        assert_eq!(verify_token(&token, &key).unwrap(), claims);
    }

    #[test]
    fn test_issue_fails_without_identity() {
        let mut source = MockIdentitySource::new();
        source
            .expect_svid()
            .returning(|| Err(ProxyError::IdentityUnavailable("agent down".to_string())));

        let issuer = JwtTokenIssuer::new(Arc::new(source), Duration::from_secs(30));
        let result = issuer.issue("peer", Duration::from_secs(30));
        assert!(matches!(result, Err(ProxyError::IdentityUnavailable(_))));
    }

    #[test]
    fn test_malformed_tokens() {
        assert!(decode_claims("TestToken").is_err());
        assert!(decode_claims("a.b").is_err());
        assert!(decode_claims("a.!!.c").is_err());
    }

    #[test]
    fn test_token_parts_are_unpadded_base64url() {
        let (issuer, _) = make_issuer("nsc", Duration::from_secs(30));
        let (token, _) = issuer.issue("peer", Duration::from_secs(30)).unwrap();

        for part in token.split('.') {
            assert!(!part.is_empty());
            assert!(part.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }

        // padded claims are not part of the compact form
        let (header, claims, signature) = split(&token).unwrap();
        let padded = format!("{}.{}==.{}", header, claims, signature);
        assert!(decode_claims(&padded).is_err());
    }
}
