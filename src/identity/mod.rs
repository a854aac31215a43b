//! Workload identity
//!
//! The proxy authenticates with an X.509 SVID: a certificate carrying a
//! SPIFFE id, its private key and the trust bundle used to verify peers.
//! Issuing and rotating that material is somebody else's job (SPIRE or a
//! similar agent); this module only consumes it. One identity source is
//! created per process and shared read-only by every session.

pub mod ca;
pub mod token;

use chrono::{DateTime, Utc};
use log::{debug, info};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Ref, X509};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use crate::common::{Context, ProxyError, Result};
use crate::config::ProxyConfig;

pub use ca::SelfSignedCa;
pub use token::{decode_claims, verify_token, JwtTokenIssuer, TokenClaims, TokenIssuer};

/// Scheme of SPIFFE ids carried in URI SANs
pub const SPIFFE_SCHEME: &str = "spiffe://";

/// X.509 SVID: workload certificate, key and trust bundle
#[derive(Clone)]
pub struct Svid {
    id: String,
    cert: X509,
    chain: Vec<X509>,
    key: PKey<Private>,
    bundle: Vec<X509>,
}

impl std::fmt::Debug for Svid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Svid")
            .field("id", &self.id)
            .field("chain_len", &self.chain.len())
            .field("bundle_len", &self.bundle.len())
            .field("key", &"<private>")
            .finish()
    }
}

impl Svid {
    /// Assemble an SVID, checking that the key belongs to the certificate
    pub fn new(cert: X509, chain: Vec<X509>, key: PKey<Private>, bundle: Vec<X509>) -> Result<Self> {
        let public = cert.public_key()?;
        if !public.public_eq(&key) {
            return Err(ProxyError::IdentityUnavailable(
                "private key does not match the workload certificate".to_string(),
            ));
        }

        if bundle.is_empty() {
            return Err(ProxyError::IdentityUnavailable("trust bundle is empty".to_string()));
        }

        let id = identity_of(&cert).ok_or_else(|| {
            ProxyError::IdentityUnavailable(
                "certificate carries neither a SPIFFE id nor a common name".to_string(),
            )
        })?;

        Ok(Self { id, cert, chain, key, bundle })
    }

    /// Parse PEM encoded material
    ///
    /// `cert_pem` holds the leaf followed by any intermediates.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], bundle_pem: &[u8]) -> Result<Self> {
        let mut certs = X509::stack_from_pem(cert_pem)?;
        if certs.is_empty() {
            return Err(ProxyError::IdentityUnavailable("no certificate in SVID".to_string()));
        }
        let cert = certs.remove(0);
        let key = PKey::private_key_from_pem(key_pem)?;
        let bundle = X509::stack_from_pem(bundle_pem)?;

        Self::new(cert, certs, key, bundle)
    }

    /// SPIFFE id (or common name) of this workload
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn certificate(&self) -> &X509 {
        &self.cert
    }

    /// Intermediates sent along with the leaf
    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    pub fn private_key(&self) -> &PKey<Private> {
        &self.key
    }

    /// Trusted roots for peer verification
    pub fn bundle(&self) -> &[X509] {
        &self.bundle
    }

    /// SHA-256 fingerprint of the leaf, colon separated hex
    pub fn fingerprint(&self) -> Result<String> {
        let der = self.cert.to_der()?;
        let digest = Sha256::digest(&der);
        Ok(digest
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":"))
    }

    /// Expiry of the leaf certificate
    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        asn1_to_datetime(self.cert.not_after())
    }

    pub fn is_expired(&self) -> bool {
        self.not_after().map_or(true, |t| t <= Utc::now())
    }
}

/// Convert an ASN.1 time to UTC
pub fn asn1_to_datetime(time: &Asn1TimeRef) -> Result<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| ProxyError::IdentityUnavailable(format!("certificate time out of range: {}", time)))
}

/// Identity name of a certificate
///
/// Prefers a `spiffe://` URI SAN, then any URI SAN, then the subject CN.
pub fn identity_of(cert: &X509Ref) -> Option<String> {
    let uris: Vec<String> = cert
        .subject_alt_names()
        .map(|names| names.iter().filter_map(|n| n.uri().map(str::to_string)).collect())
        .unwrap_or_default();

    if let Some(spiffe) = uris.iter().find(|u| u.starts_with(SPIFFE_SCHEME)) {
        return Some(spiffe.clone());
    }
    if let Some(uri) = uris.into_iter().next() {
        return Some(uri);
    }

    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| std::str::from_utf8(entry.data().as_slice()).ok())
        .map(str::to_string)
}

/// Source of this workload's identity
#[cfg_attr(test, mockall::automock)]
pub trait IdentitySource: Send + Sync {
    /// Current SVID
    ///
    /// Fails with [`ProxyError::IdentityUnavailable`] when no valid identity
    /// can be fetched.
    fn svid(&self) -> Result<Arc<Svid>>;
}

/// Identity fixed at construction
#[derive(Debug, Clone)]
pub struct StaticIdentitySource {
    svid: Arc<Svid>,
}

impl StaticIdentitySource {
    pub fn new(svid: Svid) -> Self {
        Self { svid: Arc::new(svid) }
    }
}

impl IdentitySource for StaticIdentitySource {
    fn svid(&self) -> Result<Arc<Svid>> {
        if self.svid.is_expired() {
            return Err(ProxyError::IdentityUnavailable(format!("SVID {} has expired", self.svid.id())));
        }
        Ok(Arc::clone(&self.svid))
    }
}

struct CachedSvid {
    svid: Arc<Svid>,
    modified: Option<SystemTime>,
}

/// Identity read from PEM files written by a workload agent
///
/// The files are re-read whenever the certificate file changes or the cached
/// certificate has expired, so agent-side rotation is picked up.
pub struct FileIdentitySource {
    cert_path: PathBuf,
    key_path: PathBuf,
    bundle_path: PathBuf,
    current: RwLock<Option<CachedSvid>>,
}

impl FileIdentitySource {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>, bundle_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            bundle_path: bundle_path.into(),
            current: RwLock::new(None),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(&config.cert_path, &config.key_path, &config.bundle_path)
    }

    fn read(path: &Path, what: &str) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| {
            ProxyError::IdentityUnavailable(format!("cannot read {} {}: {}", what, path.display(), e))
        })
    }

    fn modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.cert_path).and_then(|m| m.modified()).ok()
    }

    /// Read the SVID files and replace the cached identity
    pub fn load(&self) -> Result<Arc<Svid>> {
        let modified = self.modified();
        let cert = Self::read(&self.cert_path, "certificate")?;
        let key = Self::read(&self.key_path, "private key")?;
        let bundle = Self::read(&self.bundle_path, "trust bundle")?;

        let svid = Svid::from_pem(&cert, &key, &bundle).map_err(|e| match e {
            ProxyError::Ssl(stack) => ProxyError::IdentityUnavailable(format!("malformed SVID: {}", stack)),
            other => other,
        })?;
        if svid.is_expired() {
            return Err(ProxyError::IdentityUnavailable(format!("SVID {} has expired", svid.id())));
        }

        let svid = Arc::new(svid);
        debug!("Loaded SVID {} from {}", svid.id(), self.cert_path.display());

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = Some(CachedSvid {
            svid: Arc::clone(&svid),
            modified,
        });
        Ok(svid)
    }

    /// Wait until a valid SVID is available
    ///
    /// Polls the files every `poll` until they can be loaded. Fails with
    /// [`ProxyError::IdentityUnavailable`] carrying the last load error once
    /// `ctx` ends.
    pub async fn wait_for(&self, ctx: &Context, poll: Duration) -> Result<Arc<Svid>> {
        loop {
            let last_error = match self.load() {
                Ok(svid) => {
                    info!("Workload identity available: {}", svid.id());
                    return Ok(svid);
                }
                Err(e) => e,
            };
            debug!("Workload identity not ready yet: {}", last_error);

            tokio::select! {
                _ = ctx.done() => {
                    return Err(ProxyError::IdentityUnavailable(format!(
                        "gave up waiting for workload identity: {}",
                        last_error.message()
                    )));
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}

impl IdentitySource for FileIdentitySource {
    fn svid(&self) -> Result<Arc<Svid>> {
        {
            let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = current.as_ref() {
                if !cached.svid.is_expired() && cached.modified == self.modified() {
                    return Ok(Arc::clone(&cached.svid));
                }
            }
        }
        self.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_of_prefers_spiffe_id() {
        let ca = SelfSignedCa::new("example.org").unwrap();
        let svid = ca.issue("proxy-nsc").unwrap();
        assert_eq!(svid.id(), "spiffe://example.org/proxy-nsc");
        assert_eq!(identity_of(svid.certificate()).as_deref(), Some("spiffe://example.org/proxy-nsc"));
    }

    #[test]
    fn test_identity_of_falls_back_to_common_name() {
        use openssl::ec::{EcGroup, EcKey};
        use openssl::hash::MessageDigest;
        use openssl::x509::{X509Builder, X509NameBuilder};

        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, "legacy-workload").unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        assert_eq!(identity_of(&cert).as_deref(), Some("legacy-workload"));
    }

    #[test]
    fn test_svid_rejects_foreign_key() {
        let ca = SelfSignedCa::new("example.org").unwrap();
        let a = ca.issue("a").unwrap();
        let b = ca.issue("b").unwrap();

        let mixed = Svid::new(
            a.certificate().clone(),
            Vec::new(),
            b.private_key().clone(),
            a.bundle().to_vec(),
        );
        assert!(matches!(mixed, Err(ProxyError::IdentityUnavailable(_))));
    }

    #[test]
    fn test_fingerprint_format() {
        let ca = SelfSignedCa::new("example.org").unwrap();
        let svid = ca.issue("nsc").unwrap();
        let fingerprint = svid.fingerprint().unwrap();
        assert_eq!(fingerprint.split(':').count(), 32);
        assert!(!svid.is_expired());
    }

    #[test]
    fn test_file_source_loads_written_svid() {
        let dir = tempfile::tempdir().unwrap();
        let ca = SelfSignedCa::new("example.org").unwrap();
        let svid = ca.issue("proxy-nsc").unwrap();
        let (cert, key, bundle) = ca.write_svid(&svid, dir.path()).unwrap();

        let source = FileIdentitySource::new(cert, key, bundle);
        let loaded = source.svid().unwrap();
        assert_eq!(loaded.id(), "spiffe://example.org/proxy-nsc");

        // second call is served from the cache
        let again = source.svid().unwrap();
        assert!(Arc::ptr_eq(&loaded, &again));
    }

    #[tokio::test]
    async fn test_wait_for_gives_up_when_context_ends() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileIdentitySource::new(
            dir.path().join("svid.pem"),
            dir.path().join("svid_key.pem"),
            dir.path().join("bundle.pem"),
        );

        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        let result = source.wait_for(&ctx, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ProxyError::IdentityUnavailable(_))));
    }

    #[tokio::test]
    async fn test_wait_for_picks_up_late_identity() {
        let dir = tempfile::tempdir().unwrap();
        let ca = SelfSignedCa::new("example.org").unwrap();
        let svid = ca.issue("late").unwrap();
        let source = FileIdentitySource::new(
            dir.path().join("svid.pem"),
            dir.path().join("svid_key.pem"),
            dir.path().join("bundle.pem"),
        );

        let path = dir.path().to_path_buf();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            ca.write_svid(&svid, &path).unwrap();
        });

        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        let loaded = source.wait_for(&ctx, Duration::from_millis(20)).await.unwrap();
        assert_eq!(loaded.id(), "spiffe://example.org/late");
        writer.await.unwrap();
    }
}
