//! Self-signed certificate authority
//!
//! Issues short-lived X.509 SVIDs under a local trust domain. Used for
//! development setups and tests where no workload agent is running.

use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{Svid, SPIFFE_SCHEME};
use crate::common::{ProxyError, Result};

/// Default validity of issued SVIDs
pub const DEFAULT_SVID_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

/// Backdating applied to `notBefore` to tolerate clock skew
const CLOCK_SKEW: i64 = 60;

/// File names written by [`SelfSignedCa::write_svid`]
pub const SVID_FILE: &str = "svid.pem";
pub const SVID_KEY_FILE: &str = "svid_key.pem";
pub const BUNDLE_FILE: &str = "bundle.pem";

pub struct SelfSignedCa {
    trust_domain: String,
    cert: X509,
    key: PKey<Private>,
}

fn new_ec_key() -> Result<PKey<Private>> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let key = EcKey::generate(&group)?;
    Ok(PKey::from_ec_key(key)?)
}

fn random_serial() -> Result<Asn1Integer> {
    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

fn validity_window(validity: Duration) -> Result<(Asn1Time, Asn1Time)> {
    let now = chrono::Utc::now().timestamp();
    let secs = i64::try_from(validity.as_secs())
        .map_err(|_| ProxyError::ConfigInvalid(format!("validity too long: {:?}", validity)))?;
    Ok((Asn1Time::from_unix(now - CLOCK_SKEW)?, Asn1Time::from_unix(now + secs)?))
}

impl SelfSignedCa {
    /// Create a CA for `trust_domain` with a fresh P-256 key
    pub fn new(trust_domain: impl Into<String>) -> Result<Self> {
        let trust_domain = trust_domain.into();
        if trust_domain.is_empty() || trust_domain.contains('/') {
            return Err(ProxyError::ConfigInvalid(format!("invalid trust domain '{}'", trust_domain)));
        }

        let key = new_ec_key()?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "nsc-proxy")?;
        name.append_entry_by_nid(Nid::COMMONNAME, &trust_domain)?;
        let name = name.build();

        let (not_before, not_after) = validity_window(DEFAULT_SVID_VALIDITY * 7)?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial = random_serial()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build()?)?;
        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(ski)?;
        let san = SubjectAlternativeName::new()
            .uri(&format!("{}{}", SPIFFE_SCHEME, trust_domain))
            .build(&builder.x509v3_context(None, None))?;
        builder.append_extension(san)?;
        builder.sign(&key, MessageDigest::sha256())?;

        Ok(Self {
            trust_domain,
            cert: builder.build(),
            key,
        })
    }

    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// CA certificate, the trust bundle of every issued SVID
    pub fn certificate(&self) -> &X509 {
        &self.cert
    }

    /// SPIFFE id for a workload path in this trust domain
    pub fn spiffe_id(&self, workload: &str) -> String {
        format!("{}{}/{}", SPIFFE_SCHEME, self.trust_domain, workload.trim_start_matches('/'))
    }

    /// Issue an SVID for `workload` valid for [`DEFAULT_SVID_VALIDITY`]
    pub fn issue(&self, workload: &str) -> Result<Svid> {
        self.issue_with_validity(workload, DEFAULT_SVID_VALIDITY)
    }

    pub fn issue_with_validity(&self, workload: &str, validity: Duration) -> Result<Svid> {
        let id = self.spiffe_id(workload);
        let key = new_ec_key()?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "nsc-proxy")?;
        name.append_entry_by_nid(Nid::COMMONNAME, workload)?;
        let name = name.build();

        let (not_before, not_after) = validity_window(validity)?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial = random_serial()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(self.cert.subject_name())?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(KeyUsage::new().critical().digital_signature().build()?)?;
        builder.append_extension(ExtendedKeyUsage::new().server_auth().client_auth().build()?)?;
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(&self.cert), None))?;
        builder.append_extension(aki)?;
        let san = SubjectAlternativeName::new()
            .uri(&id)
            .build(&builder.x509v3_context(Some(&self.cert), None))?;
        builder.append_extension(san)?;
        builder.sign(&self.key, MessageDigest::sha256())?;

        Svid::new(builder.build(), Vec::new(), key, vec![self.cert.clone()])
    }

    /// Write `svid` as PEM files into `dir`
    ///
    /// Returns the certificate, key and bundle paths, in that order.
    pub fn write_svid(&self, svid: &Svid, dir: &Path) -> Result<(PathBuf, PathBuf, PathBuf)> {
        fs::create_dir_all(dir)?;

        let cert_path = dir.join(SVID_FILE);
        let key_path = dir.join(SVID_KEY_FILE);
        let bundle_path = dir.join(BUNDLE_FILE);

        let mut cert_pem = svid.certificate().to_pem()?;
        for intermediate in svid.chain() {
            cert_pem.extend(intermediate.to_pem()?);
        }

        let mut bundle_pem = Vec::new();
        for root in svid.bundle() {
            bundle_pem.extend(root.to_pem()?);
        }

        // key and bundle first so a reader that sees the certificate sees a
        // complete set
        fs::write(&key_path, svid.private_key().private_key_to_pem_pkcs8()?)?;
        fs::write(&bundle_path, bundle_pem)?;
        fs::write(&cert_path, cert_pem)?;

        Ok((cert_path, key_path, bundle_path))
    }
}
