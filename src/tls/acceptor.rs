//! TLS acceptor creation from an SVID

use log::{debug, info};
use openssl::ssl::{Ssl, SslAcceptor, SslMethod, SslVerifyMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::common::{ProxyError, Result};
use crate::identity::Svid;

/// Client certificate verification mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientCertMode {
    /// Require and verify client certificates
    #[default]
    Required,
    /// Verify client certificates if presented
    Optional,
    /// Do not request client certificates
    None,
}

impl fmt::Display for ClientCertMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientCertMode::Required => write!(f, "required"),
            ClientCertMode::Optional => write!(f, "optional"),
            ClientCertMode::None => write!(f, "none"),
        }
    }
}

impl FromStr for ClientCertMode {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "required" => Ok(ClientCertMode::Required),
            "optional" => Ok(ClientCertMode::Optional),
            "none" => Ok(ClientCertMode::None),
            other => Err(ProxyError::ConfigInvalid(format!("unknown client certificate mode '{}'", other))),
        }
    }
}

/// Create a TLS acceptor presenting `svid`
///
/// Peers are verified against the SVID's trust bundle according to
/// `client_cert_mode`.
pub fn create_mtls_acceptor(svid: &Svid, client_cert_mode: ClientCertMode) -> Result<SslAcceptor> {
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;

    acceptor.set_certificate(svid.certificate())?;
    for intermediate in svid.chain() {
        acceptor.add_extra_chain_cert(intermediate.clone())?;
    }
    acceptor.set_private_key(svid.private_key())?;
    acceptor.check_private_key()?;

    for root in svid.bundle() {
        acceptor.cert_store_mut().add_cert(root.clone())?;
        acceptor.add_client_ca(root)?;
    }
    debug!("Acceptor trusts {} bundle certificate(s)", svid.bundle().len());

    match client_cert_mode {
        ClientCertMode::Required => {
            info!("Client certificates required (will be verified)");
            acceptor.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        }
        ClientCertMode::Optional => {
            info!("Client certificates optional (will be verified if provided)");
            acceptor.set_verify(SslVerifyMode::PEER);
        }
        ClientCertMode::None => {
            info!("Client certificates not required (no verification)");
            acceptor.set_verify(SslVerifyMode::NONE);
        }
    }

    Ok(acceptor.build())
}

/// Run the server side of the handshake on `stream`
pub async fn accept_tls(acceptor: &SslAcceptor, stream: TcpStream) -> Result<SslStream<TcpStream>> {
    let ssl = Ssl::new(acceptor.context())?;
    let mut stream = SslStream::new(ssl, stream)?;

    std::pin::Pin::new(&mut stream)
        .accept()
        .await
        .map_err(|e| ProxyError::AuthorizationDenied(format!("TLS handshake failed: {}", e)))?;

    debug!("TLS handshake successful");
    Ok(stream)
}
