//! TLS connector creation from an SVID

use log::debug;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::common::{ProxyError, Result};
use crate::identity::Svid;

/// Create a TLS connector presenting `svid` as client certificate
///
/// The server must present a certificate chaining to the SVID's trust bundle.
pub fn create_tls_connector(svid: &Svid) -> Result<SslConnector> {
    let mut connector = SslConnector::builder(SslMethod::tls())?;

    connector.set_certificate(svid.certificate())?;
    for intermediate in svid.chain() {
        connector.add_extra_chain_cert(intermediate.clone())?;
    }
    connector.set_private_key(svid.private_key())?;
    connector.check_private_key()?;

    for root in svid.bundle() {
        connector.cert_store_mut().add_cert(root.clone())?;
    }
    connector.set_verify(SslVerifyMode::PEER);

    Ok(connector.build())
}

/// Run the client side of the handshake on `stream`
///
/// Handshake failures are reported as [`ProxyError::UpstreamUnreachable`].
pub async fn connect_tls(connector: &SslConnector, stream: TcpStream) -> Result<SslStream<TcpStream>> {
    let ssl = connector
        .configure()?
        .verify_hostname(false)
        .use_server_name_indication(false)
        .into_ssl("")?;
    let mut stream = SslStream::new(ssl, stream)?;

    std::pin::Pin::new(&mut stream)
        .connect()
        .await
        .map_err(|e| ProxyError::UpstreamUnreachable(format!("TLS handshake failed: {}", e)))?;

    debug!("TLS handshake with upstream successful");
    Ok(stream)
}
