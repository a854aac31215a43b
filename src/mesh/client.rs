//! Mesh client

use log::{debug, info, warn};
use socket2::SockRef;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_openssl::SslStream;

use crate::api::{Connection, Frame, FrameStream, NetworkServiceRequest};
use crate::chain::{self, Chain};
use crate::common::{Context, ProxyError, Result};
use crate::config::ProxyConfig;
use crate::identity::{IdentitySource, JwtTokenIssuer, TokenIssuer};
use crate::tls::{connect_tls, create_tls_connector, PeerInfo};

struct Inner {
    config: Arc<ProxyConfig>,
    identity: Arc<dyn IdentitySource>,
    chain: Chain,
}

/// Client of the upstream mesh endpoint
///
/// Cheap to clone. Every [`MeshSession`] owns its own TLS connection, so
/// distinct sessions proceed in parallel.
#[derive(Clone)]
pub struct MeshClient {
    inner: Arc<Inner>,
}

impl MeshClient {
    pub fn new(config: Arc<ProxyConfig>, identity: Arc<dyn IdentitySource>) -> Self {
        let issuer: Arc<dyn TokenIssuer> =
            Arc::new(JwtTokenIssuer::new(Arc::clone(&identity), config.max_token_lifetime));
        Self::with_issuer(config, identity, issuer)
    }

    /// Client whose path tokens come from `issuer`; TLS still uses `identity`
    pub fn with_issuer(
        config: Arc<ProxyConfig>,
        identity: Arc<dyn IdentitySource>,
        issuer: Arc<dyn TokenIssuer>,
    ) -> Self {
        let chain = chain::client_chain(&config.name, issuer, config.max_token_lifetime);
        debug!("Mesh client chain: {:?}", chain.names());

        Self {
            inner: Arc::new(Inner { config, identity, chain }),
        }
    }

    /// Name this client adds to connection paths
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    /// Start a session with its own upstream channel
    pub fn session(&self) -> MeshSession {
        MeshSession {
            client: self.clone(),
            channel: None,
        }
    }

    /// One-shot `Request` on a fresh channel
    pub async fn request(&self, ctx: &Context, request: NetworkServiceRequest) -> Result<Connection> {
        self.session().request(ctx, request).await
    }

    /// One-shot `Close` on a fresh channel
    pub async fn close(&self, ctx: &Context, connection: &Connection) -> Result<()> {
        self.session().close(ctx, connection).await
    }

    async fn dial(&self) -> Result<MeshChannel> {
        let config = &self.inner.config;
        let svid = self.inner.identity.svid()?;
        // built per dial so a rotated SVID is presented on the next channel
        let connector = create_tls_connector(&svid)?;
        let addr = config.connect_to.socket_addr()?;

        let tcp = timeout(config.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProxyError::UpstreamUnreachable(format!("timed out connecting to {}", addr)))?
            .map_err(|e| ProxyError::UpstreamUnreachable(format!("cannot connect to {}: {}", addr, e)))?;
        tcp.set_nodelay(true)?;
        SockRef::from(&tcp).set_keepalive(true)?;

        let stream = timeout(config.dial_timeout, connect_tls(&connector, tcp))
            .await
            .map_err(|_| ProxyError::UpstreamUnreachable(format!("TLS handshake with {} timed out", addr)))??;

        let peer = PeerInfo::from_ssl(stream.ssl());
        info!("Connected to mesh endpoint {} ({})", addr, peer.name());

        Ok(MeshChannel {
            frames: FrameStream::new(stream),
            peer,
        })
    }
}

struct MeshChannel {
    frames: FrameStream<SslStream<TcpStream>>,
    peer: PeerInfo,
}

/// Serialized sequence of calls on one upstream channel
///
/// The channel is dialed lazily and dropped after any transport failure, so
/// the next call starts over on a fresh connection.
pub struct MeshSession {
    client: MeshClient,
    channel: Option<MeshChannel>,
}

impl MeshSession {
    pub fn client(&self) -> &MeshClient {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    async fn channel(&mut self) -> Result<&mut MeshChannel> {
        if self.channel.is_none() {
            self.channel = Some(self.client.dial().await?);
        }
        self.channel
            .as_mut()
            .ok_or_else(|| ProxyError::UpstreamUnreachable("no upstream channel".to_string()))
    }

    /// Send `request` upstream after running the client chain on it
    ///
    /// On success the returned connection's path index is reset to the
    /// caller's index. If `ctx` ends while the call is in flight, a bounded
    /// best-effort `Close` is sent on a fresh channel.
    pub async fn request(&mut self, ctx: &Context, mut request: NetworkServiceRequest) -> Result<Connection> {
        let caller_index = request.connection.as_ref().map_or(0, |c| c.path.index);
        let inner = Arc::clone(&self.client.inner);

        let result = ctx
            .run(async {
                let channel = self.channel().await?;
                inner.chain.process_request(&mut request, &channel.peer)?;
                let reply = channel
                    .frames
                    .call(&Frame::Request {
                        request: request.clone(),
                    })
                    .await?;
                reply.into_connection()
            })
            .await;

        match result {
            Ok(mut connection) => {
                connection.path.index = caller_index;
                debug!(
                    "Connection {} established with {} path segment(s)",
                    connection.id,
                    connection.path.len()
                );
                Ok(connection)
            }
            Err(ProxyError::Cancelled(reason)) => {
                // the request may have reached the upstream already
                self.channel = None;
                if let Some(connection) = request.connection.filter(|c| !c.id.is_empty()) {
                    self.abandon(&connection).await;
                }
                Err(ProxyError::Cancelled(reason))
            }
            Err(e) => {
                if is_transport_failure(&e) {
                    self.channel = None;
                }
                Err(e.upstream())
            }
        }
    }

    /// Close `connection` upstream
    ///
    /// Closing an unknown or already closed connection succeeds.
    pub async fn close(&mut self, ctx: &Context, connection: &Connection) -> Result<()> {
        if connection.id.is_empty() {
            return Ok(());
        }

        let inner = Arc::clone(&self.client.inner);
        let mut connection = connection.clone();
        let result = ctx
            .run(async {
                let channel = self.channel().await?;
                inner.chain.process_close(&mut connection, &channel.peer)?;
                let reply = channel
                    .frames
                    .call(&Frame::Close {
                        connection: connection.clone(),
                    })
                    .await?;
                reply.into_closed()
            })
            .await;

        match result {
            Ok(()) => {
                debug!("Connection {} closed upstream", connection.id);
                Ok(())
            }
            Err(e) => {
                if is_transport_failure(&e) || matches!(e, ProxyError::Cancelled(_)) {
                    self.channel = None;
                }
                Err(match e {
                    ProxyError::CloseFailed(_) => e,
                    other => ProxyError::CloseFailed(format!("connection {}: {}", connection.id, other.message())),
                })
            }
        }
    }

    async fn abandon(&self, connection: &Connection) {
        let close_timeout = self.client.inner.config.close_timeout;
        let ctx = Context::background().with_timeout(close_timeout);
        let mut cleanup = self.client.session();
        if let Err(e) = cleanup.close(&ctx, connection).await {
            warn!("Best-effort close of connection {} failed: {}", connection.id, e);
        }
    }
}

fn is_transport_failure(err: &ProxyError) -> bool {
    matches!(
        err,
        ProxyError::Io(_) | ProxyError::Ssl(_) | ProxyError::UpstreamUnreachable(_) | ProxyError::Protocol(_)
    )
}
