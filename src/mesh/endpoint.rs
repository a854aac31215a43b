//! Terminal mesh endpoint

use log::{debug, error, info, warn};
use openssl::ssl::SslAcceptor;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::api::{Connection, Frame, FrameStream, NetworkServiceRequest, State};
use crate::chain::{self, AuthorizationPolicy, Chain};
use crate::common::{Context, MeshUrl, ProxyError, Result};
use crate::identity::IdentitySource;
use crate::tls::{accept_tls, create_mtls_acceptor, ClientCertMode, PeerInfo};

struct Inner {
    name: String,
    acceptor: SslAcceptor,
    chain: Chain,
    connections: Mutex<HashMap<String, Connection>>,
}

/// Mesh endpoint accepting authorized connections
///
/// Requires a client certificate from its trust bundle, runs the
/// authorization chain on every request and keeps the accepted connections
/// until they are closed. It does not add a path segment of its own.
#[derive(Clone)]
pub struct MeshEndpoint {
    inner: Arc<Inner>,
}

impl MeshEndpoint {
    pub fn new(identity: &dyn IdentitySource, policy: Arc<dyn AuthorizationPolicy>) -> Result<Self> {
        let svid = identity.svid()?;
        let acceptor = create_mtls_acceptor(&svid, ClientCertMode::Required)?;
        let chain = chain::endpoint_chain(Some(svid.id().to_string()), policy);

        Ok(Self {
            inner: Arc::new(Inner {
                name: svid.id().to_string(),
                acceptor,
                chain,
                connections: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Identity of this endpoint
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn connections(&self) -> std::sync::MutexGuard<'_, HashMap<String, Connection>> {
        self.inner.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    /// Open connection by id
    pub fn connection(&self, id: &str) -> Option<Connection> {
        self.connections().get(id).cloned()
    }

    fn handle_request(&self, mut request: NetworkServiceRequest, peer: &PeerInfo) -> Result<Connection> {
        self.inner.chain.process_request(&mut request, peer)?;

        let mut connection = request
            .connection
            .ok_or_else(|| ProxyError::Protocol("request carries no connection".to_string()))?;
        if connection.id.is_empty() {
            connection.id = Uuid::new_v4().to_string();
        }
        connection.state = State::Up;

        let refreshed = self
            .connections()
            .insert(connection.id.clone(), connection.clone())
            .is_some();
        info!(
            "{} connection {} from {} ({} path segment(s))",
            if refreshed { "Refreshed" } else { "Accepted" },
            connection.id,
            peer.name(),
            connection.path.len()
        );
        Ok(connection)
    }

    fn handle_close(&self, mut connection: Connection, peer: &PeerInfo) -> Result<()> {
        self.inner.chain.process_close(&mut connection, peer)?;
        match self.connections().remove(&connection.id) {
            Some(_) => info!("Closed connection {}", connection.id),
            None => debug!("Close of unknown connection {}", connection.id),
        }
        Ok(())
    }

    async fn handle_stream(&self, ctx: Context, tcp: TcpStream) -> Result<()> {
        let stream = accept_tls(&self.inner.acceptor, tcp).await?;
        let peer = PeerInfo::from_ssl(stream.ssl());
        let mut frames = FrameStream::new(stream);

        loop {
            let frame = tokio::select! {
                _ = ctx.done() => break,
                frame = frames.read_frame() => frame,
            };

            let reply = match frame {
                Ok(None) => break,
                Ok(Some(Frame::Request { request })) => match self.handle_request(request, &peer) {
                    Ok(connection) => Frame::Connection { connection },
                    Err(e) => Frame::error(&e),
                },
                Ok(Some(Frame::Close { connection })) => match self.handle_close(connection, &peer) {
                    Ok(()) => Frame::Closed,
                    Err(e) => Frame::error(&e),
                },
                Ok(Some(other)) => Frame::error(&ProxyError::Protocol(format!("unexpected '{}' frame", other.name()))),
                Err(e @ ProxyError::Protocol(_)) => Frame::error(&e),
                Err(e) => return Err(e),
            };
            frames.write_frame(&reply).await?;
        }

        Ok(())
    }
}

/// Bind `url` and serve `endpoint` until `ctx` ends
///
/// Returns the bound address once the listener is up.
pub async fn serve(ctx: &Context, url: &MeshUrl, endpoint: MeshEndpoint) -> Result<SocketAddr> {
    let addr = url.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::BindError(format!("cannot bind {}: {}", addr, e)))?;
    let local_addr = listener.local_addr()?;
    info!("Mesh endpoint {} listening on {}", endpoint.name(), local_addr);

    tokio::spawn(accept_loop(ctx.child(), listener, endpoint));
    Ok(local_addr)
}

async fn accept_loop(ctx: Context, listener: TcpListener, endpoint: MeshEndpoint) {
    let mut tasks = JoinSet::new();

    loop {
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                error!("Task error: {}", e);
            }
        }

        let accepted = tokio::select! {
            _ = ctx.done() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                debug!("Mesh endpoint accepted {}", peer_addr);
                let endpoint = endpoint.clone();
                let ctx = ctx.child();
                tasks.spawn(async move {
                    if let Err(e) = endpoint.handle_stream(ctx, stream).await {
                        warn!("Mesh stream from {} ended: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => error!("Error accepting connection: {}", e),
        }
    }

    drop(listener);
    tasks.abort_all();
    info!("Mesh endpoint {} stopped", endpoint.name());
}
