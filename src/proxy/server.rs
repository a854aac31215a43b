//! Local proxy server
//!
//! Accepts plain TCP sessions from local callers and runs one session
//! handler per caller. The server never looks into paths or tokens.

use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use super::errors::ErrorSender;
use super::handler::handle_local_session;
use crate::common::{Context, MeshUrl, ProxyError, Result};
use crate::config::ProxyConfig;
use crate::mesh::MeshClient;

/// Local listener of the proxy
///
/// Bound at construction so that an ephemeral `listen_on` port is known
/// before the proxy runs.
#[derive(Debug)]
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    scheme: String,
}

impl ProxyServer {
    /// Bind `config.listen_on`
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::BindError`] if the address is malformed or
    /// already in use.
    pub async fn bind(config: &ProxyConfig) -> Result<Self> {
        let addr = config
            .listen_on
            .socket_addr()
            .map_err(|e| ProxyError::BindError(format!("invalid listen address {}: {}", config.listen_on, e.message())))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::BindError(format!("cannot bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        info!("Proxy listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            scheme: config.listen_on.scheme().to_string(),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound address as a URL, with any ephemeral port resolved
    pub fn listen_url(&self) -> MeshUrl {
        MeshUrl::new(self.scheme.clone(), self.local_addr.to_string())
    }

    /// Accept local sessions until `ctx` ends
    ///
    /// Once cancelled the listener is closed, running sessions get `grace`
    /// to close their upstream connections and are aborted afterwards.
    pub async fn serve(self, ctx: Context, mesh: MeshClient, errors: ErrorSender, grace: Duration) {
        let mut tasks = JoinSet::new();

        loop {
            // Check for completed tasks and log any errors
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    error!("Task error: {}", e);
                }
            }

            let accepted = tokio::select! {
                _ = ctx.done() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    info!("Accepted local session from {}", peer_addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Cannot set TCP_NODELAY for {}: {}", peer_addr, e);
                    }

                    let ctx = ctx.child();
                    let mesh = mesh.clone();
                    let errors = errors.clone();
                    tasks.spawn(async move {
                        if let Err(e) = handle_local_session(ctx, stream, peer_addr, mesh, errors).await {
                            warn!("Local session {} ended with error: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }

        drop(self.listener);
        info!("Proxy stopped accepting on {}, closing {} session(s)", self.local_addr, tasks.len());

        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!("Task error: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("Sessions did not close within {:?}, aborting", grace);
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        info!("Proxy shut down");
    }
}
