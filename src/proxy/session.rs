//! Per-session orchestration
//!
//! Every local session drives one upstream connection through
//! `Ready → Connected → Closing → Closed`, with `Failed` absorbing once the
//! upstream denies authorization. Requests, closes and token renewal of a
//! session are serialized through one lock so path updates are applied in
//! call order.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::errors::ErrorSender;
use crate::api::{Connection, NetworkServiceRequest};
use crate::common::{Context, ProxyError, Result};
use crate::mesh::{MeshClient, MeshSession};

/// Lower bound between two renewals
pub const MIN_RENEWAL_DELAY: Duration = Duration::from_millis(10);

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No live upstream connection; requests are accepted
    Ready,
    /// Upstream connection established and being renewed
    Connected,
    /// Shutdown in progress
    Closing,
    /// Shut down
    Closed,
    /// Upstream denied authorization; no further requests are accepted
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Ready => "ready",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Delay before renewing a token that expires at `expires`
///
/// One third of the remaining lifetime, at least [`MIN_RENEWAL_DELAY`] but
/// never more than half of what is left.
pub fn renewal_delay(expires: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let remaining = (expires - now).to_std().unwrap_or(Duration::ZERO);
    (remaining / 3).max(MIN_RENEWAL_DELAY).min(remaining / 2)
}

struct SessionInner {
    state: SessionState,
    mesh: MeshSession,
    live: Option<Connection>,
    caller_index: u32,
    renewal: Option<Context>,
    failure: Option<ProxyError>,
}

impl SessionInner {
    fn stop_renewal(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.cancel();
        }
    }

    fn check_open(&self) -> Result<()> {
        match self.state {
            SessionState::Failed => Err(ProxyError::SessionFailed(
                self.failure
                    .as_ref()
                    .map_or_else(|| "session failed".to_string(), |e| e.to_string()),
            )),
            SessionState::Closing | SessionState::Closed => {
                Err(ProxyError::SessionFailed(format!("session is {}", self.state)))
            }
            SessionState::Ready | SessionState::Connected => Ok(()),
        }
    }

    /// Apply the state transition for a failed upstream call
    fn record_failure(&mut self, err: &ProxyError) {
        match err {
            ProxyError::AuthorizationDenied(_) => {
                self.stop_renewal();
                self.state = SessionState::Failed;
                self.failure = Some(err.clone());
            }
            ProxyError::Cancelled(_) => {}
            _ if self.state == SessionState::Connected => {
                self.stop_renewal();
                self.state = SessionState::Ready;
            }
            _ => {}
        }
    }
}

/// Orchestrator of one local session
#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<SessionInner>>,
    errors: ErrorSender,
    ctx: Context,
    close_timeout: Duration,
}

impl Session {
    /// Start a session in `Ready`; it ends when `ctx` does
    pub fn new(ctx: &Context, mesh: &MeshClient, errors: ErrorSender) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                state: SessionState::Ready,
                mesh: mesh.session(),
                live: None,
                caller_index: 0,
                renewal: None,
                failure: None,
            })),
            errors,
            ctx: ctx.child(),
            close_timeout: mesh.config().close_timeout,
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Upstream connection currently held by this session
    pub async fn live_connection(&self) -> Option<Connection> {
        self.inner.lock().await.live.clone()
    }

    fn report(&self, err: &ProxyError) {
        if !matches!(err, ProxyError::Cancelled(_)) {
            self.errors.send(err.clone());
        }
    }

    /// Forward a local request upstream
    ///
    /// Errors are returned and also pushed on the error channel.
    pub async fn request(&self, request: NetworkServiceRequest) -> Result<Connection> {
        let mut inner = self.inner.lock().await;
        if let Err(e) = inner.check_open() {
            self.report(&e);
            return Err(e);
        }

        let caller_index = request.connection.as_ref().map_or(0, |c| c.path.index);
        match request_upstream(&mut inner.mesh, &self.ctx, request).await {
            Ok(connection) => {
                inner.stop_renewal();
                if let Some(previous) = inner.live.replace(connection.clone()) {
                    if previous.id != connection.id {
                        let ctx = self.ctx.with_timeout(self.close_timeout);
                        if let Err(e) = inner.mesh.close(&ctx, &previous).await {
                            warn!("Close of replaced connection {} failed: {}", previous.id, e);
                            self.report(&e);
                        }
                    }
                }
                inner.caller_index = caller_index;
                if inner.state != SessionState::Connected {
                    info!("Session connected: {}", connection.id);
                }
                inner.state = SessionState::Connected;
                self.start_renewal(&mut inner, &connection);
                Ok(connection)
            }
            Err(e) => {
                warn!("Request failed: {}", e);
                inner.record_failure(&e);
                self.report(&e);
                Err(e)
            }
        }
    }

    /// Tear down the upstream connection on behalf of the local caller
    ///
    /// Closing an unknown or already closed connection is a no-op. The
    /// session returns to `Ready` and may be used for a new request.
    pub async fn close(&self, connection: Connection) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let live = match inner.live.take() {
            Some(live) if connection.id.is_empty() || live.id == connection.id => live,
            other => {
                inner.live = other;
                debug!("Close of unknown connection '{}' ignored", connection.id);
                return Ok(());
            }
        };

        inner.stop_renewal();
        if inner.state == SessionState::Connected {
            inner.state = SessionState::Ready;
        }

        let ctx = self.ctx.with_timeout(self.close_timeout);
        match inner.mesh.close(&ctx, &live).await {
            Ok(()) => {
                info!("Session closed connection {}", live.id);
                Ok(())
            }
            Err(e) => {
                warn!("Close failed: {}", e);
                self.report(&e);
                Err(e)
            }
        }
    }

    /// Close the upstream connection, if any, and end the session
    ///
    /// The upstream close is bounded by the configured close timeout and runs
    /// even when the session's context has already been cancelled.
    pub async fn shutdown(&self) {
        self.ctx.cancel();
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return;
        }

        let failed = inner.state == SessionState::Failed;
        if !failed {
            inner.state = SessionState::Closing;
        }
        inner.stop_renewal();

        if let Some(live) = inner.live.take() {
            let ctx = Context::background().with_timeout(self.close_timeout);
            match inner.mesh.close(&ctx, &live).await {
                Ok(()) => debug!("Connection {} closed on shutdown", live.id),
                Err(e) => {
                    warn!("Close on shutdown failed: {}", e);
                    self.report(&e);
                }
            }
        }

        if !failed {
            inner.state = SessionState::Closed;
        }
    }

    fn start_renewal(&self, inner: &mut SessionInner, connection: &Connection) {
        let Some(expires) = connection.path.earliest_expiry() else {
            return;
        };

        let ctx = self.ctx.child();
        inner.renewal = Some(ctx.clone());
        let session = self.clone();
        tokio::spawn(async move { session.renew_loop(ctx, expires).await });
    }

    async fn renew_loop(self, ctx: Context, mut expires: DateTime<Utc>) {
        loop {
            let delay = renewal_delay(expires, Utc::now());
            debug!("Next token renewal in {:?}", delay);
            tokio::select! {
                _ = ctx.done() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.renew(&ctx).await {
                Some(next) => expires = next,
                None => return,
            }
        }
    }

    /// Refresh the live connection; returns the new earliest expiry
    async fn renew(&self, ctx: &Context) -> Option<DateTime<Utc>> {
        let mut inner = self.inner.lock().await;
        if ctx.is_done() || inner.state != SessionState::Connected {
            return None;
        }
        let mut connection = inner.live.clone()?;
        connection.path.index = inner.caller_index;
        let request = NetworkServiceRequest::new(connection);

        match request_upstream(&mut inner.mesh, ctx, request).await {
            Ok(connection) => {
                let next = connection.path.earliest_expiry();
                debug!("Renewed connection {} until {:?}", connection.id, next);
                inner.live = Some(connection);
                next
            }
            Err(ProxyError::Cancelled(_)) => None,
            Err(e) => {
                warn!("Token renewal failed: {}", e);
                // the renewal context is ours; drop it without cancelling
                inner.renewal = None;
                inner.record_failure(&e);
                self.report(&e);
                None
            }
        }
    }
}

/// Send `request` upstream, retrying once right away on `TokenExpired`
async fn request_upstream(
    mesh: &mut MeshSession,
    ctx: &Context,
    request: NetworkServiceRequest,
) -> Result<Connection> {
    match mesh.request(ctx, request.clone()).await {
        Err(ProxyError::TokenExpired(reason)) => {
            debug!("Token could not be minted ({}), retrying once", reason);
            mesh.request(ctx, request).await
        }
        result => result,
    }
}
