//! Proxy construction and run loop
//!
//! [`new_proxy_client`] performs every fallible startup step (configuration,
//! workload identity, local bind) and reports failures synchronously.
//! [`run_proxy_client`] then runs the proxy in the background and hands back
//! the error channel.

use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use super::errors::{error_channel, ErrorReceiver};
use super::server::ProxyServer;
use crate::common::{Context, Result};
use crate::config::{validate_config, ConfigValidator, ProxyConfig};
use crate::identity::{FileIdentitySource, IdentitySource};
use crate::mesh::MeshClient;

/// Interval between identity file checks while waiting for attestation
pub const IDENTITY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Extra time granted to sessions on shutdown on top of the close timeout
pub const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

/// Create the proxy's local server and mesh client
///
/// Waits up to `identity_timeout` for the workload identity files to appear.
///
/// # Errors
///
/// * [`ProxyError::ConfigInvalid`](crate::common::ProxyError::ConfigInvalid) for a malformed configuration
/// * [`ProxyError::IdentityUnavailable`](crate::common::ProxyError::IdentityUnavailable) if no valid SVID shows up in time
/// * [`ProxyError::BindError`](crate::common::ProxyError::BindError) if `listen_on` cannot be bound
pub async fn new_proxy_client(ctx: &Context, config: Arc<ProxyConfig>) -> Result<(ProxyServer, MeshClient)> {
    validate_config(&config)?;
    for warning in config.check_warnings() {
        warn!("{}", warning);
    }

    let source = FileIdentitySource::from_config(&config);
    let wait_ctx = ctx.with_timeout(config.identity_timeout);
    let svid = source.wait_for(&wait_ctx, IDENTITY_POLL_INTERVAL).await?;
    info!("SVID: {}", svid.id());
    info!("SVID fingerprint: {}", svid.fingerprint()?);

    new_proxy_client_with_identity(ctx, config, Arc::new(source)).await
}

/// Create the proxy with an already established identity source
pub async fn new_proxy_client_with_identity(
    ctx: &Context,
    config: Arc<ProxyConfig>,
    identity: Arc<dyn IdentitySource>,
) -> Result<(ProxyServer, MeshClient)> {
    validate_config(&config)?;
    identity.svid()?;

    let server = ctx.run(ProxyServer::bind(&config)).await?;
    let mesh = MeshClient::new(config, identity);
    Ok((server, mesh))
}

/// Run the proxy until `ctx` ends
///
/// Returns immediately. The receiver yields asynchronous failures and
/// returns `None` once the proxy has shut down completely.
pub fn run_proxy_client(ctx: &Context, config: &ProxyConfig, server: ProxyServer, mesh: MeshClient) -> ErrorReceiver {
    let (errors, receiver) = error_channel(config.error_buffer);
    let grace = config.close_timeout + SHUTDOWN_SLACK;

    info!("Running proxy {} on {} -> {}", config.name, server.listen_url(), config.connect_to);
    tokio::spawn(server.serve(ctx.child(), mesh, errors, grace));
    receiver
}
