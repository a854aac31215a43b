//! NSC Proxy: local bridge into a Network Service Mesh
//!
//! Local callers dial a plain TCP listener and speak a simple
//! `Request`/`Close` protocol. For each local session the proxy opens a
//! mutually authenticated TLS connection to the upstream mesh endpoint,
//! appends its own path segment with a freshly minted identity token,
//! renews that token before it expires and closes the upstream connection
//! when the session ends. Faults that happen in the background are reported
//! on a bounded error channel instead of bringing the process down.
//!
//! # Main Features
//!
//! - mTLS towards the mesh with X.509 SVIDs read from disk
//! - Identity-bound JWT path tokens with automatic renewal
//! - Request processing chains composed once at startup
//! - Non-blocking, drop-oldest error channel
//!
//! # Example
//!
//! ```no_run
//! use nsc_proxy::{new_proxy_client, run_proxy_client, Context, ProxyConfig, Result};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Arc::new(ProxyConfig::default());
//!     let ctx = Context::background();
//!
//!     let (server, mesh) = new_proxy_client(&ctx, Arc::clone(&config)).await?;
//!     let mut errors = run_proxy_client(&ctx, &config, server, mesh);
//!
//!     while let Some(err) = errors.recv().await {
//!         eprintln!("proxy error: {}", err);
//!     }
//!     Ok(())
//! }
//! ```

// Public modules
pub mod api;
pub mod chain;
pub mod common;
pub mod config;
pub mod identity;
pub mod mesh;
pub mod proxy;
pub mod tls;

// Re-export commonly used items
pub use api::{Connection, NetworkServiceRequest, Path, PathSegment};
pub use common::{Context, ProxyError, Result};
pub use config::ProxyConfig;
pub use mesh::{MeshClient, MeshEndpoint};
pub use proxy::{
    new_proxy_client, new_proxy_client_with_identity, run_proxy_client, ErrorReceiver, LocalClient, ProxyServer,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
