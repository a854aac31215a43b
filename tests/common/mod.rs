//! Shared helpers for integration tests
//!
//! Every test gets its own trust domain and temporary directory; the proxy
//! reads its SVID from files written there, the mesh endpoint uses a static
//! identity issued by the same CA.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nsc_proxy::chain::AuthorizationPolicy;
use nsc_proxy::common::{init_logger, MeshUrl};
use nsc_proxy::identity::{IdentitySource, SelfSignedCa, StaticIdentitySource};
use nsc_proxy::mesh::{self, MeshEndpoint};
use nsc_proxy::{new_proxy_client, run_proxy_client, Context, ErrorReceiver, NetworkServiceRequest, PathSegment, ProxyConfig};
use tempfile::TempDir;

/// Placeholder token a local caller puts in its own segment
pub const TEST_TOKEN: &str = "TestToken";

pub struct Pki {
    pub dir: TempDir,
    pub ca: SelfSignedCa,
}

impl Pki {
    pub fn new() -> Self {
        init_logger("debug");
        Self {
            dir: tempfile::tempdir().unwrap(),
            ca: SelfSignedCa::new("example.org").unwrap(),
        }
    }

    /// Write an SVID for `workload` and return cert, key and bundle paths
    pub fn write(&self, workload: &str) -> (PathBuf, PathBuf, PathBuf) {
        let svid = self.ca.issue(workload).unwrap();
        self.ca.write_svid(&svid, &self.dir.path().join(workload)).unwrap()
    }

    pub fn identity(&self, workload: &str) -> Arc<dyn IdentitySource> {
        Arc::new(StaticIdentitySource::new(self.ca.issue(workload).unwrap()))
    }
}

/// Start a mesh endpoint on an ephemeral port
pub async fn start_endpoint(ctx: &Context, pki: &Pki, policy: Arc<dyn AuthorizationPolicy>) -> (MeshEndpoint, SocketAddr) {
    let identity = pki.identity("nse");
    let endpoint = MeshEndpoint::new(identity.as_ref(), policy).unwrap();
    let url: MeshUrl = "tcp://127.0.0.1:0".parse().unwrap();
    let addr = mesh::serve(ctx, &url, endpoint.clone()).await.unwrap();
    (endpoint, addr)
}

/// Proxy configuration pointing at `upstream` and listening on an ephemeral port
pub fn proxy_config(pki: &Pki, upstream: SocketAddr, max_token_lifetime: Duration) -> ProxyConfig {
    let (cert, key, bundle) = pki.write("proxy-nsc");
    let mut config = ProxyConfig::new(
        "proxy-nsc",
        MeshUrl::tcp(upstream),
        "tcp://:0".parse().unwrap(),
        max_token_lifetime,
    )
    .with_identity_paths(cert, key, bundle);
    config.identity_timeout = Duration::from_secs(5);
    config.dial_timeout = Duration::from_secs(2);
    config.close_timeout = Duration::from_secs(2);
    config
}

/// Construct and run the proxy; returns its local address and error channel
pub async fn start_proxy(ctx: &Context, config: ProxyConfig) -> (SocketAddr, ErrorReceiver) {
    let config = Arc::new(config);
    let (server, mesh) = new_proxy_client(ctx, Arc::clone(&config)).await.unwrap();
    let addr = server.local_addr();
    let errors = run_proxy_client(ctx, &config, server, mesh);
    (addr, errors)
}

/// Request from a local caller that already put its own segment in the path
pub fn caller_request() -> NetworkServiceRequest {
    let mut request = NetworkServiceRequest::default();
    request.connection_mut().path.path_segments.push(PathSegment {
        name: "nsc".to_string(),
        id: "nsc-1".to_string(),
        token: TEST_TOKEN.to_string(),
        expires: Utc::now() + chrono::Duration::hours(1),
    });
    request
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
