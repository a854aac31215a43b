//! Request processing chain
//!
//! Requests pass through an ordered list of stages before they leave (mesh
//! client) or after they arrive (mesh endpoint). Each stage may inspect or
//! augment the request, or stop it with an error. Chains are composed once
//! at startup and shared by every session.

mod authorize;
mod update_path;
mod update_token;

use log::trace;
use std::sync::Arc;
use std::time::Duration;

use crate::api::{Connection, NetworkServiceRequest};
use crate::common::Result;
use crate::identity::TokenIssuer;
use crate::tls::PeerInfo;

pub use authorize::{AllowAll, Authorize, AuthorizationPolicy, DenyAll};
pub use update_path::UpdatePath;
pub use update_token::{UpdateCallerToken, UpdateToken};

/// One stage of a [`Chain`]
pub trait RequestStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Process an outgoing or incoming request
    ///
    /// `peer` is the authenticated other end of the mesh transport.
    fn on_request(&self, request: &mut NetworkServiceRequest, peer: &PeerInfo) -> Result<()>;

    /// Process a close
    fn on_close(&self, _connection: &mut Connection, _peer: &PeerInfo) -> Result<()> {
        Ok(())
    }
}

/// Ordered list of request stages
#[derive(Default)]
pub struct Chain {
    stages: Vec<Box<dyn RequestStage>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage
    pub fn with(mut self, stage: impl RequestStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in processing order
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage on `request`, stopping at the first error
    pub fn process_request(&self, request: &mut NetworkServiceRequest, peer: &PeerInfo) -> Result<()> {
        for stage in &self.stages {
            trace!("Request stage: {}", stage.name());
            stage.on_request(request, peer)?;
        }
        Ok(())
    }

    /// Run every stage on `connection`, stopping at the first error
    pub fn process_close(&self, connection: &mut Connection, peer: &PeerInfo) -> Result<()> {
        for stage in &self.stages {
            trace!("Close stage: {}", stage.name());
            stage.on_close(connection, peer)?;
        }
        Ok(())
    }
}

/// Chain run by the mesh client before a request is sent upstream
pub fn client_chain(name: &str, issuer: Arc<dyn TokenIssuer>, max_token_lifetime: Duration) -> Chain {
    Chain::new()
        .with(UpdateCallerToken::new(name, Arc::clone(&issuer), max_token_lifetime))
        .with(UpdatePath::new(name))
        .with(UpdateToken::new(issuer, max_token_lifetime))
}

/// Chain run by the mesh endpoint on every incoming request
pub fn endpoint_chain(audience: Option<String>, policy: Arc<dyn AuthorizationPolicy>) -> Chain {
    Chain::new().with(Authorize::new(policy).with_audience(audience))
}
