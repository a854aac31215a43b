//! Local proxy
//!
//! The local-facing half of the proxy: a plain TCP listener whose sessions
//! are each driven through their own upstream mesh connection, and the
//! error channel that reports what goes wrong along the way.

pub mod errors;
mod handler;
mod local_client;
mod orchestrator;
mod server;
pub mod session;

pub use errors::{error_channel, ErrorReceiver, ErrorSender};
pub use local_client::LocalClient;
pub use orchestrator::{new_proxy_client, new_proxy_client_with_identity, run_proxy_client};
pub use server::ProxyServer;
pub use session::{Session, SessionState};
