//! TLS handling module
//!
//! Mutual TLS between the proxy and the mesh endpoint. Both sides present
//! their SVID and verify the peer against their trust bundle; hostnames are
//! not checked since mesh identities are SPIFFE ids, not DNS names.

mod acceptor;
mod connector;
mod peer;

pub use acceptor::{accept_tls, create_mtls_acceptor, ClientCertMode};
pub use connector::{connect_tls, create_tls_connector};
pub use peer::PeerInfo;
