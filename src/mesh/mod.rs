//! Mesh-facing side
//!
//! [`MeshClient`] issues `Request`/`Close` calls to the configured upstream
//! over mutual TLS. [`MeshEndpoint`] is a terminal mesh endpoint that
//! authorizes and records those calls; it serves as the upstream in local
//! development and tests.

pub mod client;
pub mod endpoint;

pub use client::{MeshClient, MeshSession};
pub use endpoint::{serve, MeshEndpoint};
