//! Default configuration values
//!
//! This module provides default values for configuration options.
//! It is the single source of truth for defaults across the application.

use std::path::PathBuf;
use std::time::Duration;

use crate::common::MeshUrl;

/// Environment variable prefix for all configuration options
pub const ENV_PREFIX: &str = "NSM";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "nsc-proxy.json";

/// Default proxy name, used as this hop's path segment name
pub const NAME_STR: &str = "nsc";

/// Default log level as string
pub const LOG_LEVEL_STR: &str = "info";

/// Default SVID certificate path
pub const CERT_PATH_STR: &str = "/run/spire/svid/svid.pem";

/// Default SVID private key path
pub const KEY_PATH_STR: &str = "/run/spire/svid/svid_key.pem";

/// Default trust bundle path
pub const BUNDLE_PATH_STR: &str = "/run/spire/svid/bundle.pem";

/// Shortest token lifetime the proxy accepts; token expiry has second granularity
pub const MIN_TOKEN_LIFETIME: Duration = Duration::from_secs(1);

pub fn name() -> String {
    NAME_STR.to_string()
}

/// Default upstream mesh endpoint
pub fn connect_to() -> MeshUrl {
    MeshUrl::new("tcp", "127.0.0.1:5001")
}

/// Default local listen address
pub fn listen_on() -> MeshUrl {
    MeshUrl::new("tcp", "127.0.0.1:5000")
}

/// Default maximum token lifetime (24h)
pub fn max_token_lifetime() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

pub fn log_level() -> String {
    LOG_LEVEL_STR.to_string()
}

pub fn cert_path() -> PathBuf {
    PathBuf::from(CERT_PATH_STR)
}

pub fn key_path() -> PathBuf {
    PathBuf::from(KEY_PATH_STR)
}

pub fn bundle_path() -> PathBuf {
    PathBuf::from(BUNDLE_PATH_STR)
}

/// How long to wait for the workload identity at startup
pub fn identity_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Upstream dial and TLS handshake timeout
pub fn dial_timeout() -> Duration {
    Duration::from_secs(15)
}

/// Upper bound for an upstream `Close` during shutdown
pub fn close_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Capacity of the asynchronous error channel
pub fn error_buffer() -> usize {
    16
}
