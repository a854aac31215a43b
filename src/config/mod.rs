//! Configuration module
//!
//! This module handles application configuration, including loading from
//! different sources (files, environment variables, command line arguments)
//! and validating the configuration.
//!
//! The configuration is read once at construction and shared immutably as
//! `Arc<ProxyConfig>`; it is never re-read while the proxy runs.

mod defaults;
pub mod duration;
mod loader;
mod merger;
mod validator;

pub use self::loader::ConfigLoader;
pub use self::merger::{ConfigMerger, ConfigOverrides};
pub use self::validator::{validate_config, ConfigValidator};
pub use defaults::{DEFAULT_CONFIG_FILE, ENV_PREFIX, MIN_TOKEN_LIFETIME};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::common::MeshUrl;
use duration::serde_duration;

/// Proxy configuration
///
/// Contains all configuration options needed by the proxy. Supports loading
/// from configuration files, environment variables and command-line arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    // --- Mesh settings ---

    /// Name of this proxy, used as its path segment name
    #[serde(default = "defaults::name")]
    pub name: String,

    /// Upstream mesh endpoint
    #[serde(default = "defaults::connect_to")]
    pub connect_to: MeshUrl,

    /// Local listen address; port 0 picks an ephemeral port
    #[serde(default = "defaults::listen_on")]
    pub listen_on: MeshUrl,

    /// Upper bound of every token this proxy issues
    #[serde(default = "defaults::max_token_lifetime", with = "serde_duration")]
    pub max_token_lifetime: Duration,

    // --- Identity settings ---

    /// Workload certificate (PEM, leaf first, intermediates after)
    #[serde(default = "defaults::cert_path")]
    pub cert_path: PathBuf,

    /// Workload private key (PEM)
    #[serde(default = "defaults::key_path")]
    pub key_path: PathBuf,

    /// Trust bundle used to verify mesh peers (PEM)
    #[serde(default = "defaults::bundle_path")]
    pub bundle_path: PathBuf,

    /// How long to wait for the workload identity at startup
    #[serde(default = "defaults::identity_timeout", with = "serde_duration")]
    pub identity_timeout: Duration,

    // --- General settings ---

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "defaults::log_level")]
    pub log_level: String,

    /// Upstream dial and TLS handshake timeout
    #[serde(default = "defaults::dial_timeout", with = "serde_duration")]
    pub dial_timeout: Duration,

    /// Upper bound for an upstream close during shutdown
    #[serde(default = "defaults::close_timeout", with = "serde_duration")]
    pub close_timeout: Duration,

    /// Capacity of the asynchronous error channel
    #[serde(default = "defaults::error_buffer")]
    pub error_buffer: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            name: defaults::name(),
            connect_to: defaults::connect_to(),
            listen_on: defaults::listen_on(),
            max_token_lifetime: defaults::max_token_lifetime(),
            cert_path: defaults::cert_path(),
            key_path: defaults::key_path(),
            bundle_path: defaults::bundle_path(),
            identity_timeout: defaults::identity_timeout(),
            log_level: defaults::log_level(),
            dial_timeout: defaults::dial_timeout(),
            close_timeout: defaults::close_timeout(),
            error_buffer: defaults::error_buffer(),
        }
    }
}

impl ProxyConfig {
    /// Create a configuration from the four mesh settings, other fields default
    pub fn new(
        name: impl Into<String>,
        connect_to: MeshUrl,
        listen_on: MeshUrl,
        max_token_lifetime: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            connect_to,
            listen_on,
            max_token_lifetime,
            ..Self::default()
        }
    }

    /// Point the identity source at different SVID files
    pub fn with_identity_paths(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        bundle_path: impl Into<PathBuf>,
    ) -> Self {
        self.cert_path = cert_path.into();
        self.key_path = key_path.into();
        self.bundle_path = bundle_path.into();
        self
    }
}

/// Log the configuration
pub fn log_config(config: &ProxyConfig) {
    use log::info;

    if !log::log_enabled!(log::Level::Info) {
        return;
    }

    info!("=== Final Configuration ===");
    info!("Mesh Settings:");
    info!("  Name: {}", config.name);
    info!("  Connect to: {}", config.connect_to);
    info!("  Listen on: {}", config.listen_on);
    info!("  Max token lifetime: {}", duration::format_duration(config.max_token_lifetime));
    info!("Identity Settings:");
    info!("  Certificate: {}", config.cert_path.display());
    info!("  Private key: {}", config.key_path.display());
    info!("  Trust bundle: {}", config.bundle_path.display());
    info!("  Identity timeout: {}", duration::format_duration(config.identity_timeout));
    info!("General Settings:");
    info!("  Log level: {}", config.log_level);
    info!("  Dial timeout: {}", duration::format_duration(config.dial_timeout));
    info!("  Close timeout: {}", duration::format_duration(config.close_timeout));
    info!("  Error buffer: {}", config.error_buffer);
    info!("=========================");
}
