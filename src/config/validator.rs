//! Configuration validator
//!
//! This module provides functionality for validating configuration.

use log::warn;

use crate::common::{ProxyError, Result};
use crate::config::{ProxyConfig, MIN_TOKEN_LIFETIME};

/// Validate the configuration
///
/// Every failure is reported as [`ProxyError::ConfigInvalid`].
pub fn validate_config(config: &ProxyConfig) -> Result<()> {
    validate_mesh_settings(config)?;
    validate_general_settings(config)?;
    Ok(())
}

/// Validate mesh settings
fn validate_mesh_settings(config: &ProxyConfig) -> Result<()> {
    if config.name.trim().is_empty() {
        return Err(ProxyError::ConfigInvalid("name must not be empty".to_string()));
    }

    config.connect_to.validate()?;
    config.listen_on.validate()?;

    if config.max_token_lifetime.is_zero() {
        return Err(ProxyError::ConfigInvalid(
            "max_token_lifetime must be positive".to_string(),
        ));
    }
    if config.max_token_lifetime < MIN_TOKEN_LIFETIME {
        return Err(ProxyError::ConfigInvalid(format!(
            "max_token_lifetime must be at least {}s",
            MIN_TOKEN_LIFETIME.as_secs()
        )));
    }

    if config.connect_to == config.listen_on {
        return Err(ProxyError::ConfigInvalid(
            "connect_to and listen_on must be different".to_string(),
        ));
    }

    Ok(())
}

/// Validate general settings
fn validate_general_settings(config: &ProxyConfig) -> Result<()> {
    match config.log_level.as_str() {
        "error" | "warn" | "info" | "debug" | "trace" => {}
        level => {
            warn!("Invalid log level: {}. Using default: info", level);
        }
    }

    for (name, value) in [
        ("identity_timeout", config.identity_timeout),
        ("dial_timeout", config.dial_timeout),
        ("close_timeout", config.close_timeout),
    ] {
        if value.is_zero() {
            return Err(ProxyError::ConfigInvalid(format!("{} must be positive", name)));
        }
    }

    if config.error_buffer == 0 {
        return Err(ProxyError::ConfigInvalid(
            "error_buffer must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

/// Configuration validator trait
pub trait ConfigValidator {
    /// Validate the configuration
    fn validate(&self) -> Result<()>;

    /// Check configuration for problems that do not prevent startup
    fn check_warnings(&self) -> Vec<String>;
}

impl ConfigValidator for ProxyConfig {
    fn validate(&self) -> Result<()> {
        validate_config(self)
    }

    fn check_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        match self.log_level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            level => {
                warnings.push(format!("Invalid log level '{}', using default 'info'", level));
            }
        }

        for (label, path) in [
            ("Certificate", &self.cert_path),
            ("Private key", &self.key_path),
            ("Trust bundle", &self.bundle_path),
        ] {
            if !path.is_file() {
                warnings.push(format!(
                    "{} file not found yet: {} (waiting for attestation)",
                    label,
                    path.display()
                ));
            }
        }

        if self.close_timeout > self.max_token_lifetime {
            warnings.push("close_timeout is longer than max_token_lifetime".to_string());
        }

        warnings
    }
}
