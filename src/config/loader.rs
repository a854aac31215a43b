//! Configuration loading functionality
//!
//! This module provides functionality for loading configuration from files
//! and environment variables. Command line overrides are applied on top by
//! [`ConfigMerger`](super::ConfigMerger).

use config::{Config, Environment, File, FileFormat};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::{ProxyError, Result};
use crate::config::defaults::{DEFAULT_CONFIG_FILE, ENV_PREFIX};
use crate::config::ProxyConfig;

/// Trait for loading configuration from different sources
pub trait ConfigLoader {
    /// Load configuration from a JSON file
    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> where Self: Sized;

    /// Load configuration from `NSM_*` environment variables
    fn from_env() -> Result<Self> where Self: Sized;

    /// Load configuration with proper priority:
    /// 1. Default values (lowest priority)
    /// 2. Configuration file (`config_file`, or `nsc-proxy.json` if it exists)
    /// 3. Environment variables (highest priority)
    fn load(config_file: Option<&Path>) -> Result<Self> where Self: Sized;
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX).prefix_separator("_")
}

fn config_error(err: config::ConfigError) -> ProxyError {
    ProxyError::ConfigInvalid(err.to_string())
}

impl ConfigLoader for ProxyConfig {
    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigInvalid(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            ProxyError::ConfigInvalid(format!("Failed to parse JSON config file {}: {}", path.display(), e))
        })
    }

    fn from_env() -> Result<Self> {
        Config::builder()
            .add_source(env_source())
            .build()
            .and_then(|cfg| cfg.try_deserialize::<Self>())
            .map_err(config_error)
    }

    fn load(config_file: Option<&Path>) -> Result<Self> {
        let required = config_file.is_some();
        let path: PathBuf = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        if path.exists() {
            info!("Loading configuration from {}", path.display());
        } else {
            debug!("Configuration file {} not found, using defaults and environment", path.display());
        }

        let config = Config::builder()
            .add_source(File::from(path).format(FileFormat::Json).required(required))
            .add_source(env_source())
            .build()
            .map_err(config_error)?;

        config.try_deserialize::<Self>().map_err(config_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::io::Write;
    use std::time::Duration;

    fn clear_env() {
        for key in ["NSM_NAME", "NSM_CONNECT_TO", "NSM_LISTEN_ON", "NSM_MAX_TOKEN_LIFETIME", "NSM_ERROR_BUFFER"] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_file() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"name": "proxy-nsc", "connect_to": "tcp://10.1.1.1:5001", "max_token_lifetime": "10m"}}"#).unwrap();

        let config = ProxyConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "proxy-nsc");
        assert_eq!(config.connect_to.host(), "10.1.1.1:5001");
        assert_eq!(config.max_token_lifetime, Duration::from_secs(600));
    }

    #[test]
    #[serial]
    fn test_from_file_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        assert!(matches!(ProxyConfig::from_file(file.path()), Err(ProxyError::ConfigInvalid(_))));
        assert!(ProxyConfig::from_file("/nonexistent/nsc-proxy.json").is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"name": "from-file", "listen_on": "tcp://:7000"}}"#).unwrap();

        env::set_var("NSM_NAME", "from-env");
        env::set_var("NSM_MAX_TOKEN_LIFETIME", "2h");
        env::set_var("NSM_ERROR_BUFFER", "32");

        let config = ProxyConfig::load(Some(file.path())).unwrap();
        clear_env();

        assert_eq!(config.name, "from-env");
        assert_eq!(config.listen_on.host(), ":7000");
        assert_eq!(config.max_token_lifetime, Duration::from_secs(7200));
        assert_eq!(config.error_buffer, 32);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        clear_env();
        assert!(ProxyConfig::load(Some(Path::new("/nonexistent/nsc-proxy.json"))).is_err());
    }
}
