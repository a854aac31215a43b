//! Configuration merging functionality
//!
//! Command line arguments are the highest priority source; they are carried
//! as a set of optional overrides merged on top of the loaded configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::common::MeshUrl;
use crate::config::ProxyConfig;

/// Optional values that replace loaded settings when present
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub name: Option<String>,
    pub connect_to: Option<MeshUrl>,
    pub listen_on: Option<MeshUrl>,
    pub max_token_lifetime: Option<Duration>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub bundle_path: Option<PathBuf>,
    pub log_level: Option<String>,
}

/// Trait for merging configurations
pub trait ConfigMerger {
    /// Apply every override that is set
    fn merge(self, overrides: ConfigOverrides) -> Self where Self: Sized;
}

impl ConfigMerger for ProxyConfig {
    fn merge(mut self, overrides: ConfigOverrides) -> Self {
        fn apply<T>(field: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *field = value;
            }
        }

        apply(&mut self.name, overrides.name);
        apply(&mut self.connect_to, overrides.connect_to);
        apply(&mut self.listen_on, overrides.listen_on);
        apply(&mut self.max_token_lifetime, overrides.max_token_lifetime);
        apply(&mut self.cert_path, overrides.cert_path);
        apply(&mut self.key_path, overrides.key_path);
        apply(&mut self.bundle_path, overrides.bundle_path);
        apply(&mut self.log_level, overrides.log_level);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_only_set_fields() {
        let base = ProxyConfig::default();
        let merged = base.clone().merge(ConfigOverrides {
            name: Some("proxy-nsc".to_string()),
            max_token_lifetime: Some(Duration::from_secs(3600)),
            ..Default::default()
        });

        assert_eq!(merged.name, "proxy-nsc");
        assert_eq!(merged.max_token_lifetime, Duration::from_secs(3600));
        assert_eq!(merged.connect_to, base.connect_to);
        assert_eq!(merged.log_level, base.log_level);
    }
}
