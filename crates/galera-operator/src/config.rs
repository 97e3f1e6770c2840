//! Operator configuration from flags and environment

use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::version::DEFAULT_VERSION_SERVICE_ENDPOINT;

/// Errors in the operator configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The version service endpoint is not an http(s) URL
    #[error("version service endpoint '{0}' must start with http:// or https://")]
    InvalidEndpoint(String),

    /// The drain grace period is out of range
    #[error("drain grace period of {0}s exceeds the maximum of {MAX_DRAIN_GRACE_SECS}s")]
    DrainGraceTooLong(u64),
}

/// Upper bound for the drain grace sleep; it runs while the cluster lock is held
pub const MAX_DRAIN_GRACE_SECS: u64 = 60;

/// Galera operator - runs synchronously replicated MySQL clusters on Kubernetes
#[derive(Parser, Debug, Clone)]
#[command(name = "galera-operator", version, about, long_about = None)]
pub struct ControllerConfig {
    /// Print the GaleraCluster CRD manifest and exit
    #[arg(long)]
    pub crd: bool,

    /// Only watch clusters in this namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Version service used for pinning and scheduled upgrades
    #[arg(long, env = "VERSION_SERVICE_ENDPOINT", default_value = DEFAULT_VERSION_SERVICE_ENDPOINT)]
    pub version_service_endpoint: String,

    /// Seconds to wait before releasing the last database pod on deletion
    #[arg(long, env = "DRAIN_GRACE_SECS", default_value_t = 3)]
    pub drain_grace_secs: u64,

    /// Log filter directives (overrides the built-in default)
    #[arg(long, env = "RUST_LOG")]
    pub log_filter: Option<String>,

    /// Emit human-readable logs instead of JSON
    #[arg(long, env = "LOG_TEXT")]
    pub text_logs: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            crd: false,
            watch_namespace: None,
            version_service_endpoint: DEFAULT_VERSION_SERVICE_ENDPOINT.to_string(),
            drain_grace_secs: 3,
            log_filter: None,
            text_logs: false,
        }
    }
}

impl ControllerConfig {
    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = &self.version_service_endpoint;
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ConfigError::InvalidEndpoint(endpoint.clone()));
        }
        if self.drain_grace_secs > MAX_DRAIN_GRACE_SECS {
            return Err(ConfigError::DrainGraceTooLong(self.drain_grace_secs));
        }
        Ok(())
    }

    /// Grace period before the last database pod is released
    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ControllerConfig::try_parse_from(["galera-operator"]).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.drain_grace(), Duration::from_secs(3));
        assert!(!config.crd);
    }

    #[test]
    fn flags_override_defaults() {
        let config = ControllerConfig::try_parse_from([
            "galera-operator",
            "--watch-namespace",
            "databases",
            "--drain-grace-secs",
            "10",
            "--version-service-endpoint",
            "http://versions.local:8080",
        ])
        .unwrap();
        assert_eq!(config.watch_namespace.as_deref(), Some("databases"));
        assert_eq!(config.drain_grace_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_endpoint_and_long_grace() {
        let config = ControllerConfig {
            version_service_endpoint: "versions.local".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint(_))
        ));

        let config = ControllerConfig {
            drain_grace_secs: 600,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DrainGraceTooLong(600))
        ));
    }
}
