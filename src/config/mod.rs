//! Server configuration.
//!
//! [`ServerConfig`] covers the embeddable defaults and can be loaded from a
//! TOML file. All fields have defaults so `ServerConfig::default()` is a
//! working single-listener development setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration for one server instance.
///
/// # Examples
///
/// ```
/// use graft::config::ServerConfig;
///
/// let config: ServerConfig = toml::from_str(r#"
///     name = "web"
///     http_addrs = ["127.0.0.1:8080"]
///     request_timeout_secs = 30
/// "#).unwrap();
/// assert_eq!(config.name, "web");
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Instance name; the key under which listeners appear in the restart
    /// handoff map and the service registry.
    pub name: String,

    /// Plain-HTTP listen addresses.
    pub http_addrs: Vec<String>,

    /// TLS listen addresses; require `tls_cert`/`tls_key`.
    pub https_addrs: Vec<String>,

    /// PEM certificate chain for the HTTPS listeners.
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for the HTTPS listeners.
    pub tls_key: Option<PathBuf>,

    /// Per-request deadline; the request context is canceled after this.
    pub request_timeout_secs: u64,

    /// Execution-plan cache lifetime.
    pub plan_cache_ttl_secs: u64,

    /// How long a restarting parent keeps serving before it exits.
    pub grace_period_secs: u64,

    /// Minimum interval between administrative restart/shutdown actions.
    pub admin_min_interval_ms: u64,

    /// Whether a serving route may replace an earlier registration.
    pub allow_route_override: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            http_addrs: vec!["127.0.0.1:8080".to_owned()],
            https_addrs: Vec::new(),
            tls_cert: None,
            tls_key: None,
            request_timeout_secs: 30,
            plan_cache_ttl_secs: 3600,
            grace_period_secs: 10,
            admin_min_interval_ms: 1000,
            allow_route_override: false,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn plan_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.plan_cache_ttl_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn admin_min_interval(&self) -> Duration {
        Duration::from_millis(self.admin_min_interval_ms)
    }
}
