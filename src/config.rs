//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::error::{Result, TollgateError};
use crate::ratelimit::LimiterOptions;
use crate::store::FailurePolicy;

/// Environment variable prefix; nested keys are separated by `__`
/// (for example `TOLLGATE__STORE__REDIS_URL`).
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiters created at startup, by name
    #[serde(default)]
    pub limiters: BTreeMap<String, LimiterOptions>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address (Envoy rate limit service)
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// HTTP server address (check endpoints, metrics, health)
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            http_addr: default_http_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; budgets are per process when unset
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Bound on every Redis round trip in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Behavior while Redis is unavailable
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Interval between reconnection attempts in milliseconds
    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,

    /// Interval between sweeps of expired local records in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            timeout_ms: default_timeout_ms(),
            failure_policy: FailurePolicy::default(),
            recovery_interval_ms: default_recovery_interval_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_recovery_interval_ms() -> u64 {
    5000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl TollgateConfig {
    /// Load configuration from an optional file layered under `TOLLGATE__*`
    /// environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let config: TollgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(TollgateError::Config(
                "store.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.store.recovery_interval_ms == 0 {
            return Err(TollgateError::Config(
                "store.recovery_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
