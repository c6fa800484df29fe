//! Relay configuration.
//!
//! TOML files with `RELAY_*` environment variable overrides. Every tunable
//! in the router has a key here; the loader applies file values over
//! defaults and environment values over both.

use relay_common::{PoolConfig, QueueConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub standby: StandbyConfig,
    pub traffic: TrafficConfig,
    pub router: RouterConfig,
    pub mediator: MediatorConfig,
    pub breaker: BreakerConfig,
    pub shutdown: ShutdownConfig,

    /// Data directory for the embedded queue adapter.
    pub data_dir: String,
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for pool in &self.router.pools {
            if pool.concurrency == 0 {
                return Err(ConfigError::Validation(format!(
                    "pool [{}] concurrency must be >= 1",
                    pool.code
                )));
            }
            if pool.queue_capacity == 0 {
                return Err(ConfigError::Validation(format!(
                    "pool [{}] queue_capacity must be >= 1",
                    pool.code
                )));
            }
        }
        if self.traffic.enabled
            && self.traffic.strategy == TrafficStrategyKind::Alb
            && self.traffic.target_group_arn.is_empty()
        {
            return Err(ConfigError::Validation(
                "traffic.target_group_arn is required for the alb strategy".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP server configuration for the monitoring API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            cors_origins: vec![],
        }
    }
}

/// Active/standby election configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StandbyConfig {
    pub enabled: bool,
    pub redis_url: String,
    pub lock_key: String,
    /// Instance identifier; a UUID is generated when empty.
    pub instance_id: String,
    pub lock_ttl_seconds: u64,
}

impl Default for StandbyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            lock_key: "relay:router:primary".to_string(),
            instance_id: String::new(),
            lock_ttl_seconds: 30,
        }
    }
}

impl StandbyConfig {
    /// Instance id from config, falling back to a generated UUID.
    pub fn resolved_instance_id(&self) -> String {
        if self.instance_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            self.instance_id.clone()
        }
    }
}

/// Traffic registrar strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficStrategyKind {
    None,
    Alb,
}

impl Default for TrafficStrategyKind {
    fn default() -> Self {
        TrafficStrategyKind::None
    }
}

/// Load balancer registration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    pub enabled: bool,
    pub strategy: TrafficStrategyKind,
    pub target_group_arn: String,
    pub port: u16,
    pub region: String,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: TrafficStrategyKind::None,
            target_group_arn: String::new(),
            port: 8080,
            region: "eu-west-1".to_string(),
            max_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

/// Remote topology source (central control plane).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Remote endpoint serving the topology; empty = local definitions.
    pub url: String,
    pub refresh_seconds: u64,
    pub max_attempts: u32,
    pub retry_delay_seconds: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            refresh_seconds: 300,
            max_attempts: 12,
            retry_delay_seconds: 5,
        }
    }
}

/// Router topology: locally defined pools/queues plus the optional
/// remote source that supersedes them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RouterConfig {
    pub pools: Vec<PoolConfig>,
    pub queues: Vec<QueueConfig>,
    pub source: SourceConfig,
}

/// Outbound HTTP mediation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    pub timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub max_retries: u32,
    pub base_backoff_seconds: u64,
    /// Negotiate HTTP/2 via ALPN; false forces HTTP/1.1.
    pub http2: bool,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            connect_timeout_seconds: 10,
            max_retries: 3,
            base_backoff_seconds: 1,
            http2: true,
        }
    }
}

/// Per-target circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub window_size: u32,
    pub min_requests: u32,
    pub failure_ratio: f64,
    pub open_timeout_seconds: u64,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            min_requests: 10,
            failure_ratio: 0.5,
            open_timeout_seconds: 5,
            success_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub drain_timeout_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_seconds: 30,
        }
    }
}
