//! Configuration loader with file and environment variable support.

use crate::{AppConfig, ConfigError, TrafficStrategyKind};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths.
const CONFIG_PATHS: &[&str] = &[
    "relay.toml",
    "config.toml",
    "./config/relay.toml",
    "/etc/relay/relay.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment overrides.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("RELAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // HTTP
        if let Ok(val) = env::var("RELAY_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("RELAY_HTTP_HOST") {
            config.http.host = val;
        }
        if let Ok(val) = env::var("RELAY_CORS_ORIGINS") {
            config.http.cors_origins = val.split(',').map(|s| s.trim().to_string()).collect();
        }

        // Standby / election
        if let Ok(val) = env::var("RELAY_STANDBY_ENABLED") {
            config.standby.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("RELAY_STANDBY_REDIS_URL").or_else(|_| env::var("RELAY_REDIS_URL")) {
            config.standby.redis_url = val;
        }
        if let Ok(val) = env::var("RELAY_STANDBY_LOCK_KEY") {
            config.standby.lock_key = val;
        }
        if let Ok(val) = env::var("RELAY_STANDBY_LOCK_TTL_SECONDS") {
            if let Ok(ttl) = val.parse() {
                config.standby.lock_ttl_seconds = ttl;
            }
        }
        if let Ok(val) = env::var("RELAY_STANDBY_INSTANCE_ID").or_else(|_| env::var("HOSTNAME")) {
            if config.standby.instance_id.is_empty() {
                config.standby.instance_id = val;
            }
        }

        // Traffic management
        if let Ok(val) = env::var("RELAY_TRAFFIC_ENABLED") {
            config.traffic.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("RELAY_TRAFFIC_STRATEGY") {
            config.traffic.strategy = match val.to_lowercase().as_str() {
                "alb" => TrafficStrategyKind::Alb,
                _ => TrafficStrategyKind::None,
            };
        }
        if let Ok(val) = env::var("RELAY_TRAFFIC_TARGET_GROUP_ARN") {
            config.traffic.target_group_arn = val;
        }
        if let Ok(val) = env::var("RELAY_TRAFFIC_PORT") {
            if let Ok(port) = val.parse() {
                config.traffic.port = port;
            }
        }
        if let Ok(val) = env::var("RELAY_TRAFFIC_REGION") {
            config.traffic.region = val;
        }
        if let Ok(val) = env::var("RELAY_TRAFFIC_MAX_ATTEMPTS") {
            if let Ok(attempts) = val.parse() {
                config.traffic.max_attempts = attempts;
            }
        }
        if let Ok(val) = env::var("RELAY_TRAFFIC_RETRY_DELAY_MS") {
            if let Ok(delay) = val.parse() {
                config.traffic.retry_delay_ms = delay;
            }
        }

        // Remote topology source
        if let Ok(val) = env::var("RELAY_SOURCE_URL") {
            config.router.source.url = val;
        }
        if let Ok(val) = env::var("RELAY_SOURCE_REFRESH_SECONDS") {
            if let Ok(secs) = val.parse() {
                config.router.source.refresh_seconds = secs;
            }
        }

        // Mediator
        if let Ok(val) = env::var("RELAY_MEDIATOR_TIMEOUT_SECONDS") {
            if let Ok(secs) = val.parse() {
                config.mediator.timeout_seconds = secs;
            }
        }
        if let Ok(val) = env::var("RELAY_MEDIATOR_CONNECT_TIMEOUT_SECONDS") {
            if let Ok(secs) = val.parse() {
                config.mediator.connect_timeout_seconds = secs;
            }
        }
        if let Ok(val) = env::var("RELAY_MEDIATOR_MAX_RETRIES") {
            if let Ok(retries) = val.parse() {
                config.mediator.max_retries = retries;
            }
        }
        if let Ok(val) = env::var("RELAY_MEDIATOR_BASE_BACKOFF_SECONDS") {
            if let Ok(secs) = val.parse() {
                config.mediator.base_backoff_seconds = secs;
            }
        }
        if let Ok(val) = env::var("RELAY_MEDIATOR_HTTP2") {
            config.mediator.http2 = val.parse().unwrap_or(true);
        }

        // Shutdown
        if let Ok(val) = env::var("RELAY_DRAIN_TIMEOUT_SECONDS") {
            if let Ok(secs) = val.parse() {
                config.shutdown.drain_timeout_seconds = secs;
            }
        }

        // General
        if let Ok(val) = env::var("RELAY_DATA_DIR") {
            config.data_dir = val;
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
