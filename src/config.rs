//! Configuration for salesbus services.
//!
//! Supports YAML file and environment variable overrides.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::bus::ReconnectPolicy;
use crate::cache::DEFAULT_TTL_SECS;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "SALESBUS_CONFIG";

/// Config file used when `SALESBUS_CONFIG` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Message broker configuration.
    pub messaging: MessagingConfig,
    /// Cache store configuration.
    pub cache: CacheConfig,
}

/// Message broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Fixed delay before each reconnection attempt.
    pub reconnect_delay_ms: u64,
    /// Reconnection attempts allowed before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            reconnect_delay_ms: 5000,
            max_reconnect_attempts: 10,
        }
    }
}

impl MessagingConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_delay_ms),
            self.max_reconnect_attempts,
        )
    }
}

/// Cache store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub host: String,
    pub port: u16,
    /// TTL applied when a caller does not pass one.
    pub default_ttl_secs: u64,
    /// Upper bound for connecting and for each cache command.
    pub call_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            default_ttl_secs: DEFAULT_TTL_SECS,
            call_timeout_ms: 2000,
        }
    }
}

impl CacheConfig {
    /// Redis connection URL built from host and port.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides.
    ///
    /// Values that fail to parse are ignored.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("RABBITMQ_URL") {
            self.messaging.url = url;
        }

        if let Some(delay) = env_parse("RECONNECT_DELAY_MS") {
            self.messaging.reconnect_delay_ms = delay;
        }

        if let Some(attempts) = env_parse("MAX_RECONNECT_ATTEMPTS") {
            self.messaging.max_reconnect_attempts = attempts;
        }

        if let Ok(host) = std::env::var("REDIS_HOST") {
            self.cache.host = host;
        }

        if let Some(port) = env_parse("REDIS_PORT") {
            self.cache.port = port;
        }

        if let Some(ttl) = env_parse("CACHE_TTL_SECS") {
            self.cache.default_ttl_secs = ttl;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}
