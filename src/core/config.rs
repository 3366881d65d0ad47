//! Configuration management for the indexing engine
//!
//! This module handles all runtime settings with defaults matching a local
//! development setup: a store on localhost, in-process locks and cache.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backing document store
    pub store: StoreConfig,

    /// Per-key exclusive sections
    pub locks: LocksConfig,

    /// Write-back aggregator cache
    pub cache: CacheConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Which backend a store-like subsystem talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// In-process backend
    Memory,
    /// Remote HTTP backend
    Http,
}

/// Backing document store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend selection
    pub mode: BackendMode,

    /// Base URL of the HTTP document store
    pub url: String,

    /// Per-request timeout
    pub request_timeout: Duration,
}

/// Lock substrate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    /// Backend selection: in-process or remote mutex service
    pub mode: BackendMode,

    /// Base URL of the remote lock service
    pub url: String,

    /// Overall acquisition timeout
    pub timeout: Duration,

    /// Maximum acquisition attempts in remote mode
    pub retries: u32,

    /// Delay between acquisition attempts in remote mode
    pub delay: Duration,

    /// TTL stamped on remote locks; the backstop against a holder that
    /// never releases
    pub ttl: Duration,
}

/// Write-back aggregator cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backend selection: in-process map or shared key-value service
    pub mode: BackendMode,

    /// Base URL of the shared key-value service
    pub url: String,

    /// Entry bound for the in-process backend; overflow triggers an
    /// implicit flush, never a bare eviction
    pub max_entries: usize,

    /// Interval between scheduled flush cycles
    pub flush_interval: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            locks: LocksConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::Http,
            url: "http://localhost:9200".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::Memory,
            url: "http://localhost:7800".to_string(),
            timeout: Duration::from_secs(10),
            retries: 1000,
            delay: Duration::from_millis(100),
            ttl: Duration::from_secs(30),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::Memory,
            url: "http://localhost:7801".to_string(),
            max_entries: 4096,
            flush_interval: Duration::from_secs(10),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the config file and environment variables
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        // Try to load from config file first
        if let Ok(file_config) = Self::from_file("aggdex.toml") {
            config = file_config;
        }

        // Override with environment variables
        config.apply_env_overrides()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        use std::env;

        if let Ok(url) = env::var("AGX_STORE_URL") {
            self.store.mode = BackendMode::Http;
            self.store.url = url;
        }

        if let Ok(url) = env::var("AGX_LOCK_URL") {
            self.locks.mode = BackendMode::Http;
            self.locks.url = url;
        }

        if let Ok(url) = env::var("AGX_CACHE_URL") {
            self.cache.mode = BackendMode::Http;
            self.cache.url = url;
        }

        if let Ok(max) = env::var("AGX_CACHE_MAX_ENTRIES") {
            self.cache.max_entries = max
                .parse()
                .map_err(|e| Error::config(format!("Invalid cache max entries: {}", e)))?;
        }

        if let Ok(retries) = env::var("AGX_LOCK_RETRIES") {
            self.locks.retries = retries
                .parse()
                .map_err(|e| Error::config(format!("Invalid lock retries: {}", e)))?;
        }

        if let Ok(level) = env::var("AGX_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.store.mode == BackendMode::Http && self.store.url.is_empty() {
            return Err(Error::config("Store URL must be set in http mode"));
        }

        if self.locks.mode == BackendMode::Http && self.locks.url.is_empty() {
            return Err(Error::config("Lock service URL must be set in http mode"));
        }

        if self.locks.retries == 0 {
            return Err(Error::config("Lock retries must be at least 1"));
        }

        if self.locks.timeout.is_zero() {
            return Err(Error::config("Lock timeout must be non-zero"));
        }

        if self.cache.max_entries == 0 {
            return Err(Error::config("Cache must hold at least one entry"));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::config("Invalid log level")),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.locks.timeout, Duration::from_secs(10));
        assert_eq!(config.locks.retries, 1000);
        assert_eq!(config.locks.delay, Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_cache_bound_rejected() {
        let mut config = Config::default();
        config.cache.max_entries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_store_url_rejected_in_http_mode() {
        let mut config = Config::default();
        config.store.url.clear();
        assert!(config.validate().is_err());
    }
}
