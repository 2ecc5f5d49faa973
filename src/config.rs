//! Configuration management for Tally.

use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TallyError};
use crate::ratelimit::{validate_table_name, Rate, DEFAULT_TABLE};

/// Prefix of environment variables overriding file settings.
pub const ENV_PREFIX: &str = "TALLY";

/// Main configuration for Tally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyConfig {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Seconds to wait for a pooled connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Table holding the counters
    #[serde(default = "default_table")]
    pub table: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
            table: default_table(),
        }
    }
}

fn default_database_url() -> String {
    "postgres://localhost/tally".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Seconds between background cleanup passes
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Limit used when a check does not specify one
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Window, in seconds, used when a check does not specify one
    #[serde(default = "default_window")]
    pub default_window_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval(),
            default_limit: default_limit(),
            default_window_secs: default_window(),
        }
    }
}

impl RateLimitingConfig {
    /// Get the cleanup interval.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Get the default rate.
    pub fn default_rate(&self) -> Rate {
        Rate::new(self.default_limit, Duration::from_secs(self.default_window_secs))
    }
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_limit() -> u64 {
    100
}

fn default_window() -> u64 {
    60
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,

    /// Filter directives used when `RUST_LOG` is not set
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: default_filter(),
        }
    }
}

fn default_filter() -> String {
    "info".to_string()
}

impl TallyConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TallyConfig =
            serde_yaml::from_str(&contents).map_err(|e| TallyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file, overridden by
    /// `TALLY__SECTION__KEY` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&str>, prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Yaml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TallyConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TallyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 {
            return Err(TallyError::Config(
                "database.max_connections must be greater than 0".to_string(),
            ));
        }
        validate_table_name(&self.database.table)?;

        if self.rate_limiting.cleanup_interval_secs == 0 {
            return Err(TallyError::Config(
                "rate_limiting.cleanup_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.rate_limiting.default_limit == 0 {
            return Err(TallyError::Config(
                "rate_limiting.default_limit must be greater than 0".to_string(),
            ));
        }
        if self.rate_limiting.default_window_secs == 0 {
            return Err(TallyError::Config(
                "rate_limiting.default_window_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
