//! Configuration for the packing event ledger.
//!
//! Loaded from `config/default`, `config/{RUN_MODE}` and environment variables
//! prefixed with `LEDGER__` (e.g. `LEDGER__DATABASE__PATH`).

use chrono::FixedOffset;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the ledger service.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Datastore configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Event reconstruction configuration
    #[serde(default)]
    pub reconstruct: ReconstructConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Datastore configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Single wait for the exclusive lock, in milliseconds
    #[serde(default = "default_lock_slice_ms")]
    pub lock_slice_ms: u64,

    /// Total budget for acquiring the exclusive lock, in milliseconds
    #[serde(default = "default_lock_budget_ms")]
    pub lock_budget_ms: u64,
}

/// Event reconstruction configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconstructConfig {
    /// Minimum duration of a real packing event, in seconds
    #[serde(default = "default_min_packing_time_secs")]
    pub min_packing_time_secs: f64,

    /// UTC offset for segment headers written without one (e.g. "+09:00")
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Root directory of segment logs, used by `discover`
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_database_path() -> String {
    "data/packtrace.db".to_string()
}
fn default_lock_slice_ms() -> u64 {
    250
}
fn default_lock_budget_ms() -> u64 {
    30_000
}
fn default_min_packing_time_secs() -> f64 {
    5.0
}
fn default_timezone() -> String {
    "+00:00".to_string()
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("data/segments")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            lock_slice_ms: default_lock_slice_ms(),
            lock_budget_ms: default_lock_budget_ms(),
        }
    }
}

impl Default for ReconstructConfig {
    fn default() -> Self {
        Self {
            min_packing_time_secs: default_min_packing_time_secs(),
            timezone: default_timezone(),
            log_dir: default_log_dir(),
        }
    }
}

impl LedgerConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/default`
    /// 2. `config/{RUN_MODE}`
    /// 3. Environment variables (prefixed with `LEDGER__`)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("LEDGER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.path.is_empty() {
            return Err(ConfigValidationError::MissingField("database.path".to_string()));
        }
        if self.database.lock_slice_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.lock_slice_ms".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.reconstruct.min_packing_time_secs <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "reconstruct.min_packing_time_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        self.reconstruct.timezone_offset()?;
        Ok(())
    }
}

impl DatabaseConfig {
    /// Single wait for the exclusive lock.
    pub fn lock_slice(&self) -> Duration {
        Duration::from_millis(self.lock_slice_ms)
    }

    /// Total budget for acquiring the exclusive lock.
    pub fn lock_budget(&self) -> Duration {
        Duration::from_millis(self.lock_budget_ms)
    }
}

impl ReconstructConfig {
    /// Parse the configured UTC offset.
    pub fn timezone_offset(&self) -> Result<FixedOffset, ConfigValidationError> {
        parse_utc_offset(&self.timezone).ok_or_else(|| ConfigValidationError::InvalidValue {
            field: "reconstruct.timezone".to_string(),
            message: format!("'{}' is not a UTC offset like +09:00", self.timezone),
        })
    }
}

/// Parse `+HH:MM`, `-HH:MM`, `+HHMM`, `Z` or `UTC`.
pub fn parse_utc_offset(value: &str) -> Option<FixedOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("z") || value.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }

    let (sign, rest) = match value.as_bytes().first()? {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> LedgerConfig {
        LedgerConfig {
            logging: LoggingConfig::default(),
            database: DatabaseConfig {
                path: "/tmp/packtrace-test.db".to_string(),
                lock_slice_ms: 100,
                lock_budget_ms: 1000,
            },
            reconstruct: ReconstructConfig {
                min_packing_time_secs: 5.0,
                timezone: "+09:00".to_string(),
                log_dir: PathBuf::from("/tmp/segments"),
            },
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(create_test_config().validate().is_ok());
    }

    #[test]
    fn test_invalid_timezone() {
        let mut config = create_test_config();
        config.reconstruct.timezone = "Asia/Tokyo".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_invalid_min_packing_time() {
        let mut config = create_test_config();
        config.reconstruct.min_packing_time_secs = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_utc_offset() {
        assert_eq!(parse_utc_offset("+09:00").unwrap().local_minus_utc(), 9 * 3600);
        assert_eq!(parse_utc_offset("-0530").unwrap().local_minus_utc(), -(5 * 3600 + 30 * 60));
        assert_eq!(parse_utc_offset("UTC").unwrap().local_minus_utc(), 0);
        assert!(parse_utc_offset("9").is_none());
        assert!(parse_utc_offset("+25:00").is_none());
    }

    #[test]
    fn test_default_values() {
        let config = DatabaseConfig::default();
        assert_eq!(config.lock_slice(), Duration::from_millis(250));
        assert_eq!(default_min_packing_time_secs(), 5.0);
    }
}
