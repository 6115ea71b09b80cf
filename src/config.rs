//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// `None` when running with `SKIP_EXTERNALS=true`.
    pub database: Option<DatabaseConfig>,
    pub cache: Option<CacheConfig>,
    pub logging: LoggingConfig,
    pub gateway: GatewayConfig,
    pub poller: PollerConfig,
    pub reconcile: ReconcileConfig,
    pub rate_limit: RateLimitConfig,
    pub recovery: RecoveryConfig,
    pub skip_externals: bool,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// UPI gateway credentials and HTTP behaviour
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_key: String,
    pub base_url: String,
    pub redirect_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

/// Status polling cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Attempts for each store write while finalizing an outcome.
    pub store_retries: u32,
    pub store_backoff: Duration,
}

/// Booking attempt throttling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_attempts: u32,
    pub window_secs: u64,
}

/// Pending order recovery sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub interval: Duration,
    pub window_hours: i64,
    pub batch_size: i64,
}

fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T, ConfigError> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(key.to_string()))
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .unwrap_or_else(|_| "false".to_string())
        .to_lowercase()
        == "true"
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();
        let skip_externals = env_flag("SKIP_EXTERNALS");

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: if skip_externals {
                None
            } else {
                Some(DatabaseConfig::from_env()?)
            },
            cache: if skip_externals {
                None
            } else {
                Some(CacheConfig::from_env()?)
            },
            logging: LoggingConfig::from_env()?,
            gateway: GatewayConfig::from_env()?,
            poller: PollerConfig::from_env()?,
            reconcile: ReconcileConfig::from_env()?,
            rate_limit: RateLimitConfig::from_env()?,
            recovery: RecoveryConfig::from_env()?,
            skip_externals,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        if let Some(cache) = &self.cache {
            cache.validate()?;
        }
        self.logging.validate()?;
        self.gateway.validate()?;
        self.poller.validate()?;
        self.reconcile.validate()?;
        self.rate_limit.validate()?;
        self.recovery.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_env("PORT", "8000")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("PORT cannot be 0".to_string()));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue("HOST cannot be empty".to_string()));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: parse_env("DB_MAX_CONNECTIONS", "20")?,
            min_connections: parse_env("DB_MIN_CONNECTIONS", "5")?,
            connection_timeout: parse_env("DB_CONNECTION_TIMEOUT", "30")?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(CacheConfig {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            max_connections: parse_env("CACHE_MAX_CONNECTIONS", "10")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(ConfigError::InvalidValue(
                "REDIS_URL must start with redis:// or rediss://".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.ekqr.in/api".to_string(),
            redirect_url: "http://localhost:3000/payment/return".to_string(),
            timeout_secs: 15,
            max_retries: 2,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(GatewayConfig {
            api_key: env::var("EKQR_API_KEY")
                .map_err(|_| ConfigError::MissingVariable("EKQR_API_KEY".to_string()))?,
            base_url: env::var("EKQR_BASE_URL").unwrap_or(defaults.base_url),
            redirect_url: env::var("EKQR_REDIRECT_URL").unwrap_or(defaults.redirect_url),
            timeout_secs: parse_env("EKQR_TIMEOUT_SECS", "15")?,
            max_retries: parse_env("EKQR_MAX_RETRIES", "2")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::InvalidValue("EKQR_API_KEY".to_string()));
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "EKQR_BASE_URL must be a valid URL".to_string(),
            ));
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue("EKQR_TIMEOUT_SECS".to_string()));
        }

        Ok(())
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_duration: Duration::from_secs(600),
        }
    }
}

impl PollerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(PollerConfig {
            interval: Duration::from_secs(parse_env("POLL_INTERVAL_SECS", "5")?),
            max_duration: Duration::from_secs(parse_env("POLL_MAX_DURATION_SECS", "600")?),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::InvalidValue("POLL_INTERVAL_SECS".to_string()));
        }

        if self.max_duration < self.interval {
            return Err(ConfigError::ValidationFailed(
                "POLL_MAX_DURATION_SECS must be >= POLL_INTERVAL_SECS".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            store_retries: 3,
            store_backoff: Duration::from_millis(200),
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ReconcileConfig {
            store_retries: parse_env("RECONCILE_STORE_RETRIES", "3")?,
            store_backoff: Duration::from_millis(parse_env("RECONCILE_STORE_BACKOFF_MS", "200")?),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_retries == 0 {
            return Err(ConfigError::InvalidValue(
                "RECONCILE_STORE_RETRIES".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            window_secs: 300,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(RateLimitConfig {
            max_attempts: parse_env("BOOKING_RATE_LIMIT_MAX", "3")?,
            window_secs: parse_env("BOOKING_RATE_LIMIT_WINDOW_SECS", "300")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "BOOKING_RATE_LIMIT_MAX".to_string(),
            ));
        }

        if self.window_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "BOOKING_RATE_LIMIT_WINDOW_SECS".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            window_hours: 24,
            batch_size: 200,
        }
    }
}

impl RecoveryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(RecoveryConfig {
            interval: Duration::from_secs(parse_env("ORDER_RECOVERY_INTERVAL_SECS", "60")?),
            window_hours: parse_env("ORDER_RECOVERY_WINDOW_HOURS", "24")?,
            batch_size: parse_env("ORDER_RECOVERY_BATCH_SIZE", "200")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "ORDER_RECOVERY_INTERVAL_SECS".to_string(),
            ));
        }

        if self.window_hours <= 0 || self.batch_size <= 0 {
            return Err(ConfigError::ValidationFailed(
                "recovery window and batch size must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl From<ConfigError> for crate::error::AppError {
    fn from(err: ConfigError) -> Self {
        use crate::error::{AppError, AppErrorKind, InfrastructureError};

        AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::Configuration {
                message: err.to_string(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poller_max_duration_must_cover_one_interval() {
        let config = PollerConfig {
            interval: Duration::from_secs(10),
            max_duration: Duration::from_secs(5),
        };
        assert!(config.validate().is_err());
        assert!(PollerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_gateway_config_requires_key_and_url() {
        let mut config = GatewayConfig::default();
        assert!(config.validate().is_err());

        config.api_key = "key_test".to_string();
        assert!(config.validate().is_ok());

        config.base_url = "ftp://gateway".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rate_limit_defaults() {
        let config = RateLimitConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.window_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_recovery_rejects_non_positive_window() {
        let config = RecoveryConfig {
            window_hours: 0,
            ..RecoveryConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
