//! Configuration management.
//!
//! Values come from an optional file plus `EVENTLOG__`-prefixed environment
//! variables, e.g. `EVENTLOG__STORE__BACKEND=postgres` or
//! `EVENTLOG__DATABASE__URL=postgres://...`.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{EventStoreError, Result};
use crate::processing::CommitStrategy;
use crate::telemetry::{LoggingConfig, MetricsConfig, TelemetryConfig};

const ENV_PREFIX: &str = "EVENTLOG";
const ENV_SEPARATOR: &str = "__";

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Which backend to use
    #[serde(default)]
    pub store: StoreConfig,

    /// PostgreSQL configuration, required by the postgres backend
    pub database: Option<DatabaseConfig>,

    /// Log server configuration, required by the log_server backend
    pub log_server: Option<LogServerConfig>,

    /// Processor defaults
    #[serde(default)]
    pub processor: ProcessingConfig,

    /// Logging, metrics and trace export
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Available backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Memory,
    Postgres,
    LogServer,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Postgres => write!(f, "postgres"),
            Self::LogServer => write!(f, "log_server"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: BackendKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// How long to wait for a pooled connection
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogServerConfig {
    /// Base URL of the log server's HTTP API
    pub url: String,

    pub username: Option<String>,

    pub password: Option<String>,

    /// How often subscriptions poll for new records
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Per-request timeout
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl LogServerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            poll_interval: default_poll_interval(),
            request_timeout: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessingConfig {
    /// Default commit strategy for processors
    #[serde(default)]
    pub commit_strategy: CommitStrategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Service name reported to the trace collector
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: Option<String>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            otlp_endpoint: None,
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl From<&ObservabilityConfig> for TelemetryConfig {
    fn from(config: &ObservabilityConfig) -> Self {
        Self {
            service_name: config.service_name.clone(),
            otlp_endpoint: config.otlp_endpoint.clone(),
            logging: config.logging.clone(),
            metrics: config.metrics.clone(),
        }
    }
}

// Default value functions
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_poll_interval() -> Duration { Duration::from_millis(500) }
fn default_request_timeout() -> Duration { Duration::from_secs(10) }
fn default_service_name() -> String { "eventlog".to_string() }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check that the selected backend has its section.
    pub fn validate(&self) -> Result<()> {
        match self.store.backend {
            BackendKind::Postgres if self.database.is_none() => Err(EventStoreError::configuration(
                "the postgres backend requires a [database] section with a url",
            )),
            BackendKind::LogServer if self.log_server.is_none() => Err(EventStoreError::configuration(
                "the log_server backend requires a [log_server] section with a url",
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.store.backend, BackendKind::Memory);
        assert_eq!(config.processor.commit_strategy, CommitStrategy::AfterHandling);
        assert_eq!(config.observability.service_name, "eventlog");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_postgres_without_database_is_rejected() {
        let config = Config {
            store: StoreConfig {
                backend: BackendKind::Postgres,
            },
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EventStoreError::Configuration(_)));
    }

    #[test]
    fn test_database_config_new_uses_defaults() {
        let db = DatabaseConfig::new("postgres://localhost/eventlog");
        assert_eq!(db.max_connections, 20);
        assert_eq!(db.acquire_timeout, Duration::from_secs(5));
    }
}
