// src/config/model.rs

use serde::{Deserialize, Deserializer};
use shared::Timeframe;
use shared::constants::{DEFAULT_BATCH_SIZE, DEFAULT_REPORT_EVERY_ROWS};
use std::time::Duration;
use thiserror::Error;

/// Top-level runtime config
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging:  LoggingConfig,
    pub database: DatabaseConfig,
    pub writer:   WriterConfig,
    pub metrics:  MetricsConfig,
    pub load:     LoadConfig,
}

/// Mirror of the `[logging]` table
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]            pub enable: bool,
    #[serde(default)]            pub file:   Option<String>,
    #[serde(default = "default_level")] pub level: String,
}
fn default_level() -> String { "INFO".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enable: false, file: None, level: default_level() }
    }
}

/// Mirror of the `[database]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path:               String,
    pub synchronous:        String,
    /// SQLite `cache_size`; negative values are KiB.
    pub cache_size:         i64,
    pub temp_store:         String,
    pub busy_timeout_ms:    u64,
    pub journal_size_limit: u64,
    /// 0 disables the idle WAL checkpoint.
    pub checkpoint_seconds: u64,
    pub connect_retry:      RetryConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path:               "market.db".into(),
            synchronous:        "NORMAL".into(),
            cache_size:         -2_000_000,
            temp_store:         "MEMORY".into(),
            busy_timeout_ms:    1_000,
            journal_size_limit: 50_000_000,
            checkpoint_seconds: 0,
            connect_retry:      RetryConfig {
                max_attempts: 5,
                base_delay:   Duration::from_millis(100),
                factor:       2.0,
                max_delay:    None,
            },
        }
    }
}

/// Mirror of the `[writer]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub batch_size:        usize,
    /// 0 keeps the dispatch queue unbounded.
    pub queue_capacity:    usize,
    #[serde(deserialize_with = "human_duration")]
    pub poll_interval:     Duration,
    /// 0 disables the periodic throughput line.
    pub report_every_rows: u64,
    pub on_exhausted:      ExhaustedPolicy,
    pub retry:             RetryConfig,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size:        DEFAULT_BATCH_SIZE,
            queue_capacity:    0,
            poll_interval:     Duration::from_millis(100),
            report_every_rows: DEFAULT_REPORT_EVERY_ROWS,
            on_exhausted:      ExhaustedPolicy::Discard,
            retry:             RetryConfig {
                max_attempts: 5,
                base_delay:   Duration::from_secs(1),
                factor:       1.0,
                max_delay:    None,
            },
        }
    }
}

impl WriterConfig {
    pub fn queue_capacity(&self) -> Option<usize> {
        (self.queue_capacity > 0).then_some(self.queue_capacity)
    }
}

/// What the writer does with a batch it could not write after the
/// reconnect-and-retry pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustedPolicy {
    /// Log it, count it as failed and move on.
    #[default]
    Discard,
    /// Keep it and hand it back from `stop()`.
    Retain,
}

/// One retry schedule; `[database.connect_retry]` and `[writer.retry]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(deserialize_with = "human_duration")]
    pub base_delay:   Duration,
    #[serde(default = "default_factor")]
    pub factor:       f64,
    #[serde(default, deserialize_with = "human_duration_opt")]
    pub max_delay:    Option<Duration>,
}
fn default_factor() -> f64 { 1.0 }

/// Mirror of the `[metrics]` table
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// `host:port` for the Prometheus scrape endpoint; unset means no exporter.
    pub listen: Option<String>,
}

/// Mirror of the `[load]` table driving the synthetic producers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub producers:            usize,
    pub symbols_per_producer: usize,
    pub rows_per_symbol:      usize,
    pub timeframe:            Timeframe,
    pub sma_window:           usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            producers:            4,
            symbols_per_producer: 5,
            rows_per_symbol:      50_000,
            timeframe:            Timeframe::M1,
            sma_window:           20,
        }
    }
}

/// All the ways config loading can go wrong
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Config {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.writer.batch_size == 0 {
            return Err(invalid("writer.batch_size", "must be at least 1"));
        }
        check_retry("writer.retry", &self.writer.retry)?;
        check_retry("database.connect_retry", &self.database.connect_retry)?;
        if self.database.path.trim().is_empty() {
            return Err(invalid("database.path", "must not be empty"));
        }
        Ok(())
    }
}

fn check_retry(field: &'static str, r: &RetryConfig) -> Result<(), ConfigError> {
    if r.max_attempts == 0 {
        return Err(invalid(field, "max_attempts must be at least 1"));
    }
    if !r.factor.is_finite() || r.factor < 1.0 {
        return Err(invalid(field, format!("factor {} must be >= 1.0", r.factor)));
    }
    Ok(())
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}

/// Parse `"250ms"`, `"1s"`, `"2m 30s"` ... Failures surface as
/// [`ConfigError::Toml`] naming the offending value.
fn parse_duration<E: serde::de::Error>(raw: &str) -> Result<Duration, E> {
    humantime::parse_duration(raw)
        .map_err(|e| E::custom(format!("invalid duration '{raw}': {e}")))
}

fn human_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(d)?;
    parse_duration(&raw)
}

fn human_duration_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    Option::<String>::deserialize(d)?
        .map(|raw| parse_duration(&raw))
        .transpose()
}
