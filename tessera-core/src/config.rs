//! Configuration types

use crate::{ConfigError, TesseraError, TesseraResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// INVALIDATION
// ============================================================================

/// How aggressively the invalidation calculator trims dependents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationMode {
    /// Keep a dependent only when its embed paths or calculated-property
    /// dependencies reach a changed field.
    Precise,
    /// As `Precise`, but any dependent with a calculated property reading
    /// from the changed entity's type is always kept.
    #[default]
    CalculatedConservative,
    /// Ignore diffs and always return the baseline scope.
    Disabled,
}

// ============================================================================
// RETRY
// ============================================================================

/// Bounded exponential backoff for deferred items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Failed attempts after which an item is reported as permanently failed.
    pub max_attempts: u32,
    #[serde(rename = "initial_backoff_ms", with = "duration_millis")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "duration_millis")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(20),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = scaled.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Sum of all backoffs an item waits through before it is given up on.
    pub fn total_budget(&self) -> Duration {
        (1..self.max_attempts).map(|a| self.backoff_for(a)).sum()
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Worker pool and queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub worker_count: usize,
    /// Messages a worker takes per receive.
    pub batch_size: usize,
    #[serde(rename = "poll_interval_ms", with = "duration_millis")]
    pub poll_interval: Duration,
    /// Wall-clock budget for one resolve+write cycle.
    #[serde(rename = "operation_timeout_ms", with = "duration_millis")]
    pub operation_timeout: Duration,
    /// How long a received message stays invisible before redelivery.
    #[serde(rename = "visibility_timeout_ms", with = "duration_millis")]
    pub visibility_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 10,
            poll_interval: Duration::from_millis(500),
            operation_timeout: Duration::from_secs(30),
            visibility_timeout: Duration::from_secs(300),
            retry: RetryConfig::default(),
        }
    }
}

/// Read Store backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadStoreConfig {
    /// LMDB directory; `None` keeps views in memory.
    pub lmdb_path: Option<PathBuf>,
    pub lmdb_max_size_mb: usize,
}

impl Default for ReadStoreConfig {
    fn default() -> Self {
        Self {
            lmdb_path: None,
            lmdb_max_size_mb: 1024,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: "info,tessera_storage=info,tessera_indexer=info".to_string(),
            json_logs: false,
        }
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    pub invalidation_mode: InvalidationMode,
    pub pipeline: PipelineConfig,
    pub read_store: ReadStoreConfig,
    pub telemetry: TelemetryConfig,
}

impl TesseraConfig {
    /// Short intervals and a small retry budget, for tests and local runs.
    pub fn development() -> Self {
        Self {
            invalidation_mode: InvalidationMode::CalculatedConservative,
            pipeline: PipelineConfig {
                worker_count: 2,
                batch_size: 10,
                poll_interval: Duration::from_millis(10),
                operation_timeout: Duration::from_secs(5),
                visibility_timeout: Duration::from_secs(5),
                retry: RetryConfig {
                    max_attempts: 12,
                    initial_backoff: Duration::ZERO,
                    max_backoff: Duration::ZERO,
                    backoff_multiplier: 2.0,
                },
            },
            read_store: ReadStoreConfig::default(),
            telemetry: TelemetryConfig {
                log_filter: "debug".to_string(),
                json_logs: false,
            },
        }
    }

    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(raw: &str) -> TesseraResult<Self> {
        toml::from_str(raw).map_err(|e| {
            TesseraError::Config(ConfigError::Parse {
                reason: e.to_string(),
            })
        })
    }

    /// Defaults overridden from environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply environment overrides on top of `self`.
    ///
    /// # Environment Variables
    /// - `TESSERA_INVALIDATION_MODE`: `precise`, `calculated_conservative` or `disabled`
    /// - `TESSERA_WORKER_COUNT`: Number of pipeline workers
    /// - `TESSERA_BATCH_SIZE`: Messages per receive
    /// - `TESSERA_POLL_INTERVAL_MS`: Idle poll interval
    /// - `TESSERA_OPERATION_TIMEOUT_MS`: Budget for one resolve+write cycle
    /// - `TESSERA_VISIBILITY_TIMEOUT_MS`: In-flight redelivery timeout
    /// - `TESSERA_RETRY_MAX_ATTEMPTS`: Deferred attempts before permanent failure
    /// - `TESSERA_RETRY_INITIAL_BACKOFF_MS` / `TESSERA_RETRY_MAX_BACKOFF_MS`
    /// - `TESSERA_LMDB_PATH` / `TESSERA_LMDB_MAX_SIZE_MB`: LMDB read store
    /// - `TESSERA_LOG_FILTER` / `TESSERA_JSON_LOGS`: Log output
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(mode) = env_parse::<String>("TESSERA_INVALIDATION_MODE") {
            self.invalidation_mode = match mode.to_lowercase().as_str() {
                "precise" => InvalidationMode::Precise,
                "disabled" => InvalidationMode::Disabled,
                _ => InvalidationMode::CalculatedConservative,
            };
        }

        let pipeline = &mut self.pipeline;
        pipeline.worker_count = env_parse("TESSERA_WORKER_COUNT").unwrap_or(pipeline.worker_count);
        pipeline.batch_size = env_parse("TESSERA_BATCH_SIZE").unwrap_or(pipeline.batch_size);
        if let Some(ms) = env_parse("TESSERA_POLL_INTERVAL_MS") {
            pipeline.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("TESSERA_OPERATION_TIMEOUT_MS") {
            pipeline.operation_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("TESSERA_VISIBILITY_TIMEOUT_MS") {
            pipeline.visibility_timeout = Duration::from_millis(ms);
        }
        pipeline.retry.max_attempts =
            env_parse("TESSERA_RETRY_MAX_ATTEMPTS").unwrap_or(pipeline.retry.max_attempts);
        if let Some(ms) = env_parse("TESSERA_RETRY_INITIAL_BACKOFF_MS") {
            pipeline.retry.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("TESSERA_RETRY_MAX_BACKOFF_MS") {
            pipeline.retry.max_backoff = Duration::from_millis(ms);
        }

        if let Some(path) = env_parse::<String>("TESSERA_LMDB_PATH") {
            self.read_store.lmdb_path = Some(PathBuf::from(path));
        }
        self.read_store.lmdb_max_size_mb =
            env_parse("TESSERA_LMDB_MAX_SIZE_MB").unwrap_or(self.read_store.lmdb_max_size_mb);

        if let Some(filter) = env_parse::<String>("TESSERA_LOG_FILTER") {
            self.telemetry.log_filter = filter;
        }
        self.telemetry.json_logs = std::env::var("TESSERA_JSON_LOGS")
            .ok()
            .map(|s| s.to_lowercase() == "true")
            .unwrap_or(self.telemetry.json_logs);

        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - worker_count and batch_size > 0
    /// - operation_timeout and visibility_timeout are positive
    /// - retry.max_attempts > 0 and backoff_multiplier >= 1.0
    /// - retry.initial_backoff <= retry.max_backoff
    pub fn validate(&self) -> TesseraResult<()> {
        let pipeline = &self.pipeline;
        if pipeline.worker_count == 0 {
            return Err(invalid("pipeline.worker_count", "0", "worker_count must be greater than 0"));
        }
        if pipeline.batch_size == 0 {
            return Err(invalid("pipeline.batch_size", "0", "batch_size must be greater than 0"));
        }
        if pipeline.operation_timeout.is_zero() {
            return Err(invalid(
                "pipeline.operation_timeout",
                &format!("{:?}", pipeline.operation_timeout),
                "operation_timeout must be positive",
            ));
        }
        if pipeline.visibility_timeout.is_zero() {
            return Err(invalid(
                "pipeline.visibility_timeout",
                &format!("{:?}", pipeline.visibility_timeout),
                "visibility_timeout must be positive",
            ));
        }
        if pipeline.retry.max_attempts == 0 {
            return Err(invalid(
                "pipeline.retry.max_attempts",
                "0",
                "max_attempts must be greater than 0",
            ));
        }
        if pipeline.retry.backoff_multiplier < 1.0 {
            return Err(invalid(
                "pipeline.retry.backoff_multiplier",
                &pipeline.retry.backoff_multiplier.to_string(),
                "backoff_multiplier must be at least 1.0",
            ));
        }
        if pipeline.retry.initial_backoff > pipeline.retry.max_backoff {
            return Err(invalid(
                "pipeline.retry.initial_backoff",
                &format!("{:?}", pipeline.retry.initial_backoff),
                "initial_backoff must not exceed max_backoff",
            ));
        }
        if self.read_store.lmdb_path.is_some() && self.read_store.lmdb_max_size_mb == 0 {
            return Err(invalid(
                "read_store.lmdb_max_size_mb",
                "0",
                "lmdb_max_size_mb must be greater than 0",
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn invalid(field: &str, value: &str, reason: &str) -> TesseraError {
    TesseraError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

// ============================================================================
// SERDE HELPERS
// ============================================================================

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(TesseraConfig::default().validate().is_ok());
        assert!(TesseraConfig::development().validate().is_ok());
    }

    #[test]
    fn test_default_retry_budget_spans_about_two_minutes() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_attempts, 12);
        let budget = retry.total_budget();
        assert!(budget >= Duration::from_secs(90), "budget {:?}", budget);
        assert!(budget <= Duration::from_secs(180), "budget {:?}", budget);
    }

    #[test]
    fn test_backoff_grows_then_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff_for(1), Duration::from_millis(250));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(500));
        assert_eq!(retry.backoff_for(11), Duration::from_secs(20));
        assert_eq!(retry.backoff_for(200), Duration::from_secs(20));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = TesseraConfig::default();
        config.pipeline.worker_count = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("worker_count"));
    }

    #[test]
    fn test_validate_rejects_shrinking_backoff() {
        let mut config = TesseraConfig::default();
        config.pipeline.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_partial_document() {
        let config = TesseraConfig::from_toml_str(
            r#"
            invalidation_mode = "precise"

            [pipeline]
            worker_count = 8
            operation_timeout_ms = 1500

            [pipeline.retry]
            max_attempts = 5
            "#,
        )
        .expect("toml should parse");
        assert_eq!(config.invalidation_mode, InvalidationMode::Precise);
        assert_eq!(config.pipeline.worker_count, 8);
        assert_eq!(config.pipeline.operation_timeout, Duration::from_millis(1500));
        assert_eq!(config.pipeline.retry.max_attempts, 5);
        assert_eq!(config.pipeline.batch_size, PipelineConfig::default().batch_size);
    }

    #[test]
    fn test_from_toml_reports_parse_errors() {
        let err = TesseraConfig::from_toml_str("pipeline = 3").unwrap_err();
        assert!(matches!(err, TesseraError::Config(ConfigError::Parse { .. })));
    }
}
