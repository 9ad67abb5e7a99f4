//! Process configuration for the adaptive integration optimizer.
//!
//! A [`NexusConfig`] is built once at startup from an optional JSON/YAML file
//! plus an `AAIN_` environment overlay, validated, and then handed to every
//! component explicitly. Unknown keys are rejected at load time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

pub mod duration;
pub mod sections;

pub use sections::{
    EventBackend, EventSettings, IngestSettings, ParameterBounds, RewardWeights, StoreBackend,
    StoreSettings,
};

/// Prefix for environment overrides, e.g. `AAIN_MIN_THROUGHPUT=250`.
pub const ENV_PREFIX: &str = "AAIN_";

/// Separator for nested keys in env overrides, e.g. `AAIN_STORE__BUCKET`.
pub const ENV_NESTING: &str = "__";

/// Longest accepted interval or timeout.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Variables under the prefix that belong to the binary, not to the config.
const RESERVED_ENV: &[&str] = &["AAIN_CONFIG", "AAIN_SEED_POINTS"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("IO error: {message}")]
    IoError { message: String },

    #[error("Config parsing failed: {message}")]
    ParseFailed { message: String },

    #[error("Config validation failed: {}", render_errors(.errors))]
    ValidationFailed { errors: Vec<ValidationError> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

fn render_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// File formats understood by [`NexusConfig::from_contents`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NexusConfig {
    // Learning loop
    pub rl_learning_rate: f64,
    pub rl_discount_factor: f64,
    pub rl_exploration_rate: f64,
    pub rl_exploration_decay: f64,
    pub rl_min_exploration_rate: f64,
    pub rl_batch_size: usize,
    pub rl_memory_capacity: usize,
    /// Share of the experience buffer held back (most recent first) to validate a retrain.
    pub rl_validation_fraction: f64,
    pub rng_seed: Option<u64>,

    // Monitoring
    #[serde(with = "duration")]
    pub health_check_interval: Duration,
    #[serde(with = "duration")]
    pub metrics_aggregation_window: Duration,
    pub performance_threshold: f64,
    pub degraded_windows_before_failure: u32,
    pub summary_history: usize,
    pub max_samples_per_window: usize,

    // Optimization
    pub max_connection_pool: u32,
    pub min_throughput: f64,
    #[serde(with = "duration")]
    pub max_latency: Duration,
    pub worker_pool_size: usize,

    // Policy lifecycle
    pub ml_model_path: PathBuf,
    #[serde(with = "duration")]
    pub retrain_interval: Duration,

    pub reward: RewardWeights,
    pub bounds: ParameterBounds,
    pub store: StoreSettings,
    pub events: EventSettings,
    pub ingest: IngestSettings,
}

impl Default for NexusConfig {
    fn default() -> Self {
        Self {
            rl_learning_rate: 0.001,
            rl_discount_factor: 0.95,
            rl_exploration_rate: 0.1,
            rl_exploration_decay: 1.0,
            rl_min_exploration_rate: 0.01,
            rl_batch_size: 32,
            rl_memory_capacity: 10_000,
            rl_validation_fraction: 0.2,
            rng_seed: None,
            health_check_interval: Duration::from_secs(30),
            metrics_aggregation_window: Duration::from_secs(300),
            performance_threshold: 0.8,
            degraded_windows_before_failure: 3,
            summary_history: 288,
            max_samples_per_window: 10_000,
            max_connection_pool: 100,
            min_throughput: 100.0,
            max_latency: Duration::from_secs(2),
            worker_pool_size: 16,
            ml_model_path: PathBuf::from("models/integration_policy.json"),
            retrain_interval: Duration::from_secs(86_400),
            reward: RewardWeights::default(),
            bounds: ParameterBounds::default(),
            store: StoreSettings::default(),
            events: EventSettings::default(),
            ingest: IngestSettings::default(),
        }
    }
}

impl NexusConfig {
    /// Load from an optional file plus the process environment.
    #[instrument]
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, overlay_vars(std::env::vars_os())?)
    }

    /// Load from an optional file plus an explicit set of environment variables.
    pub fn load_with_env<I>(path: Option<&Path>, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut value = match path {
            Some(path) => read_config_value(path)?,
            None => Value::Object(Map::new()),
        };

        apply_env_overlay(&mut value, vars)?;

        let config: NexusConfig =
            serde_json::from_value(value).map_err(|e| ConfigError::ParseFailed {
                message: e.to_string(),
            })?;
        config.validate()?;

        info!(
            window_secs = config.metrics_aggregation_window.as_secs(),
            health_check_secs = config.health_check_interval.as_secs(),
            store = ?config.store.backend,
            events = ?config.events.backend,
            "Configuration validation passed"
        );
        Ok(config)
    }

    /// Parse and validate configuration text without touching the environment.
    pub fn from_contents(contents: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let value = parse_value(contents, format)?;
        let config: NexusConfig =
            serde_json::from_value(value).map_err(|e| ConfigError::ParseFailed {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every bound; all violations are reported together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let mut fail = |field: &str, message: String| {
            errors.push(ValidationError {
                field: field.to_string(),
                message,
            })
        };

        if !(self.rl_learning_rate > 0.0 && self.rl_learning_rate <= 1.0) {
            fail(
                "rl_learning_rate",
                format!("must be in (0, 1], got {}", self.rl_learning_rate),
            );
        }
        if !(self.rl_discount_factor > 0.0 && self.rl_discount_factor <= 1.0) {
            fail(
                "rl_discount_factor",
                format!("must be in (0, 1], got {}", self.rl_discount_factor),
            );
        }
        if !(self.performance_threshold > 0.0 && self.performance_threshold <= 1.0) {
            fail(
                "performance_threshold",
                format!("must be in (0, 1], got {}", self.performance_threshold),
            );
        }
        for (field, rate) in [
            ("rl_exploration_rate", self.rl_exploration_rate),
            ("rl_min_exploration_rate", self.rl_min_exploration_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                fail(field, format!("must be in [0, 1], got {}", rate));
            }
        }
        if !(self.rl_exploration_decay > 0.0 && self.rl_exploration_decay <= 1.0) {
            fail(
                "rl_exploration_decay",
                format!("must be in (0, 1], got {}", self.rl_exploration_decay),
            );
        }
        if !(self.rl_validation_fraction > 0.0 && self.rl_validation_fraction < 1.0) {
            fail(
                "rl_validation_fraction",
                format!("must be in (0, 1), got {}", self.rl_validation_fraction),
            );
        }
        if self.rl_memory_capacity == 0 {
            fail("rl_memory_capacity", "must be at least 1".to_string());
        }
        if self.rl_batch_size == 0 || self.rl_batch_size > self.rl_memory_capacity {
            fail(
                "rl_batch_size",
                format!(
                    "must be between 1 and rl_memory_capacity ({}), got {}",
                    self.rl_memory_capacity, self.rl_batch_size
                ),
            );
        }

        for (field, value) in [
            ("health_check_interval", self.health_check_interval),
            ("metrics_aggregation_window", self.metrics_aggregation_window),
            ("retrain_interval", self.retrain_interval),
            ("max_latency", self.max_latency),
            ("store.operation_timeout", self.store.operation_timeout),
        ] {
            if value.is_zero() {
                fail(field, "must be greater than zero".to_string());
            } else if value > MAX_DURATION {
                fail(
                    field,
                    format!("must be at most {}", humantime::format_duration(MAX_DURATION)),
                );
            }
        }

        if !(self.min_throughput > 0.0 && self.min_throughput.is_finite()) {
            fail(
                "min_throughput",
                format!("must be a positive number, got {}", self.min_throughput),
            );
        }
        if self.max_connection_pool == 0 {
            fail("max_connection_pool", "must be at least 1".to_string());
        }
        if self.degraded_windows_before_failure == 0 {
            fail(
                "degraded_windows_before_failure",
                "must be at least 1".to_string(),
            );
        }
        if self.worker_pool_size == 0 {
            fail("worker_pool_size", "must be at least 1".to_string());
        }
        if self.summary_history == 0 {
            fail("summary_history", "must be at least 1".to_string());
        }
        if self.max_samples_per_window == 0 {
            fail("max_samples_per_window", "must be at least 1".to_string());
        }
        if self.store.max_attempts == 0 {
            fail("store.max_attempts", "must be at least 1".to_string());
        }

        let bounds = &self.bounds;
        if bounds.pool_size_min == 0 || bounds.pool_size_min > self.max_connection_pool {
            fail(
                "bounds.pool_size_min",
                format!(
                    "must be between 1 and max_connection_pool ({}), got {}",
                    self.max_connection_pool, bounds.pool_size_min
                ),
            );
        }
        if bounds.pool_size_step == 0 {
            fail("bounds.pool_size_step", "must be at least 1".to_string());
        }
        for (field, min, max, step) in [
            (
                "bounds.timeout",
                bounds.timeout_min,
                bounds.timeout_max,
                bounds.timeout_step,
            ),
            (
                "bounds.retry_backoff",
                bounds.retry_backoff_min,
                bounds.retry_backoff_max,
                bounds.retry_backoff_step,
            ),
        ] {
            if min > max {
                fail(field, format!("min {:?} exceeds max {:?}", min, max));
            }
            if step.is_zero() {
                fail(field, "step must be greater than zero".to_string());
            }
        }

        let reward = &self.reward;
        for (field, weight) in [
            ("reward.throughput_weight", reward.throughput_weight),
            ("reward.latency_weight", reward.latency_weight),
            ("reward.error_weight", reward.error_weight),
            ("reward.rollback_penalty", reward.rollback_penalty),
        ] {
            if !(weight >= 0.0 && weight.is_finite()) {
                fail(field, format!("must be non-negative, got {}", weight));
            }
        }
        // The throughput term is capped at 1.5 * weight.
        if !(reward.status_penalty > 1.5 * reward.throughput_weight) {
            fail(
                "reward.status_penalty",
                format!(
                    "must exceed the maximum throughput gain ({}), got {}",
                    1.5 * reward.throughput_weight,
                    reward.status_penalty
                ),
            );
        }

        if self.store.backend == StoreBackend::JetStream && self.store.nats_url.is_none() {
            fail(
                "store.nats_url",
                "required when store.backend is jetstream".to_string(),
            );
        }
        if self.events.backend == EventBackend::JetStream && self.events.nats_url.is_none() {
            fail(
                "events.nats_url",
                "required when events.backend is jetstream".to_string(),
            );
        }
        if self.ingest.enabled && self.ingest.nats_url.is_none() {
            fail("ingest.nats_url", "required when ingest is enabled".to_string());
        }
        if self.ingest.batch_size == 0 {
            fail("ingest.batch_size", "must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationFailed { errors })
        }
    }
}

fn read_config_value(path: &Path) -> Result<Value, ConfigError> {
    debug!("Loading config from: {:?}", path);

    if !path.exists() {
        return Err(ConfigError::ConfigFileNotFound {
            path: path.to_string_lossy().to_string(),
        });
    }

    let contents = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        message: format!("Failed to read config file: {}", e),
    })?;

    parse_value(&contents, ConfigFormat::from_path(path))
}

fn parse_value(contents: &str, format: ConfigFormat) -> Result<Value, ConfigError> {
    let value: Value = match format {
        ConfigFormat::Json => {
            serde_json::from_str(contents).map_err(|e| ConfigError::ParseFailed {
                message: e.to_string(),
            })?
        }
        ConfigFormat::Yaml => {
            serde_yaml::from_str(contents).map_err(|e| ConfigError::ParseFailed {
                message: e.to_string(),
            })?
        }
    };

    match value {
        Value::Object(_) => Ok(value),
        // An empty YAML document parses as null.
        Value::Null => Ok(Value::Object(Map::new())),
        other => Err(ConfigError::ParseFailed {
            message: format!("config root must be a mapping, found {}", other),
        }),
    }
}

/// Overlay `AAIN_*` variables onto the parsed document.
/// Keep the variables the overlay reads, failing on any under the prefix
/// that is not valid UTF-8. Unrelated variables are never decoded.
fn overlay_vars<I>(vars: I) -> Result<Vec<(String, String)>, ConfigError>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut kept = Vec::new();
    for (name, raw) in vars {
        let lossy = name.to_string_lossy();
        if !lossy.starts_with(ENV_PREFIX) || RESERVED_ENV.contains(&&*lossy) {
            continue;
        }
        let (Some(name), Some(raw)) = (name.to_str(), raw.to_str()) else {
            return Err(ConfigError::ParseFailed {
                message: format!("environment override {} is not valid UTF-8", lossy),
            });
        };
        kept.push((name.to_string(), raw.to_string()));
    }
    Ok(kept)
}

fn apply_env_overlay<I>(value: &mut Value, vars: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (name, raw) in vars {
        let Some(key) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        if RESERVED_ENV.contains(&name.as_str()) || key.is_empty() {
            continue;
        }

        let path: Vec<String> = key
            .split(ENV_NESTING)
            .map(|segment| segment.to_ascii_lowercase())
            .collect();
        if path.iter().any(|segment| segment.is_empty()) {
            return Err(ConfigError::ParseFailed {
                message: format!("malformed environment override {}", name),
            });
        }

        debug!(variable = %name, "Applying environment override");
        set_path(value, &path, env_scalar(&raw), &name)?;
    }
    Ok(())
}

fn set_path(root: &mut Value, path: &[String], leaf: Value, name: &str) -> Result<(), ConfigError> {
    let mut current = root;
    for (idx, segment) in path.iter().enumerate() {
        let map = current
            .as_object_mut()
            .ok_or_else(|| ConfigError::ParseFailed {
                message: format!("{} overrides a non-mapping value", name),
            })?;
        if idx + 1 == path.len() {
            map.insert(segment.clone(), leaf);
            return Ok(());
        }
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(())
}

fn env_scalar(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => v,
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = NexusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.metrics_aggregation_window, Duration::from_secs(300));
        assert_eq!(config.rl_memory_capacity, 10_000);
    }

    #[test]
    fn test_env_overlay_sets_top_level_and_nested_keys() {
        let config = NexusConfig::load_with_env(
            None,
            vars(&[
                ("AAIN_MIN_THROUGHPUT", "250"),
                ("AAIN_MAX_LATENCY", "1500ms"),
                ("AAIN_STORE__BUCKET", "points"),
                ("AAIN_CONFIG", "/ignored.json"),
                ("PATH", "/usr/bin"),
            ]),
        )
        .unwrap();

        assert_eq!(config.min_throughput, 250.0);
        assert_eq!(config.max_latency, Duration::from_millis(1500));
        assert_eq!(config.store.bucket, "points");
    }

    #[test]
    fn test_unknown_env_key_is_rejected() {
        let result = NexusConfig::load_with_env(None, vars(&[("AAIN_NOT_A_KEY", "1")]));
        assert!(matches!(result, Err(ConfigError::ParseFailed { .. })));
    }

    #[test]
    fn test_validation_collects_every_violation() {
        let config = NexusConfig {
            rl_learning_rate: 0.0,
            rl_discount_factor: 1.5,
            performance_threshold: 0.0,
            ..NexusConfig::default()
        };

        match config.validate() {
            Err(ConfigError::ValidationFailed { errors }) => {
                let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
                assert_eq!(
                    fields,
                    vec![
                        "rl_learning_rate",
                        "rl_discount_factor",
                        "performance_threshold"
                    ]
                );
            }
            other => panic!("expected validation failure, got {:?}", other),
        }
    }

    #[test]
    fn test_status_penalty_must_dominate_throughput_gain() {
        let mut config = NexusConfig::default();
        config.reward.throughput_weight = 4.0;
        config.reward.status_penalty = 6.0;
        assert!(config.validate().is_err());

        config.reward.status_penalty = 6.5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_jetstream_store_requires_url() {
        let mut config = NexusConfig::default();
        config.store.backend = StoreBackend::JetStream;
        assert!(config.validate().is_err());

        config.store.nats_url = Some("nats://localhost:4222".to_string());
        assert!(config.validate().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_environment_is_skipped_or_rejected() {
        use std::os::unix::ffi::OsStringExt;

        let invalid = || OsString::from_vec(vec![0x66, 0x6f, 0xff]);
        let kept = overlay_vars(vec![
            (invalid(), OsString::from("x")),
            (OsString::from("HOME"), invalid()),
            (OsString::from("AAIN_CONFIG"), invalid()),
            (OsString::from("AAIN_MIN_THROUGHPUT"), OsString::from("250")),
        ])
        .unwrap();
        assert_eq!(
            kept,
            vec![("AAIN_MIN_THROUGHPUT".to_string(), "250".to_string())]
        );

        let result = overlay_vars(vec![(OsString::from("AAIN_STORE__BUCKET"), invalid())]);
        assert!(matches!(result, Err(ConfigError::ParseFailed { .. })));
    }
}
