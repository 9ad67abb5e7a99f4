//! Nested configuration sections.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Weights for the reward shaping applied one window after an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RewardWeights {
    pub throughput_weight: f64,
    pub latency_weight: f64,
    pub error_weight: f64,
    /// Subtracted when the point's health got worse after the action.
    pub status_penalty: f64,
    /// Extra penalty recorded when the action forced a rollback.
    pub rollback_penalty: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            throughput_weight: 1.0,
            latency_weight: 1.0,
            error_weight: 2.0,
            status_penalty: 5.0,
            rollback_penalty: 10.0,
        }
    }
}

/// Per-dimension limits and step sizes for parameter adjustments.
///
/// The upper pool bound is `max_connection_pool` from the top-level config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParameterBounds {
    pub pool_size_min: u32,
    pub pool_size_step: u32,
    #[serde(with = "crate::duration")]
    pub timeout_min: Duration,
    #[serde(with = "crate::duration")]
    pub timeout_max: Duration,
    #[serde(with = "crate::duration")]
    pub timeout_step: Duration,
    #[serde(with = "crate::duration")]
    pub retry_backoff_min: Duration,
    #[serde(with = "crate::duration")]
    pub retry_backoff_max: Duration,
    #[serde(with = "crate::duration")]
    pub retry_backoff_step: Duration,
}

impl Default for ParameterBounds {
    fn default() -> Self {
        Self {
            pool_size_min: 1,
            pool_size_step: 1,
            timeout_min: Duration::from_secs(1),
            timeout_max: Duration::from_secs(60),
            timeout_step: Duration::from_secs(1),
            retry_backoff_min: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(30),
            retry_backoff_step: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    #[serde(rename = "jetstream")]
    JetStream,
}

/// Settings for the integration-record store collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub nats_url: Option<String>,
    pub bucket: String,
    #[serde(with = "crate::duration")]
    pub operation_timeout: Duration,
    pub max_attempts: u32,
    #[serde(with = "crate::duration")]
    pub retry_backoff: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            nats_url: None,
            bucket: "aain_integrations".to_string(),
            operation_timeout: Duration::from_secs(5),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventBackend {
    Log,
    #[serde(rename = "jetstream")]
    JetStream,
}

/// Where structured observability events are sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventSettings {
    pub backend: EventBackend,
    pub nats_url: Option<String>,
    pub stream_name: String,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            backend: EventBackend::Log,
            nats_url: None,
            stream_name: "AAIN_EVENTS".to_string(),
        }
    }
}

/// JetStream source of raw metrics samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestSettings {
    pub enabled: bool,
    pub nats_url: Option<String>,
    pub stream_name: String,
    pub consumer_name: String,
    /// Messages pulled per batch.
    pub batch_size: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            nats_url: None,
            stream_name: "AAIN_SAMPLES".to_string(),
            consumer_name: "aain-optimizer".to_string(),
            batch_size: 100,
        }
    }
}
