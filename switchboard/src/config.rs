//! Engine-wide configuration.

use crate::errors::{ConfigurationError, Result};
use crate::retry::RetryPolicy;
use crate::utils::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Tunables shared by every pipeline and orchestrator started on a connection.
///
/// Durations are (de)serialized as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Workers per stage queue.
    pub stage_concurrency: usize,
    /// Workers per source queue.
    pub source_concurrency: usize,
    /// How often each handshake stage sweeps for timed out units.
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    /// TTL of the sweep lock.
    #[serde(with = "duration_ms")]
    pub sweep_lock_ttl: Duration,
    /// TTL refreshed on every counter write.
    #[serde(with = "duration_ms")]
    pub counter_ttl: Duration,
    /// How long units are kept before `clean` purges them.
    #[serde(with = "duration_ms")]
    pub unit_retention: Duration,
    /// Completion threshold for pipelines that do not set one.
    pub default_completion_threshold: f64,
    /// Stage retry limit for stages that do not set one.
    pub default_stage_retry_limit: u32,
    /// Stage retry delay for stages that do not set one.
    #[serde(with = "duration_ms")]
    pub default_stage_retry_delay: Duration,
    /// Handshake timeout for stages that do not set one.
    #[serde(with = "duration_ms")]
    pub default_handshake_timeout: Duration,
    /// Auto-retries per failed child run.
    pub orchestrator_retry_limit: u32,
    /// Delay before an auto-retry.
    #[serde(with = "duration_ms")]
    pub orchestrator_retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stage_concurrency: 4,
            source_concurrency: 1,
            sweep_interval: Duration::from_secs(5 * MINUTE),
            sweep_lock_ttl: Duration::from_secs(30),
            counter_ttl: Duration::from_secs(5 * DAY),
            unit_retention: Duration::from_secs(5 * DAY),
            default_completion_threshold: 0.9,
            default_stage_retry_limit: 3,
            default_stage_retry_delay: Duration::ZERO,
            default_handshake_timeout: Duration::from_secs(HOUR),
            orchestrator_retry_limit: 1,
            orchestrator_retry_delay: Duration::from_secs(20),
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.default_completion_threshold) {
            return Err(ConfigurationError::new(format!(
                "default_completion_threshold must be within [0, 1], got {}",
                self.default_completion_threshold
            ))
            .into());
        }
        if self.stage_concurrency == 0 || self.source_concurrency == 0 {
            return Err(ConfigurationError::new("worker concurrency must be at least 1").into());
        }
        Ok(())
    }

    /// Sets the workers per stage queue.
    #[must_use]
    pub fn with_stage_concurrency(mut self, workers: usize) -> Self {
        self.stage_concurrency = workers;
        self
    }

    /// Sets the workers per source queue.
    #[must_use]
    pub fn with_source_concurrency(mut self, workers: usize) -> Self {
        self.source_concurrency = workers;
        self
    }

    /// Sets the sweep interval.
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the counter TTL.
    #[must_use]
    pub fn with_counter_ttl(mut self, ttl: Duration) -> Self {
        self.counter_ttl = ttl;
        self
    }

    /// Sets the unit retention window.
    #[must_use]
    pub fn with_unit_retention(mut self, retention: Duration) -> Self {
        self.unit_retention = retention;
        self
    }

    /// Sets the default completion threshold.
    #[must_use]
    pub fn with_default_completion_threshold(mut self, threshold: f64) -> Self {
        self.default_completion_threshold = threshold;
        self
    }

    /// Sets the default stage retry limit and delay.
    #[must_use]
    pub fn with_default_stage_retry(mut self, limit: u32, delay: Duration) -> Self {
        self.default_stage_retry_limit = limit;
        self.default_stage_retry_delay = delay;
        self
    }

    /// Sets the default handshake timeout.
    #[must_use]
    pub fn with_default_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.default_handshake_timeout = timeout;
        self
    }

    /// Sets the orchestrator's auto-retry limit and delay.
    #[must_use]
    pub fn with_orchestrator_retry(mut self, limit: u32, delay: Duration) -> Self {
        self.orchestrator_retry_limit = limit;
        self.orchestrator_retry_delay = delay;
        self
    }

    /// Stage retry policy used when a stage does not set one.
    #[must_use]
    pub fn default_stage_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.default_stage_retry_limit, self.default_stage_retry_delay)
    }

    /// Orchestrator auto-retry policy.
    #[must_use]
    pub fn orchestrator_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.orchestrator_retry_limit, self.orchestrator_retry_delay)
    }
}
