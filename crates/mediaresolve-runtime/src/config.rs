//! Runtime configuration.
//!
//! Every section has defaults, so an empty document is a valid config.
//! Durations are written in human form ("100ms", "30s", "1h").
//!
//! ```yaml
//! breaker:
//!   failure_threshold: 5
//!   open_timeout: 30s
//! orchestrator:
//!   source_timeout: 10s
//!   request_deadline: 30s
//! retry:
//!   backoff:
//!     base_delay: 1s
//!     max_delay: 8s
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::resilience::{BackoffPolicy, CircuitBreakerConfig};

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Serde helpers for human-readable durations.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

/// Sweep timing for the fallback orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Timeout for a single source call
    #[serde(with = "duration_str")]
    pub source_timeout: Duration,

    /// Pause between consecutive source invocations
    #[serde(with = "duration_str")]
    pub inter_source_delay: Duration,

    /// Cap on the summed inter-source pauses of one request
    #[serde(with = "duration_str")]
    pub max_total_delay: Duration,

    /// Overall deadline for one resolution request
    #[serde(with = "duration_str")]
    pub request_deadline: Duration,

    /// Timeout for the keyword-variant generation step
    #[serde(with = "duration_str")]
    pub keyword_timeout: Duration,

    /// Hand transient failures to the retry queue when a sweep comes up empty
    pub queue_transient_failures: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            source_timeout: Duration::from_secs(10),
            inter_source_delay: Duration::from_millis(100),
            max_total_delay: Duration::from_millis(900),
            request_deadline: Duration::from_secs(30),
            keyword_timeout: Duration::from_secs(5),
            queue_transient_failures: true,
        }
    }
}

/// Retry queue and scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub backoff: BackoffPolicy,

    /// Executions before an item is given up on
    pub max_attempts: u32,

    /// Scheduler tick period
    #[serde(with = "duration_str")]
    pub tick_interval: Duration,

    /// Items executed concurrently per tick
    pub max_concurrent: usize,

    /// Timeout for one scheduled execution
    #[serde(with = "duration_str")]
    pub execution_timeout: Duration,

    /// How long a claim holds an item. An item still in flight after this
    /// is due again.
    #[serde(with = "duration_str")]
    pub claim_lease: Duration,

    /// Capacity of the retry event channel
    pub event_capacity: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: 4,
            tick_interval: Duration::from_secs(1),
            max_concurrent: 4,
            execution_timeout: Duration::from_secs(30),
            claim_lease: Duration::from_secs(120),
            event_capacity: 256,
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Period between check cycles
    #[serde(with = "duration_str")]
    pub check_interval: Duration,

    /// Timeout for one probe
    #[serde(with = "duration_str")]
    pub check_timeout: Duration,

    /// Consecutive failures before a source is degraded
    pub degraded_after: u32,

    /// Consecutive failures before a source is down
    pub down_after: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            check_timeout: Duration::from_secs(5),
            degraded_after: mediaresolve_core::health::DEGRADED_AFTER,
            down_after: mediaresolve_core::health::DOWN_AFTER,
        }
    }
}

/// Resolution cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    pub max_entries: u64,

    #[serde(with = "duration_str")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub breaker: CircuitBreakerConfig,
    pub orchestrator: OrchestratorConfig,
    pub retry: RetryConfig,
    pub health: HealthConfig,
    pub cache: CacheConfig,
}

impl RuntimeConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check thresholds and that synchronous timeouts fit the request deadline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be at least 1".into());
        }
        if self.breaker.success_threshold == 0 {
            return invalid("breaker.success_threshold must be at least 1".into());
        }
        if self.breaker.max_half_open_probes == 0 {
            return invalid("breaker.max_half_open_probes must be at least 1".into());
        }

        let deadline = self.orchestrator.request_deadline;
        if deadline.is_zero() {
            return invalid("orchestrator.request_deadline must be positive".into());
        }
        for (name, value) in [
            ("orchestrator.source_timeout", self.orchestrator.source_timeout),
            ("orchestrator.keyword_timeout", self.orchestrator.keyword_timeout),
            ("orchestrator.max_total_delay", self.orchestrator.max_total_delay),
            ("retry.backoff.max_delay", self.retry.backoff.max_delay),
        ] {
            if value > deadline {
                return invalid(format!(
                    "{name} ({}) exceeds orchestrator.request_deadline ({})",
                    humantime::format_duration(value),
                    humantime::format_duration(deadline)
                ));
            }
        }

        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        if self.retry.max_concurrent == 0 {
            return invalid("retry.max_concurrent must be at least 1".into());
        }
        if self.retry.claim_lease <= self.retry.execution_timeout {
            return invalid(format!(
                "retry.claim_lease ({}) must exceed retry.execution_timeout ({})",
                humantime::format_duration(self.retry.claim_lease),
                humantime::format_duration(self.retry.execution_timeout)
            ));
        }
        if self.retry.backoff.multiplier < 1.0 {
            return invalid("retry.backoff.multiplier must be >= 1.0".into());
        }
        if !(0.0..=1.0).contains(&self.retry.backoff.jitter) {
            return invalid("retry.backoff.jitter must be within 0.0..=1.0".into());
        }

        if self.health.degraded_after == 0 || self.health.down_after < self.health.degraded_after {
            return invalid("health thresholds must satisfy 1 <= degraded_after <= down_after".into());
        }

        Ok(())
    }
}
