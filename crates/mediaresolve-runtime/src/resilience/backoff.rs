//! Exponential backoff with symmetric jitter for background retries.
//!
//! | Attempt | Base delay | With ±10% jitter |
//! |---------|------------|------------------|
//! | 0       | 1s         | 0.9s – 1.1s      |
//! | 1       | 2s         | 1.8s – 2.2s      |
//! | 2       | 4s         | 3.6s – 4.4s      |
//! | 3       | 8s         | 7.2s – 8.0s      |
//!
//! Jittered delays are clamped so they never exceed the ceiling.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_str;

/// Backoff policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay for attempt 0
    #[serde(with = "duration_str")]
    pub base_delay: Duration,

    /// Growth factor per attempt
    pub multiplier: f64,

    /// Ceiling for any delay, jitter included
    #[serde(with = "duration_str")]
    pub max_delay: Duration,

    /// Symmetric jitter as a fraction of the delay (0.1 = ±10%)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(8),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay without jitter: `min(max_delay, base × multiplier^attempt)`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let scaled = base_ms * self.multiplier.max(1.0).powi(exponent);
        let capped = if scaled.is_finite() { scaled.min(max_ms) } else { max_ms };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Jittered delay for an attempt using the thread-local RNG.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::rng())
    }

    /// Jittered delay drawn from `rng`, within `±jitter` of the base delay and
    /// never above `max_delay`.
    pub fn delay_with_rng(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base = self.base_delay_for(attempt).as_millis() as f64;
        if base <= 0.0 {
            return Duration::ZERO;
        }

        let spread = base * self.jitter.clamp(0.0, 1.0);
        let upper_cap = self.max_delay.as_millis() as f64;
        let lower = (base - spread).max(0.0);
        let upper = (base + spread).min(upper_cap).max(lower);

        let ms = if upper > lower {
            rng.random_range(lower..=upper)
        } else {
            lower
        };
        Duration::from_millis(ms.round() as u64)
    }

    /// The un-jittered schedule for the first `attempts` attempts.
    pub fn schedule(&self, attempts: u32) -> Vec<Duration> {
        (0..attempts).map(|a| self.base_delay_for(a)).collect()
    }
}
