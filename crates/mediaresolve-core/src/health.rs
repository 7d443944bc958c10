//! Per-source health records and the derived degradation level.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Consecutive failures at which a source is considered degraded.
pub const DEGRADED_AFTER: u32 = 1;

/// Consecutive failures at which a source is considered down.
pub const DOWN_AFTER: u32 = 3;

/// Health classification of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Down,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Healthy => write!(f, "healthy"),
            ServiceStatus::Degraded => write!(f, "degraded"),
            ServiceStatus::Down => write!(f, "down"),
        }
    }
}

/// Health record for a single source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub name: String,
    pub status: ServiceStatus,
    pub consecutive_errors: u32,
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ServiceHealth {
    /// A source that has not been checked yet is assumed healthy.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ServiceStatus::Healthy,
            consecutive_errors: 0,
            last_success: None,
            last_check: None,
            last_error: None,
        }
    }

    /// Apply a successful probe.
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.status = ServiceStatus::Healthy;
        self.consecutive_errors = 0;
        self.last_success = Some(at);
        self.last_check = Some(at);
        self.last_error = None;
    }

    /// Apply a failed probe using the given thresholds.
    pub fn record_failure(
        &mut self,
        at: DateTime<Utc>,
        error: impl Into<String>,
        degraded_after: u32,
        down_after: u32,
    ) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.last_check = Some(at);
        self.last_error = Some(error.into());
        self.status = classify(self.consecutive_errors, degraded_after, down_after);
    }
}

/// Map a consecutive-error count onto a status.
pub fn classify(consecutive_errors: u32, degraded_after: u32, down_after: u32) -> ServiceStatus {
    if consecutive_errors >= down_after {
        ServiceStatus::Down
    } else if consecutive_errors >= degraded_after {
        ServiceStatus::Degraded
    } else {
        ServiceStatus::Healthy
    }
}

/// Aggregate health across every source. Derived on read, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    Normal,
    Partial,
    Minimal,
    Offline,
}

impl DegradationLevel {
    /// Compute the level from a set of source statuses.
    ///
    /// All down (or no sources at all) is offline; more than half down is
    /// minimal; any degraded or down source makes it partial.
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = ServiceStatus>,
    {
        let (mut total, mut down, mut impaired) = (0usize, 0usize, 0usize);
        for status in statuses {
            total += 1;
            match status {
                ServiceStatus::Down => {
                    down += 1;
                    impaired += 1;
                }
                ServiceStatus::Degraded => impaired += 1,
                ServiceStatus::Healthy => {}
            }
        }

        if total == 0 || down == total {
            DegradationLevel::Offline
        } else if down * 2 > total {
            DegradationLevel::Minimal
        } else if impaired > 0 {
            DegradationLevel::Partial
        } else {
            DegradationLevel::Normal
        }
    }

    /// Compute the level from full health records.
    pub fn from_health<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a ServiceHealth>,
    {
        Self::from_statuses(records.into_iter().map(|h| h.status))
    }

    /// Message suitable for showing to the user as-is.
    pub fn user_message(&self) -> &'static str {
        match self {
            DegradationLevel::Normal => "All metadata sources are available.",
            DegradationLevel::Partial => {
                "Some metadata sources are having trouble; results may be slower or less complete."
            }
            DegradationLevel::Minimal => {
                "Most metadata sources are unavailable; you may need to search manually."
            }
            DegradationLevel::Offline => {
                "No metadata sources are reachable; search manually or try again later."
            }
        }
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradationLevel::Normal => write!(f, "normal"),
            DegradationLevel::Partial => write!(f, "partial"),
            DegradationLevel::Minimal => write!(f, "minimal"),
            DegradationLevel::Offline => write!(f, "offline"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServiceStatus::*;

    #[test]
    fn test_classification_thresholds() {
        assert_eq!(classify(0, DEGRADED_AFTER, DOWN_AFTER), Healthy);
        assert_eq!(classify(1, DEGRADED_AFTER, DOWN_AFTER), Degraded);
        assert_eq!(classify(2, DEGRADED_AFTER, DOWN_AFTER), Degraded);
        assert_eq!(classify(3, DEGRADED_AFTER, DOWN_AFTER), Down);
        assert_eq!(classify(9, DEGRADED_AFTER, DOWN_AFTER), Down);
    }

    #[test]
    fn test_success_resets_errors() {
        let mut health = ServiceHealth::new("catalog");
        let now = Utc::now();
        for _ in 0..3 {
            health.record_failure(now, "timeout", DEGRADED_AFTER, DOWN_AFTER);
        }
        assert_eq!(health.status, Down);

        health.record_success(now);
        assert_eq!(health.status, Healthy);
        assert_eq!(health.consecutive_errors, 0);
        assert!(health.last_error.is_none());
        assert_eq!(health.last_success, Some(now));
    }

    #[test]
    fn test_degradation_levels() {
        assert_eq!(DegradationLevel::from_statuses([Healthy, Healthy]), DegradationLevel::Normal);
        assert_eq!(DegradationLevel::from_statuses([Healthy, Degraded]), DegradationLevel::Partial);
        // exactly half down is still partial
        assert_eq!(
            DegradationLevel::from_statuses([Healthy, Down]),
            DegradationLevel::Partial
        );
        assert_eq!(
            DegradationLevel::from_statuses([Healthy, Down, Down]),
            DegradationLevel::Minimal
        );
        assert_eq!(DegradationLevel::from_statuses([Down, Down]), DegradationLevel::Offline);
        assert_eq!(DegradationLevel::from_statuses([]), DegradationLevel::Offline);
    }

    #[test]
    fn test_level_display_is_verbatim() {
        assert_eq!(DegradationLevel::Minimal.to_string(), "minimal");
        assert_eq!(
            serde_json::to_string(&DegradationLevel::Offline).unwrap(),
            "\"offline\""
        );
    }
}
