//! Periodic source health checks.
//!
//! Each registered [`HealthChecker`] is probed once per cycle. Consecutive
//! failures move a source from healthy to degraded to down; a single success
//! restores it. The aggregate [`DegradationLevel`] is derived on read.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use mediaresolve_core::{DegradationLevel, ServiceHealth, ServiceStatus};

use crate::config::HealthConfig;
use crate::sources::{SourceBinding, SourceError, SourceRegistry};

/// A health probe for one named service.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<(), SourceError>;
}

/// Default probe for a registered source. Fails while the provider reports
/// itself unavailable or its circuit is open.
pub struct SourceProbe {
    binding: SourceBinding,
}

impl SourceProbe {
    pub fn new(binding: SourceBinding) -> Self {
        Self { binding }
    }
}

#[async_trait]
impl HealthChecker for SourceProbe {
    fn name(&self) -> &str {
        self.binding.name()
    }

    async fn check(&self) -> Result<(), SourceError> {
        if !self.binding.provider.is_available() {
            return Err(SourceError::Unavailable("source disabled".into()));
        }
        if self.binding.breaker.is_open() {
            return Err(SourceError::Unavailable("circuit open".into()));
        }
        Ok(())
    }
}

/// Tracks per-source health.
pub struct HealthMonitor {
    checkers: Vec<Arc<dyn HealthChecker>>,
    records: RwLock<BTreeMap<String, ServiceHealth>>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            checkers: Vec::new(),
            records: RwLock::new(BTreeMap::new()),
            config,
        }
    }

    /// A monitor with a [`SourceProbe`] for every registered source.
    pub fn for_registry(registry: &SourceRegistry, config: HealthConfig) -> Self {
        let mut monitor = Self::new(config);
        for binding in registry.iter() {
            monitor.register(Arc::new(SourceProbe::new(binding.clone())));
        }
        monitor
    }

    /// Add or replace the checker for a service.
    pub fn register(&mut self, checker: Arc<dyn HealthChecker>) {
        let name = checker.name().to_string();
        self.checkers.retain(|c| c.name() != name);
        self.records
            .write()
            .entry(name.clone())
            .or_insert_with(|| ServiceHealth::new(name));
        self.checkers.push(checker);
    }

    /// Run one check cycle over every checker concurrently.
    pub async fn check_all(&self) -> Vec<ServiceHealth> {
        let timeout = self.config.check_timeout;
        let probes = self.checkers.iter().map(|checker| async move {
            let result = match tokio::time::timeout(timeout, checker.check()).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout(timeout)),
            };
            (checker.name().to_string(), result)
        });
        let results = join_all(probes).await;

        let now = Utc::now();
        let mut records = self.records.write();
        let mut updated = Vec::with_capacity(results.len());
        for (name, result) in results {
            let record = records
                .entry(name.clone())
                .or_insert_with(|| ServiceHealth::new(name.clone()));
            let before = record.status;
            match result {
                Ok(()) => record.record_success(now),
                Err(e) => {
                    record.record_failure(now, e.to_string(), self.config.degraded_after, self.config.down_after)
                }
            }
            if record.status != before {
                log_transition(record, before);
            }
            updated.push(record.clone());
        }
        updated
    }

    /// Aggregate level across every tracked source.
    pub fn degradation_level(&self) -> DegradationLevel {
        DegradationLevel::from_health(self.records.read().values())
    }

    /// Health records keyed by source name.
    pub fn service_health(&self) -> BTreeMap<String, ServiceHealth> {
        self.records.read().clone()
    }

    pub fn health_of(&self, name: &str) -> Option<ServiceHealth> {
        self.records.read().get(name).cloned()
    }

    /// Whether the last checks classified `name` as down.
    pub fn is_down(&self, name: &str) -> bool {
        self.records
            .read()
            .get(name)
            .is_some_and(|h| h.status == ServiceStatus::Down)
    }

    /// Check on a fixed interval until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval = ?self.config.check_interval, sources = self.checkers.len(), "Health monitor started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_all().await;
                    tracing::debug!(level = %self.degradation_level(), "Health check cycle finished");
                }
            }
        }
        tracing::info!("Health monitor stopped");
    }
}

fn log_transition(record: &ServiceHealth, before: ServiceStatus) {
    match record.status {
        ServiceStatus::Healthy => tracing::info!(
            source = %record.name,
            from = %before,
            to = %record.status,
            "Source recovered"
        ),
        _ => tracing::warn!(
            source = %record.name,
            from = %before,
            to = %record.status,
            consecutive_errors = record.consecutive_errors,
            error = record.last_error.as_deref().unwrap_or(""),
            "Source health changed"
        ),
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("services", &self.records.read().keys().collect::<Vec<_>>())
            .field("level", &self.degradation_level())
            .finish()
    }
}
