//! Circuit breaker to isolate failing sources.
//!
//! When a source fails repeatedly its circuit opens and calls are rejected
//! without touching the source until the open timeout elapses. The breaker
//! then admits a bounded number of half-open probes.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::duration_str;

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures before opening circuit
    pub failure_threshold: u32,

    /// Probe successes needed to close from half-open
    pub success_threshold: u32,

    /// Time before attempting recovery
    #[serde(with = "duration_str")]
    pub open_timeout: Duration,

    /// Concurrent probes admitted while half-open
    pub max_half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            max_half_open_probes: 1,
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Calls are rejected without invoking the source
    Open,

    /// Testing whether the source recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Why a guarded call did not produce a value.
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    #[error("Circuit '{name}' is open, retry in {retry_in:?}")]
    Open { name: String, retry_in: Duration },

    #[error("Circuit '{name}' is half-open and all probe slots are taken")]
    ProbeLimit { name: String },

    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// True when the call was rejected without invoking the operation.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, BreakerError::Inner(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Point-in-time view of a breaker, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
}

/// Admission granted by the breaker; a probe holds a semaphore permit.
enum Admission {
    Normal,
    Probe(#[allow(dead_code)] OwnedSemaphorePermit),
}

/// Circuit breaker guarding a single source.
///
/// Each source owns its own breaker so sources recover independently.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    probes: Arc<Semaphore>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker for a named source.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let probes = Arc::new(Semaphore::new(config.max_half_open_probes.max(1) as usize));
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
            }),
            probes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `op` through the breaker; every error counts as a failure.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with(op, |_| true).await
    }

    /// Run `op` through the breaker, counting only errors for which
    /// `counts_as_failure` returns true. Other errors are passed through
    /// and treated as a healthy response.
    pub async fn execute_with<T, E, F, Fut, P>(
        &self,
        op: F,
        counts_as_failure: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let admission = self.admit()?;
        let result = op().await;

        match &result {
            Ok(_) => self.on_success(),
            Err(e) if counts_as_failure(e) => self.on_failure(),
            Err(_) => self.on_success(),
        }
        drop(admission);

        result.map_err(BreakerError::Inner)
    }

    /// Current state, applying the open-timeout transition if it is due.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Whether calls are currently being rejected outright.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
        }
    }

    /// Force the circuit closed and clear counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let old = inner.state;
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.opened_at = None;
        if old != CircuitState::Closed {
            tracing::info!(source = %self.name, from = %old, to = %CircuitState::Closed, "Circuit manually reset");
        }
    }

    fn admit<E>(&self) -> Result<Admission, BreakerError<E>> {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let retry_in = inner
                    .opened_at
                    .map(|at| self.config.open_timeout.saturating_sub(at.elapsed()))
                    .unwrap_or(self.config.open_timeout);
                Err(BreakerError::Open {
                    name: self.name.clone(),
                    retry_in,
                })
            }
            CircuitState::HalfOpen => match Arc::clone(&self.probes).try_acquire_owned() {
                Ok(permit) => Ok(Admission::Probe(permit)),
                Err(_) => Err(BreakerError::ProbeLimit {
                    name: self.name.clone(),
                }),
            },
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.opened_at = None;
                }
            }
            // A late probe result after another probe already reopened the circuit.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    tracing::warn!(
                        source = %self.name,
                        failures = inner.failures,
                        "Circuit opened after repeated failures"
                    );
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.failures += 1;
                tracing::warn!(source = %self.name, "Circuit reopened after failed recovery probe");
                self.open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, inner: &mut Inner) {
        self.transition(inner, CircuitState::Open);
        inner.successes = 0;
        inner.opened_at = Some(Instant::now());
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let due = inner
            .opened_at
            .map(|at| at.elapsed() >= self.config.open_timeout)
            .unwrap_or(true);
        if due {
            self.transition(inner, CircuitState::HalfOpen);
            inner.successes = 0;
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        tracing::info!(source = %self.name, from = %from, to = %to, "Circuit state transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    struct Boom;

    fn breaker(failure_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "catalog",
            CircuitBreakerConfig {
                failure_threshold,
                ..Default::default()
            },
        )
    }

    async fn fail(cb: &CircuitBreaker, calls: &AtomicU32) -> Result<(), BreakerError<Boom>> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Boom)
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, BreakerError<Boom>> {
        cb.execute(|| async { Ok::<_, Boom>(7) }).await
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("catalog", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_source() {
        let cb = breaker(5);
        let calls = AtomicU32::new(0);

        for _ in 0..5 {
            assert!(matches!(fail(&cb, &calls).await, Err(BreakerError::Inner(Boom))));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // the sixth call is rejected without invoking the operation
        let result = fail(&cb, &calls).await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = breaker(3);
        let calls = AtomicU32::new(0);

        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.snapshot().failures, 0);

        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout_and_close_on_successes() {
        let cb = breaker(1);
        let calls = AtomicU32::new(0);
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens() {
        let cb = breaker(1);
        let calls = AtomicU32::new(0);
        let _ = fail(&cb, &calls).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Open);

        // the timer restarted with the reopen
        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_half_open_probe() {
        let cb = Arc::new(breaker(1));
        let calls = AtomicU32::new(0);
        let _ = fail(&cb, &calls).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let first = {
            let cb = Arc::clone(&cb);
            tokio::spawn(async move {
                cb.execute(|| async move {
                    let _ = wait.await;
                    Ok::<_, Boom>(1)
                })
                .await
            })
        };
        // let the first probe take its permit
        tokio::task::yield_now().await;

        let second = succeed(&cb).await;
        assert!(matches!(second, Err(BreakerError::ProbeLimit { .. })));

        release.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_excluded_errors_do_not_trip() {
        let cb = breaker(1);
        let result = cb
            .execute_with(|| async { Err::<(), _>(Boom) }, |_| false)
            .await;
        assert!(matches!(result, Err(BreakerError::Inner(Boom))));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let cb = breaker(1);
        let calls = AtomicU32::new(0);
        let _ = fail(&cb, &calls).await;
        assert!(cb.is_open());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }
}
