//! Periodic execution of due retry items.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use mediaresolve_core::SearchRequest;

use super::queue::Settled;
use super::{RetryError, RetryItem, RetryQueue, SEARCH_TASK};
use crate::cache::ResolutionCache;
use crate::config::RetryConfig;
use crate::resilience::BreakerError;
use crate::sources::{SourceError, SourceRegistry};

/// Why a scheduled execution failed.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Circuit open for source '{0}'")]
    CircuitOpen(String),

    #[error("Unknown source '{0}'")]
    UnknownSource(String),

    #[error("Unsupported task type '{0}'")]
    UnsupportedTaskType(String),

    #[error("Invalid task payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Source returned no results")]
    NoResults,

    #[error("Task panicked: {0}")]
    Panicked(String),
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Runs one claimed retry item.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, item: &RetryItem) -> Result<(), TaskError>;
}

/// Payload of a [`SEARCH_TASK`] item: one source, one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchTask {
    pub source: String,
    pub request: SearchRequest,
}

impl SearchTask {
    pub fn new(source: impl Into<String>, request: SearchRequest) -> Self {
        Self {
            source: source.into(),
            request,
        }
    }

    /// Stable task id; one pending retry per source and request.
    pub fn task_id(&self) -> String {
        format!("{}:{}:{}", SEARCH_TASK, self.source, self.request.cache_key())
    }

    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(payload.clone())
    }
}

/// Re-runs a queued source search through the source's breaker and primes
/// the resolution cache with the best item.
pub struct SearchTaskExecutor {
    sources: Arc<SourceRegistry>,
    cache: Option<ResolutionCache>,
    source_timeout: Duration,
}

impl SearchTaskExecutor {
    pub fn new(sources: Arc<SourceRegistry>, source_timeout: Duration) -> Self {
        Self {
            sources,
            cache: None,
            source_timeout,
        }
    }

    pub fn with_cache(mut self, cache: ResolutionCache) -> Self {
        self.cache = Some(cache);
        self
    }
}

#[async_trait]
impl TaskExecutor for SearchTaskExecutor {
    async fn execute(&self, item: &RetryItem) -> Result<(), TaskError> {
        if item.task_type != SEARCH_TASK {
            return Err(TaskError::UnsupportedTaskType(item.task_type.clone()));
        }
        let task = SearchTask::from_payload(&item.payload)?;
        let binding = self
            .sources
            .get(&task.source)
            .ok_or_else(|| TaskError::UnknownSource(task.source.clone()))?;

        let provider = binding.provider.clone();
        let request = &task.request;
        let timeout = self.source_timeout;
        let outcome = binding
            .breaker
            .execute_with(
                move || async move {
                    match tokio::time::timeout(timeout, provider.search(request)).await {
                        Ok(result) => result,
                        Err(_) => Err(SourceError::Timeout(timeout)),
                    }
                },
                SourceError::counts_against_source,
            )
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(BreakerError::Inner(e)) => return Err(TaskError::Source(e)),
            Err(_) => return Err(TaskError::CircuitOpen(task.source.clone())),
        };

        let mut item = result.best(request).ok_or(TaskError::NoResults)?;
        if item.source != task.source {
            item.source = task.source.clone();
        }
        tracing::info!(source = %task.source, query = %request.query, id = %item.id, "Retried search resolved");
        if let Some(cache) = &self.cache {
            cache.insert(request, item).await;
        }
        Ok(())
    }
}

/// Counts from one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    pub errors: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0 && self.errors == 0
    }
}

enum ItemOutcome {
    Lost,
    Succeeded,
    Rescheduled,
    Exhausted,
}

/// Executes due items with bounded concurrency on a fixed tick.
pub struct RetryScheduler {
    queue: Arc<RetryQueue>,
    executor: Arc<dyn TaskExecutor>,
    config: RetryConfig,
}

impl RetryScheduler {
    pub fn new(queue: Arc<RetryQueue>, executor: Arc<dyn TaskExecutor>, config: RetryConfig) -> Self {
        Self {
            queue,
            executor,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    /// Run one tick against the current time.
    pub async fn tick(&self) -> Result<TickReport, RetryError> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick treating `now` as the current time.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, RetryError> {
        let due = self.queue.due(now, usize::MAX).await?;
        if due.is_empty() {
            return Ok(TickReport::default());
        }
        tracing::debug!(due = due.len(), "Retry tick");

        let outcomes: Vec<_> = stream::iter(due)
            .map(|item| self.run_item(item, now))
            .buffer_unordered(self.config.max_concurrent.max(1))
            .collect()
            .await;

        let mut report = TickReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(ItemOutcome::Lost) => {}
                Ok(ItemOutcome::Succeeded) => {
                    report.claimed += 1;
                    report.succeeded += 1;
                }
                Ok(ItemOutcome::Rescheduled) => {
                    report.claimed += 1;
                    report.rescheduled += 1;
                }
                Ok(ItemOutcome::Exhausted) => {
                    report.claimed += 1;
                    report.exhausted += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to settle retry item");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    async fn run_item(&self, item: RetryItem, now: DateTime<Utc>) -> Result<ItemOutcome, RetryError> {
        let Some(claimed) = self.queue.claim(item, now).await? else {
            return Ok(ItemOutcome::Lost);
        };

        // a panicking executor still settles its attempt
        let timeout = self.config.execution_timeout;
        let execution = AssertUnwindSafe(self.executor.execute(&claimed)).catch_unwind();
        let result = match tokio::time::timeout(timeout, execution).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(task_id = %claimed.task_id, panic = %message, "Retry executor panicked");
                Err(TaskError::Panicked(message))
            }
            Err(_) => Err(TaskError::Source(SourceError::Timeout(timeout))),
        };

        match result {
            Ok(()) => {
                self.queue.complete(&claimed).await?;
                Ok(ItemOutcome::Succeeded)
            }
            Err(e) => {
                let settled_at = now.max(Utc::now());
                match self.queue.fail(&claimed, e.to_string(), settled_at).await? {
                    Settled::Rescheduled(_) => Ok(ItemOutcome::Rescheduled),
                    Settled::Exhausted(_) => Ok(ItemOutcome::Exhausted),
                }
            }
        }
    }

    /// Tick until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval = ?self.config.tick_interval, "Retry scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) if !report.is_idle() => {
                            tracing::debug!(
                                succeeded = report.succeeded,
                                rescheduled = report.rescheduled,
                                exhausted = report.exhausted,
                                "Retry tick finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Retry tick failed"),
                    }
                }
            }
        }
        tracing::info!("Retry scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitBreakerConfig;
    use crate::retry::{InMemoryRetryStore, RetryEvent};
    use crate::sources::{Provider, SearchResult};
    use mediaresolve_core::MetadataItem;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` executions with a timeout.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl TaskExecutor for Flaky {
        async fn execute(&self, _item: &RetryItem) -> Result<(), TaskError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(SourceError::Timeout(Duration::from_secs(1)).into())
            } else {
                Ok(())
            }
        }
    }

    fn scheduler(executor: Arc<dyn TaskExecutor>) -> RetryScheduler {
        let config = RetryConfig::default();
        let queue = Arc::new(RetryQueue::new(Arc::new(InMemoryRetryStore::new()), &config));
        RetryScheduler::new(queue, executor, config)
    }

    async fn enqueue(scheduler: &RetryScheduler, task_id: &str) {
        scheduler
            .queue()
            .queue_retry(
                task_id,
                SEARCH_TASK,
                serde_json::json!({}),
                &SourceError::Timeout(Duration::from_secs(10)),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_item_not_run_before_due() {
        let executor = Flaky::new(0);
        let scheduler = scheduler(executor.clone());
        enqueue(&scheduler, "t").await;

        let report = scheduler.tick_at(Utc::now()).await.unwrap();
        assert!(report.is_idle());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_deletes_item() {
        let executor = Flaky::new(1);
        let scheduler = scheduler(executor.clone());
        let mut events = scheduler.queue().subscribe();
        enqueue(&scheduler, "t").await;

        let t0 = Utc::now() + chrono::Duration::seconds(5);
        let report = scheduler.tick_at(t0).await.unwrap();
        assert_eq!(report.rescheduled, 1);

        let t1 = t0 + chrono::Duration::seconds(10);
        let report = scheduler.tick_at(t1).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(scheduler.queue().get_pending().await.unwrap().is_empty());

        let mut succeeded = false;
        while let Ok(event) = events.try_recv() {
            if let RetryEvent::Succeeded { attempts, .. } = event {
                assert_eq!(attempts, 2);
                succeeded = true;
            }
        }
        assert!(succeeded);
    }

    #[tokio::test]
    async fn test_deleted_after_exactly_max_attempts() {
        let executor = Flaky::new(u32::MAX);
        let scheduler = scheduler(executor.clone());
        enqueue(&scheduler, "t").await;

        let mut now = Utc::now();
        for tick in 1..=4 {
            now += chrono::Duration::seconds(30);
            let report = scheduler.tick_at(now).await.unwrap();
            assert_eq!(report.claimed, 1);
            let queued = scheduler.queue().is_queued("t").await.unwrap();
            assert_eq!(queued, tick < 4, "tick {tick}");
        }
        assert_eq!(executor.calls.load(Ordering::SeqCst), 4);

        now += chrono::Duration::seconds(30);
        assert!(scheduler.tick_at(now).await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_bounded_concurrency_runs_all_due_items() {
        let executor = Flaky::new(0);
        let scheduler = scheduler(executor.clone());
        for i in 0..10 {
            enqueue(&scheduler, &format!("t{i}")).await;
        }

        let report = scheduler
            .tick_at(Utc::now() + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(report.succeeded, 10);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let executor = Flaky::new(0);
        let mut config = RetryConfig::default();
        config.tick_interval = Duration::from_millis(10);
        let queue = Arc::new(RetryQueue::new(Arc::new(InMemoryRetryStore::new()), &config));
        let scheduler = Arc::new(RetryScheduler::new(queue.clone(), executor, config));
        let mut events = queue.subscribe();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(cancel.clone()));

        enqueue(&scheduler, "t").await;
        queue.trigger_immediate("t").await.unwrap();

        let succeeded = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(RetryEvent::Succeeded { task_id, .. }) = events.recv().await {
                    return task_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(succeeded, "t");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    /// Fails every execution with a server error.
    struct ServerError;

    #[async_trait]
    impl TaskExecutor for ServerError {
        async fn execute(&self, _item: &RetryItem) -> Result<(), TaskError> {
            Err(SourceError::Http {
                status: 500,
                message: "Internal Server Error".into(),
            }
            .into())
        }
    }

    #[tokio::test]
    async fn test_server_error_reschedules() {
        let scheduler = scheduler(Arc::new(ServerError));
        enqueue(&scheduler, "t").await;

        let report = scheduler
            .tick_at(Utc::now() + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.rescheduled, 1);
        assert_eq!(report.exhausted, 0);

        let item = scheduler.queue().get("t").await.unwrap().unwrap();
        assert_eq!(item.attempts, 1);
        assert!(!item.is_in_flight());
        assert!(item.last_error.unwrap().contains("500"));
    }

    /// Panics on the first execution, succeeds afterwards.
    struct PanicsOnce {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TaskExecutor for PanicsOnce {
        async fn execute(&self, _item: &RetryItem) -> Result<(), TaskError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("executor bug");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_executor_panic_counts_as_failed_attempt() {
        let executor = Arc::new(PanicsOnce {
            calls: AtomicU32::new(0),
        });
        let scheduler = scheduler(executor.clone());
        enqueue(&scheduler, "t").await;

        let t0 = Utc::now() + chrono::Duration::seconds(5);
        let report = scheduler.tick_at(t0).await.unwrap();
        assert_eq!(report.rescheduled, 1);
        assert_eq!(report.errors, 0);

        let item = scheduler.queue().get("t").await.unwrap().unwrap();
        assert!(!item.is_in_flight());
        assert_eq!(item.attempts, 1);
        assert!(item.last_error.unwrap().contains("executor bug"));

        let report = scheduler.tick_at(t0 + chrono::Duration::seconds(10)).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abandoned_claim_runs_after_lease() {
        let executor = Flaky::new(0);
        let scheduler = scheduler(executor.clone());
        enqueue(&scheduler, "t").await;

        // claimed by a worker that never settles it
        let now = Utc::now();
        let item = scheduler.queue().get("t").await.unwrap().unwrap();
        scheduler.queue().claim(item, now).await.unwrap().unwrap();

        let report = scheduler.tick_at(now + chrono::Duration::seconds(30)).await.unwrap();
        assert!(report.is_idle());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

        let lease = chrono::Duration::from_std(RetryConfig::default().claim_lease).unwrap();
        let report = scheduler
            .tick_at(now + lease + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.queue().is_queued("t").await.unwrap());
    }

    /// Counts executions and yields once before succeeding.
    struct Yielding {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TaskExecutor for Yielding {
        async fn execute(&self, _item: &RetryItem) -> Result<(), TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_ticks_run_item_once() {
        let executor = Arc::new(Yielding {
            calls: AtomicU32::new(0),
        });
        let scheduler = scheduler(executor.clone());
        enqueue(&scheduler, "t").await;

        let now = Utc::now() + chrono::Duration::seconds(5);
        let (a, b) = tokio::join!(scheduler.tick_at(now), scheduler.tick_at(now));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.claimed + b.claimed, 1);
        assert!(a.claimed == 0 || b.claimed == 0);
        assert_eq!(a.succeeded + b.succeeded, 1);
        assert!(!scheduler.queue().is_queued("t").await.unwrap());
    }

    struct Catalog;

    #[async_trait]
    impl Provider for Catalog {
        async fn search(&self, request: &SearchRequest) -> Result<SearchResult, SourceError> {
            Ok(SearchResult::new(vec![MetadataItem::new("42", request.query.clone(), "tmdb")]))
        }

        fn name(&self) -> &str {
            "tmdb"
        }
    }

    #[tokio::test]
    async fn test_search_executor_primes_cache() {
        let mut registry = SourceRegistry::new(CircuitBreakerConfig::default());
        registry.register(Arc::new(Catalog));
        let cache = ResolutionCache::default();
        let executor = SearchTaskExecutor::new(Arc::new(registry), Duration::from_secs(1))
            .with_cache(cache.clone());

        let request = SearchRequest::new("Akira").year(1988);
        let task = SearchTask::new("tmdb", request.clone());
        let item = RetryItem::new(
            task.task_id(),
            SEARCH_TASK,
            task.to_payload().unwrap(),
            4,
            None,
            Utc::now(),
        );

        executor.execute(&item).await.unwrap();
        assert_eq!(cache.get(&request).await.unwrap().id, "42");
    }

    #[tokio::test]
    async fn test_search_executor_rejects_unknown_source() {
        let executor = SearchTaskExecutor::new(
            Arc::new(SourceRegistry::default()),
            Duration::from_secs(1),
        );
        let task = SearchTask::new("nowhere", SearchRequest::new("Akira"));
        let item = RetryItem::new(task.task_id(), SEARCH_TASK, task.to_payload().unwrap(), 4, None, Utc::now());

        let err = executor.execute(&item).await.unwrap_err();
        assert!(matches!(err, TaskError::UnknownSource(_)));
    }
}
