//! Fallback orchestrator for sequential source lookups.
//!
//! Sources are tried strictly in priority order, each behind its own circuit
//! breaker, until one returns a non-empty result. It implements:
//! - Skips for disabled, down and circuit-open sources without invoking them
//! - A per-call timeout bounded by the overall request deadline
//! - A short pause between invocations with a cumulative cap
//! - A second pass over keyword variants once the original query is exhausted
//! - Handing transient failures to the retry queue when nothing resolved

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use mediaresolve_core::{
    FallbackStatus, MetadataItem, NextAction, SearchRequest, SkipReason, SourceAttempt,
};

use crate::cache::ResolutionCache;
use crate::config::OrchestratorConfig;
use crate::health::HealthMonitor;
use crate::resilience::BreakerError;
use crate::retry::{RetryQueue, SearchTask, SEARCH_TASK};
use crate::sources::{KeywordGenerator, SourceBinding, SourceError, SourceRegistry};

/// Errors from a resolution request.
///
/// Source failures never surface here; they are recorded in the status.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Resolution cancelled after {} source attempts", .status.len())]
    Cancelled { status: FallbackStatus },
}

impl ResolveError {
    /// The status accumulated before the request stopped.
    pub fn status(&self) -> &FallbackStatus {
        match self {
            ResolveError::Cancelled { status } => status,
        }
    }
}

/// Outcome of one resolution request.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The resolved item, if any source (or pattern, or cache) produced one
    pub item: Option<MetadataItem>,

    /// Ordered audit of every source attempt and skip
    pub status: FallbackStatus,

    /// Task ids handed to the retry queue
    pub pending_retries: Vec<String>,

    /// What the user can do next; empty when resolved
    pub next_actions: Vec<NextAction>,
}

impl Resolution {
    pub fn resolved(item: MetadataItem, status: FallbackStatus) -> Self {
        Self {
            item: Some(item),
            status,
            pending_retries: Vec::new(),
            next_actions: Vec::new(),
        }
    }

    pub fn unresolved(status: FallbackStatus, pending_retries: Vec<String>) -> Self {
        let next_actions = NextAction::for_empty_result(!pending_retries.is_empty());
        Self {
            item: None,
            status,
            pending_retries,
            next_actions,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.item.is_some()
    }
}

/// Caller cancelled mid-sweep.
struct Cancelled;

/// Mutable bookkeeping for one request.
struct SweepState {
    status: FallbackStatus,
    deadline: Instant,
    invoked: u32,
    delay_spent: Duration,
    transient: Vec<(String, SourceError)>,
}

impl SweepState {
    fn new(deadline: Instant) -> Self {
        Self {
            status: FallbackStatus::new(),
            deadline,
            invoked: 0,
            delay_spent: Duration::ZERO,
            transient: Vec::new(),
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Sequential fallback across registered sources.
pub struct FallbackOrchestrator {
    sources: Arc<SourceRegistry>,
    config: OrchestratorConfig,
    health: Option<Arc<HealthMonitor>>,
    keywords: Option<Arc<dyn KeywordGenerator>>,
    retry_queue: Option<Arc<RetryQueue>>,
    cache: Option<ResolutionCache>,
}

impl FallbackOrchestrator {
    pub fn new(sources: Arc<SourceRegistry>, config: OrchestratorConfig) -> Self {
        Self {
            sources,
            config,
            health: None,
            keywords: None,
            retry_queue: None,
            cache: None,
        }
    }

    /// Skip sources the monitor classifies as down.
    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_keyword_generator(mut self, keywords: Arc<dyn KeywordGenerator>) -> Self {
        self.keywords = Some(keywords);
        self
    }

    pub fn with_retry_queue(mut self, queue: Arc<RetryQueue>) -> Self {
        self.retry_queue = Some(queue);
        self
    }

    pub fn with_cache(mut self, cache: ResolutionCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn sources(&self) -> &Arc<SourceRegistry> {
        &self.sources
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Resolve a request.
    ///
    /// # Execution Flow
    /// 1. Serve from the resolution cache when possible
    /// 2. Sweep every source with the original query
    /// 3. On total failure, sweep again once per keyword variant
    /// 4. On total failure, queue transient failures and return next actions
    pub async fn resolve(
        &self,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<Resolution, ResolveError> {
        if let Some(item) = self.cached(request).await {
            let mut status = FallbackStatus::new();
            status.cached = true;
            status.record(SourceAttempt {
                source: mediaresolve_core::CACHED_SOURCE.to_string(),
                query: request.query.clone(),
                variant: None,
                success: true,
                error: None,
                retryable: false,
                skip_reason: None,
                elapsed_ms: 0,
                attempted_at: chrono::Utc::now(),
            });
            tracing::debug!(query = %request.query, source = %item.source, "Resolved from cache");
            return Ok(Resolution::resolved(item, status));
        }

        let mut state = SweepState::new(Instant::now() + self.config.request_deadline);

        let found = match self.run(request, &mut state, cancel).await {
            Ok(found) => found,
            Err(Cancelled) => {
                tracing::info!(query = %request.query, attempts = state.status.len(), "Resolution cancelled");
                return Err(ResolveError::Cancelled {
                    status: state.status,
                });
            }
        };

        if let Some(item) = found {
            if let Some(cache) = &self.cache {
                cache.insert(request, item.clone()).await;
            }
            tracing::info!(
                query = %request.query,
                source = %item.source,
                attempts = state.status.len(),
                "Resolved metadata"
            );
            return Ok(Resolution::resolved(item, state.status));
        }

        let pending = self.queue_transient_failures(request, std::mem::take(&mut state.transient));
        tracing::info!(
            query = %request.query,
            attempts = state.status.len(),
            all_skipped = state.status.all_skipped(),
            pending_retries = pending.len(),
            "No source resolved request"
        );
        Ok(Resolution::unresolved(state.status, pending))
    }

    async fn cached(&self, request: &SearchRequest) -> Option<MetadataItem> {
        match &self.cache {
            Some(cache) => cache.get(request).await,
            None => None,
        }
    }

    async fn run(
        &self,
        request: &SearchRequest,
        state: &mut SweepState,
        cancel: &CancellationToken,
    ) -> Result<Option<MetadataItem>, Cancelled> {
        if let Some(item) = self.sweep(request, None, state, cancel).await? {
            return Ok(Some(item));
        }

        for variant in self.keyword_variants(request, state, cancel).await? {
            state.status.variants.push(variant.clone());
            let variant_request = request.with_query(variant.clone());
            if let Some(item) = self.sweep(&variant_request, Some(&variant), state, cancel).await? {
                return Ok(Some(item));
            }
        }

        Ok(None)
    }

    async fn keyword_variants(
        &self,
        request: &SearchRequest,
        state: &SweepState,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, Cancelled> {
        let Some(generator) = &self.keywords else {
            return Ok(Vec::new());
        };
        let budget = self.config.keyword_timeout.min(state.remaining());
        if budget.is_zero() {
            tracing::debug!(query = %request.query, "No time left for keyword variants");
            return Ok(Vec::new());
        }

        let generated = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled),
            r = tokio::time::timeout(budget, generator.generate_keywords(&request.query)) => r,
        };

        match generated {
            Ok(Ok(variants)) => {
                let queries = variants.queries(&request.query);
                tracing::debug!(query = %request.query, variants = queries.len(), "Generated keyword variants");
                Ok(queries)
            }
            Ok(Err(e)) => {
                tracing::warn!(query = %request.query, error = %e, "Keyword generation failed");
                Ok(Vec::new())
            }
            Err(_) => {
                tracing::warn!(query = %request.query, timeout = ?budget, "Keyword generation timed out");
                Ok(Vec::new())
            }
        }
    }

    /// One pass over every source with a fixed query.
    async fn sweep(
        &self,
        request: &SearchRequest,
        variant: Option<&str>,
        state: &mut SweepState,
        cancel: &CancellationToken,
    ) -> Result<Option<MetadataItem>, Cancelled> {
        for binding in self.sources.iter() {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            if let Some(reason) = self.skip_reason(binding) {
                self.skip(binding, request, variant, reason, state);
                continue;
            }

            if state.invoked > 0 {
                self.pause(state, cancel).await?;
            }
            let remaining = state.remaining();
            if remaining.is_zero() {
                self.skip(binding, request, variant, SkipReason::DeadlineExceeded, state);
                continue;
            }

            if let Some(item) = self
                .invoke(binding, request, variant, remaining, state, cancel)
                .await?
            {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    fn skip_reason(&self, binding: &SourceBinding) -> Option<SkipReason> {
        if !binding.provider.is_available() {
            Some(SkipReason::Disabled)
        } else if self.health.as_ref().is_some_and(|h| h.is_down(binding.name())) {
            Some(SkipReason::ServiceDown)
        } else if binding.breaker.is_open() {
            Some(SkipReason::CircuitOpen)
        } else {
            None
        }
    }

    fn skip(
        &self,
        binding: &SourceBinding,
        request: &SearchRequest,
        variant: Option<&str>,
        reason: SkipReason,
        state: &mut SweepState,
    ) {
        tracing::debug!(source = %binding.name(), query = %request.query, reason = %reason, "Skipping source");
        state.status.record(SourceAttempt::skipped(
            binding.name(),
            request.query.clone(),
            variant.map(str::to_string),
            reason,
        ));
    }

    /// Pause between invocations while the cumulative cap allows.
    async fn pause(&self, state: &mut SweepState, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let allowance = self.config.max_total_delay.saturating_sub(state.delay_spent);
        let pause = self.config.inter_source_delay.min(allowance).min(state.remaining());
        if pause.is_zero() {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled),
            _ = tokio::time::sleep(pause) => {}
        }
        state.delay_spent += pause;
        Ok(())
    }

    async fn invoke(
        &self,
        binding: &SourceBinding,
        request: &SearchRequest,
        variant: Option<&str>,
        remaining: Duration,
        state: &mut SweepState,
        cancel: &CancellationToken,
    ) -> Result<Option<MetadataItem>, Cancelled> {
        let name = binding.name();
        let call_timeout = self.config.source_timeout.min(remaining);
        let provider = binding.provider.clone();
        let started = Instant::now();
        let attempted_at = chrono::Utc::now();
        state.invoked += 1;

        let call = binding.breaker.execute_with(
            move || async move {
                match tokio::time::timeout(call_timeout, provider.search(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(SourceError::Timeout(call_timeout)),
                }
            },
            SourceError::counts_against_source,
        );
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled),
            outcome = call => outcome,
        };

        let mut attempt = SourceAttempt {
            source: name.to_string(),
            query: request.query.clone(),
            variant: variant.map(str::to_string),
            success: false,
            error: None,
            retryable: false,
            skip_reason: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
            attempted_at,
        };

        let found = match outcome {
            Ok(result) => match result.best(request) {
                Some(mut item) => {
                    attempt.success = true;
                    if item.source != name {
                        item.source = name.to_string();
                    }
                    Some(item)
                }
                None => {
                    tracing::debug!(source = %name, query = %request.query, "Source returned no results");
                    attempt.error = Some(SourceError::NotFound.to_string());
                    None
                }
            },
            Err(BreakerError::Inner(e)) => {
                tracing::warn!(source = %name, query = %request.query, error = %e, "Source lookup failed");
                attempt.error = Some(e.to_string());
                attempt.retryable = e.is_retryable();
                if attempt.retryable && variant.is_none() {
                    state.transient.push((name.to_string(), e));
                }
                None
            }
            Err(BreakerError::Open { .. }) => {
                attempt.skip_reason = Some(SkipReason::CircuitOpen);
                None
            }
            Err(BreakerError::ProbeLimit { .. }) => {
                attempt.skip_reason = Some(SkipReason::ProbeLimit);
                None
            }
        };

        state.status.record(attempt);
        Ok(found)
    }

    /// Queue one background search per source that failed transiently on
    /// the original query. Queuing runs detached from the request.
    fn queue_transient_failures(
        &self,
        request: &SearchRequest,
        failures: Vec<(String, SourceError)>,
    ) -> Vec<String> {
        let Some(queue) = &self.retry_queue else {
            return Vec::new();
        };
        if !self.config.queue_transient_failures || failures.is_empty() {
            return Vec::new();
        }

        let mut tasks: Vec<(SearchTask, SourceError)> = Vec::new();
        for (source, error) in failures {
            if tasks.iter().any(|(t, _)| t.source == source) {
                continue;
            }
            tasks.push((SearchTask::new(source, request.clone()), error));
        }
        let task_ids: Vec<String> = tasks.iter().map(|(t, _)| t.task_id()).collect();

        let queue = queue.clone();
        tokio::spawn(async move {
            for (task, error) in tasks {
                let payload = match task.to_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(source = %task.source, error = %e, "Failed to encode retry payload");
                        continue;
                    }
                };
                if let Err(e) = queue.queue_retry(task.task_id(), SEARCH_TASK, payload, &error).await {
                    tracing::error!(source = %task.source, error = %e, "Failed to queue retry");
                }
            }
        });

        task_ids
    }
}

impl std::fmt::Debug for FallbackOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackOrchestrator")
            .field("sources", &self.sources.names())
            .field("keywords", &self.keywords.is_some())
            .field("retry_queue", &self.retry_queue.is_some())
            .finish()
    }
}
