//! Composition root wiring sources, breakers, learning, retries and health.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mediaresolve_core::{
    DegradationLevel, FallbackStatus, FilenameMapping, PatternMatch, SearchRequest, ServiceHealth,
    LEARNED_SOURCE,
};

use crate::cache::ResolutionCache;
use crate::config::RuntimeConfig;
use crate::health::{HealthChecker, HealthMonitor};
use crate::learning::{InMemoryCatalog, InMemoryPatternStore, MetadataCatalog, PatternLearner, PatternStore};
use crate::orchestrator::{FallbackOrchestrator, Resolution, ResolveError};
use crate::resilience::BreakerSnapshot;
use crate::retry::{
    InMemoryRetryStore, QueueOutcome, RetryEvent, RetryItem, RetryQueue, RetryScheduler, RetryStore,
    SearchTaskExecutor, TaskExecutor,
};
use crate::sources::{KeywordGenerator, Provider, SourceError, SourceRegistry};
use crate::RuntimeError;

/// Point-in-time engine status for callers and UIs.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub level: DegradationLevel,
    pub message: &'static str,
    pub services: BTreeMap<String, ServiceHealth>,
    pub breakers: Vec<BreakerSnapshot>,
    pub pending_retries: usize,
}

/// Handles for the background loops started by [`ResolutionEngine::spawn_background`].
pub struct BackgroundTasks {
    cancel: CancellationToken,
    scheduler: JoinHandle<()>,
    health: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Stop both loops and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, handle) in [("retry scheduler", self.scheduler), ("health monitor", self.health)] {
            if let Err(e) = handle.await {
                tracing::error!(task = name, error = %e, "Background task panicked");
            }
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Builder for [`ResolutionEngine`].
#[derive(Default)]
pub struct ResolutionEngineBuilder {
    config: RuntimeConfig,
    providers: Vec<Arc<dyn Provider>>,
    keywords: Option<Arc<dyn KeywordGenerator>>,
    retry_store: Option<Arc<dyn RetryStore>>,
    pattern_store: Option<Arc<dyn PatternStore>>,
    catalog: Option<Arc<dyn MetadataCatalog>>,
    executor: Option<Arc<dyn TaskExecutor>>,
    health_checkers: Vec<Arc<dyn HealthChecker>>,
}

impl ResolutionEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a source at the lowest priority so far.
    pub fn source(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn keyword_generator(mut self, keywords: Arc<dyn KeywordGenerator>) -> Self {
        self.keywords = Some(keywords);
        self
    }

    pub fn retry_store(mut self, store: Arc<dyn RetryStore>) -> Self {
        self.retry_store = Some(store);
        self
    }

    pub fn pattern_store(mut self, store: Arc<dyn PatternStore>) -> Self {
        self.pattern_store = Some(store);
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn MetadataCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Replace the built-in search executor for scheduled retries.
    pub fn task_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replace the default probe for the checker's service name.
    pub fn health_checker(mut self, checker: Arc<dyn HealthChecker>) -> Self {
        self.health_checkers.push(checker);
        self
    }

    pub fn build(self) -> Result<ResolutionEngine, RuntimeError> {
        self.config.validate()?;
        let config = self.config;

        let mut registry = SourceRegistry::new(config.breaker.clone());
        for provider in self.providers {
            registry.register(provider);
        }
        let sources = Arc::new(registry);

        let cache = config
            .cache
            .enabled
            .then(|| ResolutionCache::from_config(&config.cache));

        let mut monitor = HealthMonitor::for_registry(&sources, config.health.clone());
        for checker in self.health_checkers {
            monitor.register(checker);
        }
        let health = Arc::new(monitor);

        let retry_store: Arc<dyn RetryStore> = match self.retry_store {
            Some(store) => store,
            None => Arc::new(InMemoryRetryStore::new()),
        };
        let retry_queue = Arc::new(RetryQueue::new(retry_store, &config.retry));

        let executor: Arc<dyn TaskExecutor> = match self.executor {
            Some(executor) => executor,
            None => {
                let executor = SearchTaskExecutor::new(sources.clone(), config.orchestrator.source_timeout);
                match &cache {
                    Some(cache) => Arc::new(executor.with_cache(cache.clone())),
                    None => Arc::new(executor),
                }
            }
        };
        let scheduler = Arc::new(RetryScheduler::new(
            retry_queue.clone(),
            executor,
            config.retry.clone(),
        ));

        let mut orchestrator = FallbackOrchestrator::new(sources.clone(), config.orchestrator.clone())
            .with_health(health.clone())
            .with_retry_queue(retry_queue.clone());
        if let Some(keywords) = self.keywords {
            orchestrator = orchestrator.with_keyword_generator(keywords);
        }
        if let Some(cache) = &cache {
            orchestrator = orchestrator.with_cache(cache.clone());
        }

        let pattern_store: Arc<dyn PatternStore> = match self.pattern_store {
            Some(store) => store,
            None => Arc::new(InMemoryPatternStore::new()),
        };
        let catalog: Arc<dyn MetadataCatalog> = match self.catalog {
            Some(catalog) => catalog,
            None => Arc::new(InMemoryCatalog::new()),
        };

        tracing::info!(sources = ?sources.names(), "Resolution engine ready");

        Ok(ResolutionEngine {
            sources,
            orchestrator,
            learner: PatternLearner::new(pattern_store),
            catalog,
            retry_queue,
            scheduler,
            health,
            cache,
        })
    }
}

/// Resolves media metadata across unreliable sources.
///
/// All per-source state (breakers, health) lives in this instance; nothing
/// is global, so independent engines never interfere.
pub struct ResolutionEngine {
    sources: Arc<SourceRegistry>,
    orchestrator: FallbackOrchestrator,
    learner: PatternLearner,
    catalog: Arc<dyn MetadataCatalog>,
    retry_queue: Arc<RetryQueue>,
    scheduler: Arc<RetryScheduler>,
    health: Arc<HealthMonitor>,
    cache: Option<ResolutionCache>,
}

impl ResolutionEngine {
    pub fn builder() -> ResolutionEngineBuilder {
        ResolutionEngineBuilder::new()
    }

    /// Resolve a request through the cache and the source sweep.
    pub async fn resolve(
        &self,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<Resolution, ResolveError> {
        self.orchestrator.resolve(request, cancel).await
    }

    /// Resolve a file, consulting learned patterns before any source.
    ///
    /// A learned match produces the catalog item re-tagged `learned` with the
    /// match confidence. A mapping whose metadata id is no longer in the
    /// catalog is ignored and the sweep runs as usual.
    pub async fn resolve_file(
        &self,
        filename: &str,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<Resolution, RuntimeError> {
        if let Some(hit) = self.learner.find_matching_pattern(filename).await? {
            match self.catalog.get(&hit.mapping.metadata_id).await? {
                Some(item) => {
                    self.learner.record_use(&hit.mapping.id).await?;
                    tracing::info!(
                        filename,
                        metadata_id = %hit.mapping.metadata_id,
                        strategy = %hit.strategy,
                        confidence = hit.confidence,
                        "Resolved from learned pattern"
                    );
                    let mut status = FallbackStatus::new();
                    status.learned_pattern = Some(hit.mapping.id.clone());
                    return Ok(Resolution::resolved(
                        item.retagged(LEARNED_SOURCE, hit.confidence),
                        status,
                    ));
                }
                None => tracing::warn!(
                    filename,
                    metadata_id = %hit.mapping.metadata_id,
                    "Learned pattern points at unknown metadata, ignoring"
                ),
            }
        }

        Ok(self.orchestrator.resolve(request, cancel).await?)
    }

    // Retry queue

    pub async fn queue_retry(
        &self,
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        error: &SourceError,
    ) -> Result<QueueOutcome, RuntimeError> {
        Ok(self.retry_queue.queue_retry(task_id, task_type, payload, error).await?)
    }

    pub async fn trigger_immediate(&self, task_id: &str) -> Result<RetryItem, RuntimeError> {
        Ok(self.retry_queue.trigger_immediate(task_id).await?)
    }

    pub async fn cancel_retry(&self, task_id: &str) -> Result<RetryItem, RuntimeError> {
        Ok(self.retry_queue.cancel_retry(task_id).await?)
    }

    pub async fn get_pending(&self) -> Result<Vec<RetryItem>, RuntimeError> {
        Ok(self.retry_queue.get_pending().await?)
    }

    pub fn subscribe_retries(&self) -> tokio::sync::broadcast::Receiver<RetryEvent> {
        self.retry_queue.subscribe()
    }

    pub fn retry_scheduler(&self) -> &Arc<RetryScheduler> {
        &self.scheduler
    }

    // Learning

    pub async fn learn_from_correction(
        &self,
        filename: &str,
        metadata_id: &str,
    ) -> Result<FilenameMapping, RuntimeError> {
        Ok(self.learner.learn_from_correction(filename, metadata_id).await?)
    }

    pub async fn learn_title(&self, title: &str, metadata_id: &str) -> Result<FilenameMapping, RuntimeError> {
        Ok(self.learner.learn_title(title, metadata_id).await?)
    }

    pub async fn find_matching_pattern(&self, filename: &str) -> Result<Option<PatternMatch>, RuntimeError> {
        Ok(self.learner.find_matching_pattern(filename).await?)
    }

    pub async fn forget_pattern(&self, id: &str) -> Result<FilenameMapping, RuntimeError> {
        Ok(self.learner.forget(id).await?)
    }

    pub async fn list_patterns(&self) -> Result<Vec<FilenameMapping>, RuntimeError> {
        Ok(self.learner.list().await?)
    }

    // Health

    pub fn degradation_level(&self) -> DegradationLevel {
        self.health.degradation_level()
    }

    pub fn service_health(&self) -> BTreeMap<String, ServiceHealth> {
        self.health.service_health()
    }

    /// Run one health check cycle now.
    pub async fn check_health(&self) -> DegradationLevel {
        self.health.check_all().await;
        self.health.degradation_level()
    }

    pub async fn status(&self) -> Result<EngineStatus, RuntimeError> {
        let level = self.health.degradation_level();
        Ok(EngineStatus {
            level,
            message: level.user_message(),
            services: self.health.service_health(),
            breakers: self.sources.breaker_snapshots(),
            pending_retries: self.retry_queue.get_pending().await?.len(),
        })
    }

    pub fn sources(&self) -> &Arc<SourceRegistry> {
        &self.sources
    }

    pub fn cache(&self) -> Option<&ResolutionCache> {
        self.cache.as_ref()
    }

    /// Start the retry scheduler and health monitor loops. Both stop when
    /// `cancel` (or [`BackgroundTasks::shutdown`]) fires.
    pub fn spawn_background(&self, cancel: CancellationToken) -> BackgroundTasks {
        let scheduler = tokio::spawn(self.scheduler.clone().run(cancel.child_token()));
        let health = tokio::spawn(self.health.clone().run(cancel.child_token()));
        BackgroundTasks {
            cancel,
            scheduler,
            health,
        }
    }
}

impl std::fmt::Debug for ResolutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionEngine")
            .field("sources", &self.sources.names())
            .field("level", &self.health.degradation_level())
            .finish()
    }
}
