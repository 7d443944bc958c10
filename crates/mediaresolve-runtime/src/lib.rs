//! # mediaresolve-runtime
//!
//! Resilient metadata resolution across unreliable sources.
//!
//! This crate wires the deterministic pieces of `mediaresolve-core` to the
//! network-facing world:
//! - [`FallbackOrchestrator`] sweeps sources in priority order, each behind
//!   its own [`CircuitBreaker`]
//! - [`RetryQueue`] and [`RetryScheduler`] re-run transient failures with
//!   exponential backoff
//! - [`PatternLearner`] turns user corrections into filename mappings that
//!   short-circuit future lookups
//! - [`HealthMonitor`] classifies sources and derives the degradation level
//!
//! [`ResolutionEngine`] owns all of it.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mediaresolve_runtime::{ResolutionEngine, RuntimeConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let engine = ResolutionEngine::builder()
//!     .config(RuntimeConfig::from_yaml_file("mediaresolve.yaml")?)
//!     .source(Arc::new(TmdbClient::new(api_key)))
//!     .source(Arc::new(WikipediaClient::default()))
//!     .build()?;
//!
//! let background = engine.spawn_background(CancellationToken::new());
//! let resolution = engine
//!     .resolve_file("[Grp] Title - 27.mkv", &SearchRequest::new("Title"), &CancellationToken::new())
//!     .await?;
//! ```

use thiserror::Error;

pub mod cache;
pub mod config;
pub mod engine;
pub mod health;
pub mod learning;
pub mod orchestrator;
pub mod resilience;
pub mod retry;
pub mod sources;

pub use cache::ResolutionCache;
pub use config::{CacheConfig, ConfigError, HealthConfig, OrchestratorConfig, RetryConfig, RuntimeConfig};
pub use engine::{BackgroundTasks, EngineStatus, ResolutionEngine, ResolutionEngineBuilder};
pub use health::{HealthChecker, HealthMonitor, SourceProbe};
pub use learning::{
    InMemoryCatalog, InMemoryPatternStore, LearningError, MetadataCatalog, PatternLearner, PatternStore,
};
pub use orchestrator::{FallbackOrchestrator, Resolution, ResolveError};
pub use resilience::{
    BackoffPolicy, BreakerError, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use retry::{
    InMemoryRetryStore, QueueOutcome, RetryError, RetryEvent, RetryItem, RetryQueue, RetryScheduler,
    RetryStatus, RetryStore, SearchTask, SearchTaskExecutor, StoreError, TaskError, TaskExecutor,
};
pub use sources::{
    KeywordGenerator, KeywordVariants, Provider, SearchResult, SourceBinding, SourceError, SourceKind,
    SourceRegistry,
};

/// Errors from the runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Retry error: {0}")]
    Retry(#[from] RetryError),

    #[error("Learning error: {0}")]
    Learning(#[from] LearningError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
