//! Caching layer for resolved metadata.
//!
//! Holds the item a network sweep (or a background retry) produced for a
//! request, so identical requests skip the sweep.

use moka::future::Cache;
use std::time::Duration;

use mediaresolve_core::{MetadataItem, SearchRequest};

use crate::config::CacheConfig;

/// Resolution cache using moka.
#[derive(Clone)]
pub struct ResolutionCache {
    cache: Cache<String, MetadataItem>,
}

impl ResolutionCache {
    /// Create a new cache with the given bounds.
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.ttl)
    }

    /// Get the item cached for a request.
    pub async fn get(&self, request: &SearchRequest) -> Option<MetadataItem> {
        self.cache.get(&request.cache_key()).await
    }

    /// Store the item resolved for a request.
    pub async fn insert(&self, request: &SearchRequest, item: MetadataItem) {
        self.cache.insert(request.cache_key(), item).await;
    }

    pub async fn invalidate(&self, request: &SearchRequest) {
        self.cache.invalidate(&request.cache_key()).await;
    }

    /// Clear the cache.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Approximate entry count; pending maintenance may lag.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for ResolutionCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl std::fmt::Debug for ResolutionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionCache")
            .field("entries", &self.entry_count())
            .finish()
    }
}
