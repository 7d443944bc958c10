//! Ordered registry of sources and their breakers.
//!
//! Sources are swept in registration order. Each registration creates the
//! source's own [`CircuitBreaker`], so breaker state is keyed by source name
//! and owned by whoever owns the registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::Provider;
use crate::resilience::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};

/// A provider paired with the breaker that guards it.
#[derive(Clone)]
pub struct SourceBinding {
    pub provider: Arc<dyn Provider>,
    pub breaker: Arc<CircuitBreaker>,
}

impl SourceBinding {
    pub fn name(&self) -> &str {
        self.provider.name()
    }
}

impl std::fmt::Debug for SourceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceBinding")
            .field("name", &self.provider.name())
            .field("kind", &self.provider.kind())
            .field("breaker", &self.breaker.state())
            .finish()
    }
}

/// Sources in priority order.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    bindings: Vec<SourceBinding>,
    index: BTreeMap<String, usize>,
    breaker_config: CircuitBreakerConfig,
}

impl SourceRegistry {
    /// Create an empty registry whose breakers use `breaker_config`.
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            bindings: Vec::new(),
            index: BTreeMap::new(),
            breaker_config,
        }
    }

    /// Register a provider at the lowest priority so far.
    ///
    /// Registering a name twice replaces the provider in place, keeping its
    /// position and breaker.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        if let Some(&pos) = self.index.get(&name) {
            tracing::debug!(source = %name, "Replacing registered source");
            self.bindings[pos].provider = provider;
            return;
        }

        let breaker = Arc::new(CircuitBreaker::new(name.clone(), self.breaker_config.clone()));
        self.index.insert(name, self.bindings.len());
        self.bindings.push(SourceBinding { provider, breaker });
    }

    /// Look up a binding by source name.
    pub fn get(&self, name: &str) -> Option<&SourceBinding> {
        self.index.get(name).map(|&pos| &self.bindings[pos])
    }

    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.get(name).map(|b| b.breaker.clone())
    }

    /// Bindings in sweep order.
    pub fn iter(&self) -> impl Iterator<Item = &SourceBinding> {
        self.bindings.iter()
    }

    /// Source names in sweep order.
    pub fn names(&self) -> Vec<&str> {
        self.bindings.iter().map(SourceBinding::name).collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Breaker snapshots in sweep order.
    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.bindings.iter().map(|b| b.breaker.snapshot()).collect()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{SearchResult, SourceError, SourceKind};
    use async_trait::async_trait;
    use mediaresolve_core::SearchRequest;

    struct Named(&'static str, SourceKind);

    #[async_trait]
    impl Provider for Named {
        async fn search(&self, _request: &SearchRequest) -> Result<SearchResult, SourceError> {
            Ok(SearchResult::empty())
        }

        fn name(&self) -> &str {
            self.0
        }

        fn kind(&self) -> SourceKind {
            self.1
        }
    }

    #[test]
    fn test_registration_order_is_priority() {
        let mut registry = SourceRegistry::default();
        registry.register(Arc::new(Named("tmdb", SourceKind::Catalog)));
        registry.register(Arc::new(Named("douban", SourceKind::RegionalScraper)));
        registry.register(Arc::new(Named("wikipedia", SourceKind::Encyclopedic)));

        assert_eq!(registry.names(), vec!["tmdb", "douban", "wikipedia"]);
        assert_eq!(registry.len(), 3);
        assert!(registry.has_source("douban"));
        assert!(registry.get("imdb").is_none());
    }

    #[test]
    fn test_each_source_has_own_breaker() {
        let mut registry = SourceRegistry::default();
        registry.register(Arc::new(Named("a", SourceKind::Catalog)));
        registry.register(Arc::new(Named("b", SourceKind::Catalog)));

        let a = registry.breaker("a").unwrap();
        let b = registry.breaker("b").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "a");
    }

    #[test]
    fn test_reregister_keeps_position_and_breaker() {
        let mut registry = SourceRegistry::default();
        registry.register(Arc::new(Named("a", SourceKind::Catalog)));
        registry.register(Arc::new(Named("b", SourceKind::Catalog)));
        let breaker = registry.breaker("a").unwrap();

        registry.register(Arc::new(Named("a", SourceKind::Manual)));

        assert_eq!(registry.names(), vec!["a", "b"]);
        assert_eq!(registry.get("a").unwrap().provider.kind(), SourceKind::Manual);
        assert!(Arc::ptr_eq(&breaker, &registry.breaker("a").unwrap()));
    }
}
