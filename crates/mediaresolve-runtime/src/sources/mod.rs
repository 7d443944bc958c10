//! Metadata source abstractions.
//!
//! Concrete search clients live outside this crate. Each one implements
//! [`Provider`]: one lookup per call, returning normalized items or a
//! [`SourceError`] the engine can classify.

use async_trait::async_trait;
use mediaresolve_core::{MetadataItem, SearchRequest};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

mod registry;

pub use registry::{SourceBinding, SourceRegistry};

/// Errors from metadata sources.
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("No match found")]
    NotFound,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Authentication failed")]
    Auth,

    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// Transient failures worth retrying later: timeouts, rate limits,
    /// gateway-class HTTP statuses and connection-level failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Timeout(_) | SourceError::RateLimited { .. } | SourceError::Connection(_) => {
                true
            }
            SourceError::Http { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            SourceError::NotFound
            | SourceError::InvalidInput(_)
            | SourceError::Auth
            | SourceError::Unavailable(_)
            | SourceError::Other(_) => false,
        }
    }

    /// Whether the error says something about the source's health rather
    /// than about this particular request.
    pub fn counts_against_source(&self) -> bool {
        !matches!(self, SourceError::NotFound | SourceError::InvalidInput(_))
    }

    /// Build an error from an HTTP status, mapping well-known codes.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => SourceError::Auth,
            404 => SourceError::NotFound,
            400 | 422 => SourceError::InvalidInput(message.into()),
            429 => SourceError::RateLimited { retry_after: None },
            _ => SourceError::Http {
                status,
                message: message.into(),
            },
        }
    }
}

/// The closed set of source families the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Structured catalog API (TMDB-like)
    Catalog,
    /// Region-specific site scraper
    RegionalScraper,
    /// Encyclopedia lookup used as a late fallback
    Encyclopedic,
    /// Model-assisted identification
    AiAssisted,
    /// User-curated entries
    Manual,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Catalog => write!(f, "catalog"),
            SourceKind::RegionalScraper => write!(f, "regional_scraper"),
            SourceKind::Encyclopedic => write!(f, "encyclopedic"),
            SourceKind::AiAssisted => write!(f, "ai_assisted"),
            SourceKind::Manual => write!(f, "manual"),
        }
    }
}

/// Items returned by one lookup, best match first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    pub items: Vec<MetadataItem>,

    /// Total hits reported by the source, if it paginates
    #[serde(default)]
    pub total: Option<u64>,
}

impl SearchResult {
    pub fn new(items: Vec<MetadataItem>) -> Self {
        Self { items, total: None }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Best item, preferring an exact year match when the request has one.
    pub fn best(self, request: &SearchRequest) -> Option<MetadataItem> {
        if let Some(year) = request.year {
            if let Some(pos) = self.items.iter().position(|item| item.year == Some(year)) {
                return self.items.into_iter().nth(pos);
            }
        }
        self.items.into_iter().next()
    }
}

/// A pluggable metadata source.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Run one lookup.
    async fn search(&self, request: &SearchRequest) -> Result<SearchResult, SourceError>;

    /// Stable source name used for breakers, health and audit records.
    fn name(&self) -> &str;

    /// Whether the source is configured and enabled.
    fn is_available(&self) -> bool {
        true
    }

    /// Source family.
    fn kind(&self) -> SourceKind {
        SourceKind::Catalog
    }
}

/// Alternative queries for a title.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeywordVariants {
    /// Translations into other languages
    #[serde(default)]
    pub translations: Vec<String>,

    /// Script conversions (simplified/traditional, kana/kanji)
    #[serde(default)]
    pub script_variants: Vec<String>,

    /// Romanized forms
    #[serde(default)]
    pub romanized: Vec<String>,
}

impl KeywordVariants {
    /// All variants in sweep order, deduplicated and excluding the original.
    pub fn queries(&self, original: &str) -> Vec<String> {
        let original = original.trim().to_lowercase();
        let mut seen = std::collections::HashSet::new();
        self.translations
            .iter()
            .chain(&self.script_variants)
            .chain(&self.romanized)
            .map(|q| q.trim())
            .filter(|q| !q.is_empty())
            .filter(|q| q.to_lowercase() != original)
            .filter(|q| seen.insert(q.to_lowercase()))
            .map(str::to_string)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.translations.is_empty() && self.script_variants.is_empty() && self.romanized.is_empty()
    }
}

/// Produces alternative query strings once every source has failed.
#[async_trait]
pub trait KeywordGenerator: Send + Sync {
    async fn generate_keywords(&self, title: &str) -> Result<KeywordVariants, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(SourceError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(SourceError::RateLimited { retry_after: None }.is_retryable());
        assert!(SourceError::Connection("reset".into()).is_retryable());
        for status in [429, 502, 503, 504] {
            assert!(SourceError::Http { status, message: String::new() }.is_retryable());
        }

        assert!(!SourceError::Http { status: 500, message: String::new() }.is_retryable());
        assert!(!SourceError::NotFound.is_retryable());
        assert!(!SourceError::InvalidInput("bad".into()).is_retryable());
        assert!(!SourceError::Auth.is_retryable());
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(SourceError::from_status(401, "x"), SourceError::Auth));
        assert!(matches!(SourceError::from_status(404, "x"), SourceError::NotFound));
        assert!(SourceError::from_status(429, "x").is_retryable());
        assert!(SourceError::from_status(503, "x").is_retryable());
    }

    #[test]
    fn test_per_request_errors_do_not_count_against_source() {
        assert!(!SourceError::NotFound.counts_against_source());
        assert!(!SourceError::InvalidInput("x".into()).counts_against_source());
        assert!(SourceError::Auth.counts_against_source());
        assert!(SourceError::Timeout(Duration::from_secs(1)).counts_against_source());
    }

    #[test]
    fn test_best_prefers_year() {
        let mut a = MetadataItem::new("1", "Dune", "catalog");
        a.year = Some(1984);
        let mut b = MetadataItem::new("2", "Dune", "catalog");
        b.year = Some(2021);

        let result = SearchResult::new(vec![a.clone(), b.clone()]);
        let best = result.best(&SearchRequest::new("Dune").year(2021)).unwrap();
        assert_eq!(best.id, "2");

        let result = SearchResult::new(vec![a, b]);
        assert_eq!(result.best(&SearchRequest::new("Dune")).unwrap().id, "1");
    }

    #[test]
    fn test_keyword_queries_dedupe() {
        let variants = KeywordVariants {
            translations: vec!["Frieren".into(), "葬送のフリーレン".into()],
            script_variants: vec!["葬送的芙莉莲".into()],
            romanized: vec!["Sousou no Frieren".into(), "frieren".into(), " ".into()],
        };
        let queries = variants.queries("葬送のフリーレン");
        assert_eq!(queries, vec!["Frieren", "葬送的芙莉莲", "Sousou no Frieren"]);
    }
}
