//! Request, result and audit types shared by every resolution path.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source tag attached to items produced from a learned filename pattern.
pub const LEARNED_SOURCE: &str = "learned";

/// Source tag attached to items served from the resolution cache.
pub const CACHED_SOURCE: &str = "cache";

/// Kind of media being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    Movie,
    Series,
    Anime,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Movie => write!(f, "movie"),
            MediaType::Series => write!(f, "series"),
            MediaType::Anime => write!(f, "anime"),
        }
    }
}

/// A single metadata lookup request.
///
/// Immutable for the lifetime of one resolution attempt; keyword variants are
/// produced with [`SearchRequest::with_query`] rather than by mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Best-effort title guess
    pub query: String,

    /// Release year, when the filename carried one
    #[serde(default)]
    pub year: Option<u16>,

    /// Kind of media
    #[serde(default)]
    pub media_type: MediaType,

    /// Preferred result language (BCP-47, e.g. "en-US")
    #[serde(default)]
    pub language: Option<String>,
}

impl SearchRequest {
    /// Create a request for a query with default media type and no year.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            year: None,
            media_type: MediaType::default(),
            language: None,
        }
    }

    pub fn year(mut self, year: u16) -> Self {
        self.year = Some(year);
        self
    }

    pub fn media_type(mut self, media_type: MediaType) -> Self {
        self.media_type = media_type;
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Copy of this request with the query replaced (keyword variants).
    pub fn with_query(&self, query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..self.clone()
        }
    }

    /// Normalized key identifying equivalent requests.
    ///
    /// Case and whitespace differences in the query collapse to the same key.
    pub fn cache_key(&self) -> String {
        let query = self
            .query
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        format!(
            "{}|{}|{}|{}",
            self.media_type,
            query,
            self.year.map(|y| y.to_string()).unwrap_or_default(),
            self.language.as_deref().unwrap_or("")
        )
    }
}

/// Normalized metadata produced by a source (or by a learned pattern).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataItem {
    /// Identifier in the producing source's namespace
    pub id: String,

    /// Display title
    pub title: String,

    /// Title in the requested language, if different
    #[serde(default)]
    pub localized_title: Option<String>,

    #[serde(default)]
    pub year: Option<u16>,

    #[serde(default)]
    pub overview: Option<String>,

    /// Poster path or URL fragment
    #[serde(default)]
    pub poster: Option<String>,

    /// Match confidence (0.0 - 1.0)
    pub confidence: f64,

    /// Which source produced this item ("learned" for pattern matches)
    pub source: String,

    /// Unmodified source payload
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl MetadataItem {
    /// Create a minimal item.
    pub fn new(id: impl Into<String>, title: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            localized_title: None,
            year: None,
            overview: None,
            poster: None,
            confidence: 1.0,
            source: source.into(),
            raw: serde_json::Value::Null,
        }
    }

    /// Produce a copy re-tagged with a new source and confidence.
    pub fn retagged(&self, source: impl Into<String>, confidence: f64) -> Self {
        Self {
            source: source.into(),
            confidence: confidence.clamp(0.0, 1.0),
            ..self.clone()
        }
    }

    /// Whether the item came from a learned filename pattern.
    pub fn is_learned(&self) -> bool {
        self.source == LEARNED_SOURCE
    }
}

/// Why a source was not invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The source reported itself unavailable
    Disabled,
    /// The health monitor classifies the source as down
    ServiceDown,
    /// The source's circuit breaker is open
    CircuitOpen,
    /// The half-open probe slots were all taken
    ProbeLimit,
    /// The request deadline passed before the source was reached
    DeadlineExceeded,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "disabled"),
            SkipReason::ServiceDown => write!(f, "service down"),
            SkipReason::CircuitOpen => write!(f, "circuit open"),
            SkipReason::ProbeLimit => write!(f, "probe limit reached"),
            SkipReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Outcome of one source invocation (or skip) during a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAttempt {
    /// Source name
    pub source: String,

    /// Query string sent to the source
    pub query: String,

    /// Set when the query was a keyword variant rather than the original
    #[serde(default)]
    pub variant: Option<String>,

    pub success: bool,

    #[serde(default)]
    pub error: Option<String>,

    /// Whether the error is transient and eligible for background retry
    #[serde(default)]
    pub retryable: bool,

    #[serde(default)]
    pub skip_reason: Option<SkipReason>,

    /// Wall time spent on the call, zero for skips
    pub elapsed_ms: u64,

    pub attempted_at: DateTime<Utc>,
}

impl SourceAttempt {
    /// Record a skipped source.
    pub fn skipped(
        source: impl Into<String>,
        query: impl Into<String>,
        variant: Option<String>,
        reason: SkipReason,
    ) -> Self {
        Self {
            source: source.into(),
            query: query.into(),
            variant,
            success: false,
            error: None,
            retryable: false,
            skip_reason: Some(reason),
            elapsed_ms: 0,
            attempted_at: Utc::now(),
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skip_reason.is_some()
    }
}

/// Ordered, append-only audit of a resolution attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackStatus {
    attempts: Vec<SourceAttempt>,

    /// Keyword variants that were swept, in order
    #[serde(default)]
    pub variants: Vec<String>,

    /// Id of the learned mapping that short-circuited the sweep
    #[serde(default)]
    pub learned_pattern: Option<String>,

    /// The item was served from the resolution cache
    #[serde(default)]
    pub cached: bool,
}

impl FallbackStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an attempt. Attempts are never reordered or removed.
    pub fn record(&mut self, attempt: SourceAttempt) {
        self.attempts.push(attempt);
    }

    pub fn attempts(&self) -> &[SourceAttempt] {
        &self.attempts
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// True when at least one attempt exists and every attempt was skipped.
    pub fn all_skipped(&self) -> bool {
        !self.attempts.is_empty() && self.attempts.iter().all(SourceAttempt::is_skipped)
    }

    /// The attempt that produced the result, if any.
    pub fn successful(&self) -> Option<&SourceAttempt> {
        self.attempts.iter().find(|a| a.success)
    }

    /// Failed, non-skipped attempts whose error is transient.
    pub fn retryable_failures(&self) -> impl Iterator<Item = &SourceAttempt> {
        self.attempts
            .iter()
            .filter(|a| !a.success && !a.is_skipped() && a.retryable)
    }
}

/// Follow-up offered to the user whenever automation cannot finish the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    /// Search the sources manually with a user-typed query
    ManualSearch,
    /// Edit the parsed title/year and resolve again
    EditInput,
    /// Retry the pending background lookup now
    RetryNow,
    /// Leave the file unresolved for now
    Skip,
}

impl NextAction {
    /// Actions offered when a sweep ends without a result.
    pub fn for_empty_result(has_pending_retry: bool) -> Vec<NextAction> {
        let mut actions = vec![NextAction::ManualSearch, NextAction::EditInput];
        if has_pending_retry {
            actions.push(NextAction::RetryNow);
        }
        actions.push(NextAction::Skip);
        actions
    }

    /// Actions offered when background retries gave up.
    pub fn for_exhausted_retries() -> Vec<NextAction> {
        vec![NextAction::ManualSearch, NextAction::EditInput, NextAction::Skip]
    }
}

impl fmt::Display for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextAction::ManualSearch => write!(f, "manual search"),
            NextAction::EditInput => write!(f, "edit input"),
            NextAction::RetryNow => write!(f, "retry now"),
            NextAction::Skip => write!(f, "skip"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_normalizes_query() {
        let a = SearchRequest::new("  Spirited   Away ").year(2001);
        let b = SearchRequest::new("spirited away").year(2001);
        assert_eq!(a.cache_key(), b.cache_key());

        let c = SearchRequest::new("spirited away").year(2002);
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn test_with_query_keeps_other_fields() {
        let req = SearchRequest::new("千と千尋の神隠し")
            .year(2001)
            .language("ja-JP")
            .media_type(MediaType::Anime);
        let variant = req.with_query("Sen to Chihiro no Kamikakushi");

        assert_eq!(variant.year, Some(2001));
        assert_eq!(variant.language.as_deref(), Some("ja-JP"));
        assert_eq!(variant.media_type, MediaType::Anime);
        assert_eq!(req.query, "千と千尋の神隠し");
    }

    #[test]
    fn test_status_preserves_order() {
        let mut status = FallbackStatus::new();
        status.record(SourceAttempt::skipped("a", "q", None, SkipReason::Disabled));
        status.record(SourceAttempt::skipped("b", "q", None, SkipReason::CircuitOpen));

        let names: Vec<_> = status.attempts().iter().map(|a| a.source.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(status.all_skipped());
        assert!(status.successful().is_none());
    }

    #[test]
    fn test_empty_status_is_not_all_skipped() {
        assert!(!FallbackStatus::new().all_skipped());
    }

    #[test]
    fn test_next_actions_always_offer_a_path() {
        let actions = NextAction::for_empty_result(true);
        assert_eq!(actions.first(), Some(&NextAction::ManualSearch));
        assert!(actions.contains(&NextAction::RetryNow));

        assert!(!NextAction::for_empty_result(false).contains(&NextAction::RetryNow));
        assert!(!NextAction::for_exhausted_retries().is_empty());
    }

    #[test]
    fn test_retagged_clamps_confidence() {
        let item = MetadataItem::new("42", "Title", "catalog");
        let learned = item.retagged(LEARNED_SOURCE, 1.4);
        assert!(learned.is_learned());
        assert_eq!(learned.confidence, 1.0);
        assert_eq!(item.source, "catalog");
    }
}
