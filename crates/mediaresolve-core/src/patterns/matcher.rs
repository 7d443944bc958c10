//! Ordered matching of a filename against learned mappings.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::extract::{extract, normalize_token, ExtractedPattern};
use super::mapping::FilenameMapping;
use super::similarity::similarity;

/// Confidence for an identical filename.
pub const EXACT_CONFIDENCE: f64 = 1.0;

/// Confidence for equal group and title tokens.
pub const GROUP_TITLE_CONFIDENCE: f64 = 0.95;

/// Confidence for a regex hit.
pub const REGEX_CONFIDENCE: f64 = 0.9;

/// Minimum title similarity accepted by the fuzzy step.
pub const FUZZY_THRESHOLD: f64 = 0.8;

/// Which matching step produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    GroupTitle,
    Regex,
    Fuzzy,
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchStrategy::Exact => write!(f, "exact"),
            MatchStrategy::GroupTitle => write!(f, "group_title"),
            MatchStrategy::Regex => write!(f, "regex"),
            MatchStrategy::Fuzzy => write!(f, "fuzzy"),
        }
    }
}

/// A mapping that matched a filename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub mapping: FilenameMapping,
    pub strategy: MatchStrategy,
    pub confidence: f64,
}

/// Matcher applying exact, group+title, regex, then fuzzy steps.
///
/// Compiled mapping regexes are cached by pattern text and shared between
/// clones. Invalid patterns are cached as `None`.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    fuzzy_threshold: f64,
    regexes: Arc<RwLock<HashMap<String, Option<Regex>>>>,
}

impl PatternMatcher {
    pub fn new() -> Self {
        Self {
            fuzzy_threshold: FUZZY_THRESHOLD,
            regexes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Override the fuzzy acceptance threshold (clamped to `[0, 1]`).
    pub fn with_fuzzy_threshold(mut self, threshold: f64) -> Self {
        self.fuzzy_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Find the best mapping for a filename. The first step with a hit wins.
    pub fn find(&self, filename: &str, mappings: &[FilenameMapping]) -> Option<PatternMatch> {
        if mappings.is_empty() {
            return None;
        }
        let filename = filename.trim();
        let extracted = extract(filename);

        self.exact(filename, mappings)
            .or_else(|| self.group_title(&extracted, mappings))
            .or_else(|| self.regex(filename, mappings))
            .or_else(|| self.fuzzy(&extracted, mappings))
    }

    fn exact(&self, filename: &str, mappings: &[FilenameMapping]) -> Option<PatternMatch> {
        prefer_most_used(mappings.iter().filter(|m| m.pattern == filename))
            .map(|m| hit(m, MatchStrategy::Exact, EXACT_CONFIDENCE))
    }

    fn group_title(
        &self,
        extracted: &ExtractedPattern,
        mappings: &[FilenameMapping],
    ) -> Option<PatternMatch> {
        if !extracted.has_title() {
            return None;
        }
        let group = extracted.group.as_deref().map(normalize_token);
        let title = normalize_token(&extracted.title);

        prefer_most_used(mappings.iter().filter(|m| {
            m.allows_title_match()
                && m.group.as_deref().map(normalize_token) == group
                && normalize_token(&m.title) == title
        }))
        .map(|m| hit(m, MatchStrategy::GroupTitle, GROUP_TITLE_CONFIDENCE))
    }

    fn regex(&self, filename: &str, mappings: &[FilenameMapping]) -> Option<PatternMatch> {
        prefer_most_used(mappings.iter().filter(|m| {
            m.allows_regex()
                && m.regex
                    .as_deref()
                    .and_then(|pattern| self.compiled(m, pattern))
                    .is_some_and(|re| re.is_match(filename))
        }))
        .map(|m| hit(m, MatchStrategy::Regex, REGEX_CONFIDENCE))
    }

    fn compiled(&self, mapping: &FilenameMapping, pattern: &str) -> Option<Regex> {
        if let Some(cached) = self.regexes.read().get(pattern) {
            return cached.clone();
        }

        let compiled = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(mapping = %mapping.id, error = %e, "Skipping mapping with invalid regex");
                None
            }
        };
        self.regexes.write().insert(pattern.to_string(), compiled.clone());
        compiled
    }

    fn fuzzy(&self, extracted: &ExtractedPattern, mappings: &[FilenameMapping]) -> Option<PatternMatch> {
        if !extracted.has_title() {
            return None;
        }

        mappings
            .iter()
            .filter(|m| m.allows_title_match())
            .map(|m| (m, similarity(&extracted.title, &m.title)))
            .filter(|(_, score)| *score >= self.fuzzy_threshold)
            .max_by(|(a, sa), (b, sb)| {
                sa.total_cmp(sb).then(a.use_count.cmp(&b.use_count))
            })
            .map(|(m, score)| hit(m, MatchStrategy::Fuzzy, score))
    }
}

impl Default for PatternMatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn prefer_most_used<'a, I>(candidates: I) -> Option<&'a FilenameMapping>
where
    I: Iterator<Item = &'a FilenameMapping>,
{
    candidates.max_by(|a, b| {
        a.use_count
            .cmp(&b.use_count)
            .then(b.created_at.cmp(&a.created_at))
    })
}

fn hit(mapping: &FilenameMapping, strategy: MatchStrategy, confidence: f64) -> PatternMatch {
    PatternMatch {
        mapping: mapping.clone(),
        strategy,
        confidence,
    }
}
