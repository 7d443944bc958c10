//! Learned filename-to-metadata mappings.

use std::fmt;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::extract::ExtractedPattern;
use super::PatternError;

/// How a mapping is allowed to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Only the identical filename matches
    Exact,
    /// Exact, group+title, regex and fuzzy title matches
    Regex,
    /// Exact, group+title and fuzzy title matches; no regex
    FuzzyTitle,
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternKind::Exact => write!(f, "exact"),
            PatternKind::Regex => write!(f, "regex"),
            PatternKind::FuzzyTitle => write!(f, "fuzzy_title"),
        }
    }
}

/// A stored rule linking a filename shape to a metadata id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilenameMapping {
    pub id: String,

    /// Filename (or edited title) the mapping was learned from
    pub pattern: String,

    pub kind: PatternKind,

    #[serde(default)]
    pub group: Option<String>,

    pub title: String,

    #[serde(default)]
    pub regex: Option<String>,

    /// Metadata entity the pattern resolves to
    pub metadata_id: String,

    pub use_count: u64,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl FilenameMapping {
    /// Build a mapping from extracted filename tokens.
    ///
    /// Filenames without a usable title can only ever match exactly.
    pub fn from_extracted(
        extracted: &ExtractedPattern,
        metadata_id: impl Into<String>,
    ) -> Result<Self, PatternError> {
        let metadata_id = metadata_id.into();
        if metadata_id.trim().is_empty() {
            return Err(PatternError::MissingMetadataId);
        }
        if extracted.filename.trim().is_empty() {
            return Err(PatternError::EmptyFilename);
        }
        if let Some(regex) = &extracted.regex {
            Regex::new(regex).map_err(|e| PatternError::InvalidRegex(e.to_string()))?;
        }

        let kind = if extracted.regex.is_some() {
            PatternKind::Regex
        } else {
            PatternKind::Exact
        };

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            pattern: extracted.filename.clone(),
            kind,
            group: extracted.group.clone(),
            title: extracted.title.clone(),
            regex: extracted.regex.clone(),
            metadata_id,
            use_count: 0,
            created_at: Utc::now(),
            last_used_at: None,
        })
    }

    /// Build a title-only mapping from a user-edited title.
    pub fn fuzzy_title(
        title: impl Into<String>,
        metadata_id: impl Into<String>,
    ) -> Result<Self, PatternError> {
        let title = title.into().trim().to_string();
        let metadata_id = metadata_id.into();
        if title.is_empty() {
            return Err(PatternError::EmptyTitle);
        }
        if metadata_id.trim().is_empty() {
            return Err(PatternError::MissingMetadataId);
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            pattern: title.clone(),
            kind: PatternKind::FuzzyTitle,
            group: None,
            title,
            regex: None,
            metadata_id,
            use_count: 0,
            created_at: Utc::now(),
            last_used_at: None,
        })
    }

    /// Record that the mapping resolved a file.
    pub fn mark_used(&mut self, at: DateTime<Utc>) {
        self.use_count = self.use_count.saturating_add(1);
        self.last_used_at = Some(at);
    }

    pub fn allows_regex(&self) -> bool {
        self.kind == PatternKind::Regex && self.regex.is_some()
    }

    pub fn allows_title_match(&self) -> bool {
        self.kind != PatternKind::Exact && !self.title.is_empty()
    }
}
