//! # mediaresolve-core
//!
//! Deterministic building blocks for media metadata resolution.
//!
//! This crate holds everything that can be decided without I/O:
//! - Request, result and audit types shared by all resolution paths
//! - Per-source health records and the derived [`DegradationLevel`]
//! - Filename pattern extraction, similarity and ordered matching
//!
//! Network sources, circuit breakers, retries and background workers live in
//! `mediaresolve-runtime`.
//!
//! ## Example
//!
//! ```rust
//! use mediaresolve_core::patterns::{extract, FilenameMapping, PatternMatcher};
//!
//! let learned = FilenameMapping::from_extracted(&extract("[Grp] Title - 01.mkv"), "tmdb:42").unwrap();
//! let hit = PatternMatcher::new()
//!     .find("[Grp] Title - 27.mkv", &[learned])
//!     .expect("sibling episode matches");
//!
//! assert_eq!(hit.mapping.metadata_id, "tmdb:42");
//! assert!(hit.confidence >= 0.9);
//! ```

pub mod health;
pub mod patterns;
pub mod types;

// Re-export main types at crate root
pub use health::{DegradationLevel, ServiceHealth, ServiceStatus};
pub use patterns::{
    ExtractedPattern, FilenameMapping, MatchStrategy, PatternError, PatternKind, PatternMatch,
    PatternMatcher,
};
pub use types::{
    FallbackStatus, MediaType, MetadataItem, NextAction, SearchRequest, SkipReason, SourceAttempt,
    CACHED_SOURCE, LEARNED_SOURCE,
};
