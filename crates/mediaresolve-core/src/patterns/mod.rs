//! Filename pattern learning.
//!
//! A manual correction becomes a [`FilenameMapping`]; later filenames with
//! the same shape are matched by [`PatternMatcher`] without touching any
//! network source.

mod extract;
mod mapping;
mod matcher;
mod similarity;

pub use extract::{extract, extract_group, extract_title, normalize_token, strip_extension, ExtractedPattern};
pub use mapping::{FilenameMapping, PatternKind};
pub use matcher::{
    MatchStrategy, PatternMatch, PatternMatcher, EXACT_CONFIDENCE, FUZZY_THRESHOLD,
    GROUP_TITLE_CONFIDENCE, REGEX_CONFIDENCE,
};
pub use similarity::similarity;

use thiserror::Error;

/// Errors raised while building a mapping.
#[derive(Error, Debug)]
pub enum PatternError {
    #[error("Filename is empty")]
    EmptyFilename,

    #[error("Title is empty")]
    EmptyTitle,

    #[error("Metadata id is required")]
    MissingMetadataId,

    #[error("Derived regex is invalid: {0}")]
    InvalidRegex(String),
}
