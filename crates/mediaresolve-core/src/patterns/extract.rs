//! Filename token extraction.
//!
//! Splits a release filename into an optional group tag and a bare title,
//! then derives a regex that matches sibling files of the same release.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    /// Trailing file extension (".mkv", ".mp4", ".m2ts", ".3gp"); needs a letter
    /// so a trailing year such as ".2049" stays in the name
    static ref EXTENSION_PATTERN: Regex =
        Regex::new(r"\.(?:[A-Za-z][A-Za-z0-9]{1,3}|[0-9][A-Za-z][A-Za-z0-9]{0,2})$").unwrap();

    /// Bracketed or parenthetical token, including full-width brackets
    static ref BRACKET_PATTERN: Regex = Regex::new(r"[\[\(【]([^\]\)】]*)[\]\)】]").unwrap();

    /// Video resolution tokens
    static ref RESOLUTION_PATTERN: Regex = Regex::new(
        r"(?i)\b(?:\d{3,4}[pi]|[248]k|uhd|\d{3,4}x\d{3,4})\b"
    ).unwrap();

    /// Release source tokens
    static ref SOURCE_PATTERN: Regex = Regex::new(
        r"(?i)\b(?:blu-?ray|bdrip|brrip|bd|web-?dl|web-?rip|web|hdtv|hdrip|dvdrip|dvd|remux|tvrip)\b"
    ).unwrap();

    /// Video/audio codec and bit-depth tokens
    static ref CODEC_PATTERN: Regex = Regex::new(
        r"(?i)\b(?:x\.?26[45]|h\.?26[45]|hevc|avc|xvid|divx|aac(?:2\.0)?|ac3|e-?ac-?3|dts(?:-hd)?|flac|opus|truehd|atmos|10-?bit|8-?bit|hdr10|hdr|hi10p?)\b"
    ).unwrap();

    /// Episode markers: "S01E02", "S01", "E05", "EP05", " - 01", "Episode 5", "第5話", "#05"
    static ref EPISODE_PATTERN: Regex = Regex::new(
        r"(?i)(?:\bS\d{1,2}E\d{1,4}(?:v\d)?\b|\bS\d{1,2}\b|\bEP?\d{1,4}(?:v\d)?\b|\s-\s*\d{1,4}(?:v\d)?\b|\bEpisode\s*\d+\b|第\s*\d+\s*[話话集]|#\d{1,4}\b)"
    ).unwrap();

    /// Dot/underscore separators used in scene-style names
    static ref SEPARATOR_PATTERN: Regex = Regex::new(r"[._]+").unwrap();

    /// Collapsible whitespace
    static ref WHITESPACE_PATTERN: Regex = Regex::new(r"\s+").unwrap();

    /// Tokens that look bracketed but are not release groups
    static ref NON_GROUP_PATTERN: Regex = Regex::new(
        r"(?i)^(?:\d{4}|[0-9a-f]{8}|\d{3,4}[pi]|[248]k|v\d|\d+)$"
    ).unwrap();
}

/// Tokens pulled from one filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedPattern {
    /// The filename the tokens came from
    pub filename: String,

    /// Release-group tag, e.g. "SubsPlease"
    pub group: Option<String>,

    /// Bare title with technical tokens removed
    pub title: String,

    /// Case-insensitive regex matching sibling files, absent when no title
    /// could be extracted
    pub regex: Option<String>,
}

impl ExtractedPattern {
    pub fn has_title(&self) -> bool {
        !self.title.is_empty()
    }
}

/// Extract group, title and regex from a filename.
pub fn extract(filename: &str) -> ExtractedPattern {
    let stem = strip_extension(filename.trim());
    let group = extract_group(stem);
    let title = extract_title(stem);
    let regex = derive_regex(group.as_deref(), &title);

    ExtractedPattern {
        filename: filename.to_string(),
        group,
        title,
        regex,
    }
}

/// Remove the trailing extension, if any.
pub fn strip_extension(filename: &str) -> &str {
    match EXTENSION_PATTERN.find(filename) {
        Some(m) if m.start() > 0 => &filename[..m.start()],
        _ => filename,
    }
}

/// First bracketed token that is not a year, checksum, resolution or number.
pub fn extract_group(stem: &str) -> Option<String> {
    BRACKET_PATTERN
        .captures_iter(stem)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .find(|token| {
            !token.is_empty()
                && !NON_GROUP_PATTERN.is_match(token)
                && !RESOLUTION_PATTERN.is_match(token)
                && !CODEC_PATTERN.is_match(token)
                && !SOURCE_PATTERN.is_match(token)
        })
        .map(str::to_string)
}

/// Title with brackets, technical tokens, separators and episode markers removed.
pub fn extract_title(stem: &str) -> String {
    let body = BRACKET_PATTERN.replace_all(stem, " ");
    let body = CODEC_PATTERN.replace_all(&body, " ");
    let body = RESOLUTION_PATTERN.replace_all(&body, " ");
    let body = SOURCE_PATTERN.replace_all(&body, " ");
    let body = SEPARATOR_PATTERN.replace_all(&body, " ");
    let body = EPISODE_PATTERN.replace_all(&body, " ");
    let body = WHITESPACE_PATTERN.replace_all(&body, " ");

    body.trim_matches(|c: char| c.is_whitespace() || matches!(c, '-' | '–' | '~' | ','))
        .to_string()
}

/// Build the sibling-matching regex from group and title tokens.
fn derive_regex(group: Option<&str>, title: &str) -> Option<String> {
    let words: Vec<String> = title.split_whitespace().map(regex::escape).collect();
    if words.is_empty() {
        return None;
    }

    let mut pattern = String::from("(?i)^");
    if let Some(group) = group {
        pattern.push_str(r"[\[\(【]\s*");
        pattern.push_str(&regex::escape(group));
        pattern.push_str(r"\s*[\]\)】][\s._-]*");
    } else {
        pattern.push_str(r"(?:[\[\(【][^\]\)】]*[\]\)】][\s._-]*)*");
    }
    pattern.push_str(&words.join(r"[\s._-]+"));
    // trailing content starts at a token boundary
    pattern.push_str(r"(?:[^\p{L}\p{N}].*)?$");
    Some(pattern)
}

/// Lowercase and collapse a token for equality comparisons.
pub fn normalize_token(token: &str) -> String {
    token
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fansub_release() {
        let p = extract("[Grp] Title - 01.mkv");
        assert_eq!(p.group.as_deref(), Some("Grp"));
        assert_eq!(p.title, "Title");
        assert!(p.regex.is_some());
    }

    #[test]
    fn test_fansub_release_with_technical_tags() {
        let p = extract("[SubsPlease] Sousou no Frieren - 27 (1080p) [A1B2C3D4].mkv");
        assert_eq!(p.group.as_deref(), Some("SubsPlease"));
        assert_eq!(p.title, "Sousou no Frieren");
    }

    #[test]
    fn test_scene_release() {
        let p = extract("The.Expanse.S02E05.1080p.WEB-DL.x264.mkv");
        assert_eq!(p.group, None);
        assert_eq!(p.title, "The Expanse");
    }

    #[test]
    fn test_year_in_parentheses_is_not_a_group() {
        let p = extract("Blade Runner (1982) [BluRay] [2160p].mp4");
        assert_eq!(p.group, None);
        assert_eq!(p.title, "Blade Runner");
    }

    #[test]
    fn test_cjk_episode_marker() {
        let p = extract("【喵萌奶茶屋】葬送的芙莉莲 第05話 [1080p].mp4");
        assert_eq!(p.group.as_deref(), Some("喵萌奶茶屋"));
        assert_eq!(p.title, "葬送的芙莉莲");
    }

    #[test]
    fn test_no_title_means_no_regex() {
        let p = extract("[Grp] - 01.mkv");
        assert_eq!(p.title, "");
        assert!(p.regex.is_none());
        assert!(!p.has_title());
    }

    #[test]
    fn test_regex_matches_sibling_episode() {
        let p = extract("[Grp] Title - 01.mkv");
        let re = Regex::new(p.regex.as_deref().unwrap()).unwrap();
        assert!(re.is_match("[Grp] Title - 27.mkv"));
        assert!(re.is_match("[grp] title - 02v2.mkv"));
        assert!(!re.is_match("[Other] Title - 27.mkv"));
    }

    #[test]
    fn test_regex_stops_at_token_boundary() {
        let p = extract("[Grp] Title - 01.mkv");
        let re = Regex::new(p.regex.as_deref().unwrap()).unwrap();
        assert!(!re.is_match("[Grp] Titlecard Collection - 05.mkv"));
        assert!(!re.is_match("[Grp] Title2 - 05.mkv"));
        assert!(re.is_match("[Grp] Title.S2 - 05.mkv"));
        assert!(re.is_match("[Grp] Title"));
    }

    #[test]
    fn test_regex_escapes_metacharacters() {
        let p = extract("[Grp] What If...? - 03.mkv");
        let re = Regex::new(p.regex.as_deref().unwrap()).unwrap();
        assert!(re.is_match("[Grp] What If...? - 04.mkv"));
    }

    #[test]
    fn test_strip_extension_keeps_dotfiles() {
        assert_eq!(strip_extension(".mkv"), ".mkv");
        assert_eq!(strip_extension("Movie.mkv"), "Movie");
        assert_eq!(strip_extension("Movie"), "Movie");
        assert_eq!(strip_extension("Clip.3gp"), "Clip");
        assert_eq!(strip_extension("Disc.m2ts"), "Disc");
    }

    #[test]
    fn test_trailing_year_is_not_an_extension() {
        assert_eq!(strip_extension("Blade.Runner.2049"), "Blade.Runner.2049");
        assert_eq!(strip_extension("Blade.Runner.2049.mkv"), "Blade.Runner.2049");
        assert_eq!(extract("Blade.Runner.2049").title, "Blade Runner 2049");
    }

    #[test]
    fn test_normalize_token() {
        assert_eq!(normalize_token("  Sousou-no  FRIEREN "), "sousou no frieren");
        assert_eq!(normalize_token("Grp"), normalize_token("grp"));
    }
}
