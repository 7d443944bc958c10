//! Title similarity.
//!
//! Matching logic only depends on [`similarity`]; the edit-distance
//! algorithm behind it can change without touching the matcher.

use super::extract::normalize_token;

/// Normalized similarity of two titles in `[0.0, 1.0]`.
///
/// `1 - editDistance / max(len_a, len_b)` over normalized characters.
/// Two empty titles are identical.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = normalize_token(a).chars().collect();
    let b: Vec<char> = normalize_token(b).chars().collect();

    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }

    let distance = levenshtein(&a, &b);
    1.0 - distance as f64 / longest as f64
}

/// Classic two-row Levenshtein distance.
fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            let insertion = current[j] + 1;
            let deletion = previous[j + 1] + 1;
            current[j + 1] = substitution.min(insertion).min(deletion);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_identical_titles() {
        assert_eq!(similarity("Sousou no Frieren", "sousou  no frieren"), 1.0);
        assert_eq!(similarity("", ""), 1.0);
    }

    #[test]
    fn test_small_typo_is_similar() {
        let score = similarity("Sousou no Frieren", "Sousou no Frieran");
        assert!(score >= 0.9, "score was {score}");
    }

    #[test]
    fn test_different_titles() {
        assert!(similarity("Frieren", "Bocchi the Rock") < 0.5);
        assert_eq!(similarity("abc", ""), 0.0);
    }

    #[test]
    fn test_levenshtein_known_values() {
        let kitten: Vec<char> = "kitten".chars().collect();
        let sitting: Vec<char> = "sitting".chars().collect();
        assert_eq!(levenshtein(&kitten, &sitting), 3);
    }

    proptest! {
        #[test]
        fn prop_similarity_is_bounded(a in ".{0,24}", b in ".{0,24}") {
            let s = similarity(&a, &b);
            prop_assert!((0.0..=1.0).contains(&s));
        }

        #[test]
        fn prop_similarity_is_symmetric(a in "[a-z ]{0,16}", b in "[a-z ]{0,16}") {
            prop_assert!((similarity(&a, &b) - similarity(&b, &a)).abs() < 1e-12);
        }

        #[test]
        fn prop_self_similarity_is_one(a in ".{0,24}") {
            prop_assert_eq!(similarity(&a, &a), 1.0);
        }
    }
}
