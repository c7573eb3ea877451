//! Trigram text similarity.
//!
//! Trigrams are extracted the way `pg_trgm` does it: each word is padded with
//! two leading blanks and one trailing blank, then split into overlapping
//! three-character windows. Two scores are derived from the trigram sets:
//!
//! - **similarity**: `|A ∩ B| / |A ∪ B|` (symmetric)
//! - **containment**: `|Q ∩ T| / |Q|` (how much of a short query appears in
//!   a longer target)
//!
//! Field-level similarity for duplicate detection uses Jaro-Winkler
//! (`strsim`) for short values such as brands and model numbers, and trigram
//! similarity for longer free text.

use std::collections::HashSet;

use crate::models::CanonicalRecall;

/// Values at most this many characters long are compared with Jaro-Winkler.
const SHORT_FIELD_CHARS: usize = 32;

/// Lowercase, drop apostrophes, turn other punctuation into blanks, and
/// collapse whitespace.
pub fn normalize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;
    for ch in input.chars() {
        if ch == '\'' || ch == '\u{2019}' {
            continue;
        }
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

/// Trigram set of `input` after normalization.
pub fn trigrams(input: &str) -> HashSet<String> {
    let normalized = normalize_text(input);
    let mut set = HashSet::new();
    for word in normalized.split_whitespace() {
        let padded: Vec<char> = format!("  {} ", word).chars().collect();
        for window in padded.windows(3) {
            set.insert(window.iter().collect());
        }
    }
    set
}

/// Symmetric trigram similarity in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    let union = ta.len() + tb.len() - shared;
    shared as f64 / union as f64
}

/// Fraction of the query's trigrams present in the target, in `[0, 1]`.
pub fn containment(query: &str, target: &str) -> f64 {
    let tq = trigrams(query);
    if tq.is_empty() {
        return 0.0;
    }
    let tt = trigrams(target);
    let shared = tq.iter().filter(|t| tt.contains(*t)).count();
    shared as f64 / tq.len() as f64
}

/// Continuous text match score: mean of similarity and containment.
///
/// Rewards a short query fully contained in a longer product name without
/// letting a single shared word dominate.
pub fn text_score(query: &str, target: &str) -> f64 {
    (similarity(query, target) + containment(query, target)) / 2.0
}

/// Similarity of two field values for duplicate detection.
///
/// Returns `None` when either side is empty, since an absent field carries
/// no evidence either way.
pub fn field_similarity(a: &str, b: &str) -> Option<f64> {
    let na = normalize_text(a);
    let nb = normalize_text(b);
    if na.is_empty() || nb.is_empty() {
        return None;
    }
    if na == nb {
        return Some(1.0);
    }
    if na.chars().count() <= SHORT_FIELD_CHARS && nb.chars().count() <= SHORT_FIELD_CHARS {
        Some(strsim::jaro_winkler(&na, &nb))
    } else {
        Some(similarity(&na, &nb))
    }
}

/// Mean field similarity over brand, model number, and hazard text.
pub fn record_similarity(a: &CanonicalRecall, b: &CanonicalRecall) -> f64 {
    let scores: Vec<f64> = [
        field_similarity(&a.brand, &b.brand),
        field_similarity(&a.model_number, &b.model_number),
        field_similarity(&a.hazard_description, &b.hazard_description),
    ]
    .into_iter()
    .flatten()
    .collect();

    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().sum::<f64>() / scores.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_punctuation_and_apostrophes() {
        assert_eq!(normalize_text("Rock 'n Play™ Sleeper!"), "rock n play sleeper");
        assert_eq!(normalize_text("  Fisher-Price  "), "fisher price");
        assert_eq!(normalize_text("Children’s"), "childrens");
        assert_eq!(normalize_text("---"), "");
    }

    #[test]
    fn trigrams_follow_pg_trgm_padding() {
        let t = trigrams("cat");
        let expected: HashSet<String> = ["  c", " ca", "cat", "at "]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(t, expected);
    }

    #[test]
    fn similarity_bounds() {
        assert!((similarity("sleeper", "sleeper") - 1.0).abs() < 1e-9);
        assert_eq!(similarity("", "sleeper"), 0.0);
        assert_eq!(similarity("abc", "xyz"), 0.0);
    }

    #[test]
    fn containment_of_short_query_in_long_name() {
        let c = containment("Rock n Play", "Rock 'n Play Sleeper");
        assert!((c - 1.0).abs() < 1e-9);
        let s = similarity("Rock n Play", "Rock 'n Play Sleeper");
        assert!((s - 0.6).abs() < 1e-9, "got {}", s);
        assert!((text_score("Rock n Play", "Rock 'n Play Sleeper") - 0.8).abs() < 1e-9);
    }

    #[test]
    fn field_similarity_skips_empty_values() {
        assert_eq!(field_similarity("", "Acme"), None);
        assert_eq!(field_similarity("ACME", "acme"), Some(1.0));
        let jw = field_similarity("Acme Corp", "Acme Corp.").unwrap();
        assert!((jw - 1.0).abs() < 1e-9);
        let different = field_similarity("Acme", "Globex").unwrap();
        assert!(different < 0.7);
    }
}
