//! Similarity engine: normalization + a 0..=100 fuzzy-match score.
//! Short strings use a character-level matching-substring ratio
//! (Ratcliff/Obershelp); long strings use a 60/40 blend of word-set Jaccard
//! and the character ratio over a 500-char prefix. Pure functions, no shared
//! state, safe to call from concurrent requests.

/// Length below which both strings are scored purely character-level.
const SHORT_TEXT_CHARS: usize = 100;
/// Prefix length used for the character-ratio half of the long-text blend.
const BLEND_PREFIX_CHARS: usize = 500;
/// Weight of word-set Jaccard in the long-text blend.
const JACCARD_WEIGHT: f64 = 0.6;
/// Weight of the character ratio in the long-text blend.
const CHAR_WEIGHT: f64 = 0.4;

/// Strip markup tags, casefold, collapse whitespace runs, trim.
/// Deterministic; used both for scoring and for fuzzy-search gating.
pub fn normalize(text: &str) -> String {
    let stripped = strip_tags(text);
    let mut out = String::with_capacity(stripped.len());
    let mut pending_space = false;
    for c in stripped.chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            for lc in c.to_lowercase() {
                out.push(lc);
            }
        }
    }
    out
}

/// Remove `<...>` spans. A `<` with no later `>` is kept as literal text.
fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        match rest[open..].find('>') {
            Some(close) => {
                // Tag contents are dropped; a space keeps adjacent words apart.
                out.push(' ');
                rest = &rest[open + close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Similarity score in [0, 100] between two raw (unnormalized) strings.
pub fn similarity(a: &str, b: &str) -> u8 {
    let na = normalize(a);
    let nb = normalize(b);
    if na.is_empty() || nb.is_empty() {
        return 0;
    }

    let ca: Vec<char> = na.chars().collect();
    let cb: Vec<char> = nb.chars().collect();

    if ca.len() < SHORT_TEXT_CHARS && cb.len() < SHORT_TEXT_CHARS {
        return (char_ratio(&ca, &cb) * 100.0).floor() as u8;
    }

    let jaccard = word_jaccard(&na, &nb);
    let prefix_a = &ca[..ca.len().min(BLEND_PREFIX_CHARS)];
    let prefix_b = &cb[..cb.len().min(BLEND_PREFIX_CHARS)];
    let chars = char_ratio(prefix_a, prefix_b);

    ((JACCARD_WEIGHT * jaccard + CHAR_WEIGHT * chars) * 100.0).floor() as u8
}

/// Jaccard similarity of whitespace-tokenized word sets (duplicates collapsed).
fn word_jaccard(a: &str, b: &str) -> f64 {
    use std::collections::HashSet;
    let set_a: HashSet<&str> = a.split_whitespace().collect();
    let set_b: HashSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.len() + set_b.len() - intersection;
    intersection as f64 / union as f64
}

/// Ratcliff/Obershelp ratio: 2*M / (|a|+|b|) where M is the total matched
/// character count found by recursively locating longest common substrings.
fn char_ratio(a: &[char], b: &[char]) -> f64 {
    let total = a.len() + b.len();
    if total == 0 {
        return 0.0;
    }
    let matched = matching_chars(a, b);
    (2 * matched) as f64 / total as f64
}

/// Total characters covered by the recursive longest-common-substring match.
fn matching_chars(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let (pos_a, pos_b, len) = longest_common_substring(a, b);
    if len == 0 {
        return 0;
    }
    len + matching_chars(&a[..pos_a], &b[..pos_b])
        + matching_chars(&a[pos_a + len..], &b[pos_b + len..])
}

/// Longest common substring via a rolling DP row. Returns (start_a, start_b, len).
fn longest_common_substring(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut prev = vec![0usize; b.len() + 1];
    let mut best = (0usize, 0usize, 0usize);
    for (i, &ac) in a.iter().enumerate() {
        let mut row = vec![0usize; b.len() + 1];
        for (j, &bc) in b.iter().enumerate() {
            if ac == bc {
                let run = prev[j] + 1;
                row[j + 1] = run;
                if run > best.2 {
                    best = (i + 1 - run, j + 1 - run, run);
                }
            }
        }
        prev = row;
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_tags_and_collapses_whitespace() {
        assert_eq!(
            normalize("<p>Hello   <b>World</b></p>\n\n"),
            "hello world"
        );
        assert_eq!(normalize("  Mixed CASE\ttext "), "mixed case text");
    }

    #[test]
    fn normalize_keeps_unclosed_angle_bracket() {
        assert_eq!(normalize("a < b"), "a < b");
    }

    #[test]
    fn identical_strings_score_100() {
        assert_eq!(similarity("Hello world", "Hello world"), 100);
        // Long-text path: identical inputs still score 100.
        let long = "word ".repeat(60);
        assert_eq!(similarity(&long, &long), 100);
    }

    #[test]
    fn empty_normalized_scores_zero() {
        assert_eq!(similarity("", "anything"), 0);
        assert_eq!(similarity("<br>", "anything"), 0);
        assert_eq!(similarity("   ", "   "), 0);
    }

    #[test]
    fn near_duplicates_score_high() {
        let score = similarity("Welcome to our store", "Welcome to our shop");
        assert!(score >= 70, "score was {score}");
    }

    #[test]
    fn unrelated_strings_score_low() {
        let score = similarity("Welcome to our store", "Quarterly revenue dipped");
        assert!(score < 50, "score was {score}");
    }

    #[test]
    fn long_text_blend_tolerates_reordering() {
        let a = "the quick brown fox jumps over the lazy dog and runs far away into the distant hills ".repeat(3);
        let b = "the lazy dog and the quick brown fox runs far away into the distant hills jumps over ".repeat(3);
        // Same word set, shuffled order: Jaccard weight keeps the score up.
        assert!(similarity(&a, &b) >= 60);
    }

    #[test]
    fn lcs_finds_middle_run() {
        let a: Vec<char> = "xxabcdyy".chars().collect();
        let b: Vec<char> = "zzabcdww".chars().collect();
        let (pa, pb, len) = longest_common_substring(&a, &b);
        assert_eq!((pa, pb, len), (2, 2, 4));
    }
}
