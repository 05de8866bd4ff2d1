use crate::config::EncodingStrategy;
use std::collections::HashSet;

/// Dice coefficient `2·|A∩B| / (|A|+|B|)` over character n-gram sets of the
/// two (already normalized) strings. When both strings are too short to
/// produce any n-gram, they compare equal iff they have the same length.
pub fn similarity(a: &str, b: &str, encoding: EncodingStrategy) -> f64 {
    let n = match encoding {
        EncodingStrategy::Bigram => 2,
        EncodingStrategy::Holographic => 3,
    };
    ngram_dice(a, b, n)
}

fn ngram_dice(a: &str, b: &str, n: usize) -> f64 {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();

    if a_chars.len() < n && b_chars.len() < n {
        return if a_chars.len() == b_chars.len() { 1.0 } else { 0.0 };
    }

    let a_grams = grams(&a_chars, n);
    let b_grams = grams(&b_chars, n);
    let total = a_grams.len() + b_grams.len();
    if total == 0 {
        return 0.0;
    }
    let shared = a_grams.intersection(&b_grams).count();
    2.0 * shared as f64 / total as f64
}

fn grams(chars: &[char], n: usize) -> HashSet<String> {
    chars.windows(n).map(|w| w.iter().collect()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bigram(a: &str, b: &str) -> f64 {
        similarity(a, b, EncodingStrategy::Bigram)
    }

    #[test]
    fn identical_strings_score_one() {
        assert!((bigram("what is promiseall", "what is promiseall") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn disjoint_strings_score_zero() {
        assert_eq!(bigram("aaaa", "bbbb"), 0.0);
    }

    #[test]
    fn near_duplicates_score_high() {
        let score = bigram("what is promiseall", "whats promiseall");
        assert!(score >= 0.85, "expected >= 0.85, got {}", score);
    }

    #[test]
    fn unrelated_prompts_score_low() {
        let score = bigram("what is promiseall", "capital of france");
        assert!(score < 0.3, "expected < 0.3, got {}", score);
    }

    #[test]
    fn short_string_equal_length_rule() {
        // Neither side produces a bigram: equal lengths compare equal
        assert_eq!(bigram("", ""), 1.0);
        assert_eq!(bigram("a", "b"), 1.0);
        assert_eq!(bigram("a", ""), 0.0);
    }

    #[test]
    fn one_sided_short_string_scores_zero() {
        assert_eq!(bigram("a", "abcdef"), 0.0);
    }

    #[test]
    fn trigram_is_stricter() {
        let b = similarity("hello world", "hello walrus", EncodingStrategy::Bigram);
        let t = similarity("hello world", "hello walrus", EncodingStrategy::Holographic);
        assert!(t <= b);
    }

    #[test]
    fn symmetric() {
        let x = bigram("one two three", "one three two");
        let y = bigram("one three two", "one two three");
        assert!((x - y).abs() < 1e-12);
    }
}
