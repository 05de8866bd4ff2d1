use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

/// Capability class; prompts and models are both bucketed into tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    Simple,
    Moderate,
    Complex,
}

impl ComplexityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        }
    }
}

/// Individual signal contributions to the complexity score.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ComplexitySignals {
    pub length: u32,
    pub vocabulary: u32,
    pub code: u32,
    pub reasoning: u32,
    pub multi_step: u32,
}

/// Heuristic complexity estimate. The score is advisory, not a model:
/// production use calls for dry-run validation on real traffic before
/// letting it rewrite models.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComplexityReport {
    /// 0..=100.
    pub score: u32,
    pub tier: ComplexityTier,
    pub signals: ComplexitySignals,
}

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```|(?m)^\s*\$\s|#!/").expect("Failed to compile code fence regex")
});

const REASONING_KEYWORDS: &[&str] = &[
    "analyze",
    "analyse",
    "compare",
    "contrast",
    "derive",
    "prove",
    "explain why",
    "evaluate",
    "optimize",
    "refactor",
    "debug",
    "trade-off",
    "tradeoff",
    "architecture",
    "design a",
];

const MULTI_STEP_MARKERS: &[&str] = &[
    "step 1",
    "first,",
    "second,",
    "then ",
    "finally",
    "after that",
    "1.",
    "2.",
];

pub fn analyze_complexity(prompt: &str) -> ComplexityReport {
    let lower = prompt.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();

    // Prompt length buckets
    let length = match prompt.chars().count() {
        0..=200 => 0,
        201..=800 => 10,
        801..=2000 => 20,
        _ => 30,
    };

    // Vocabulary diversity: unique/total ratio on longer prompts
    let vocabulary = if words.len() >= 20 {
        let unique: HashSet<&&str> = words.iter().collect();
        let ratio = unique.len() as f64 / words.len() as f64;
        (ratio * 15.0).round() as u32
    } else {
        0
    };

    let code = if CODE_FENCE.is_match(prompt) { 20 } else { 0 };

    let reasoning = (REASONING_KEYWORDS
        .iter()
        .filter(|k| lower.contains(*k))
        .count() as u32
        * 5)
        .min(25);

    let multi_step = if MULTI_STEP_MARKERS.iter().any(|m| lower.contains(m)) {
        10
    } else {
        0
    };

    let signals = ComplexitySignals {
        length,
        vocabulary,
        code,
        reasoning,
        multi_step,
    };
    let score = (length + vocabulary + code + reasoning + multi_step).min(100);
    let tier = match score {
        0..=29 => ComplexityTier::Simple,
        30..=59 => ComplexityTier::Moderate,
        _ => ComplexityTier::Complex,
    };

    ComplexityReport {
        score,
        tier,
        signals,
    }
}
