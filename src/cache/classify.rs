use crate::config::CacheConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Content class of a cached answer; decides its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    Factual,
    General,
    TimeSensitive,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Factual => "factual",
            Self::General => "general",
            Self::TimeSensitive => "time-sensitive",
        }
    }
}

/// Words whose presence marks a prompt as time-sensitive.
const TIME_SENSITIVE_SEEDS: &[&str] = &[
    "today",
    "tonight",
    "yesterday",
    "tomorrow",
    "current",
    "currently",
    "latest",
    "right now",
    "live",
    "breaking",
    "stock price",
    "exchange rate",
    "weather",
    "forecast",
    "news",
    "headline",
    "election",
    "score",
    "status",
    "trending",
];

/// "what/who/where/when/which + is/are/was/were + the …" and friends.
static FACTUAL_QUESTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(what|who|where|when|which)\s+(is|are|was|were)\s+(the\s+)?\w")
        .expect("Failed to compile factual question regex")
});

/// Recent-year mentions ("in 2025", "year 2024") read as time-sensitive.
static YEAR_20XX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b20\d{2}\b").expect("Failed to compile year regex")
});

const FACTUAL_MARKERS: &[&str] = &[
    "capital of",
    "element",
    "symbol for",
    "chemical symbol",
    "atomic number",
    "formula for",
    "definition of",
    "defined as",
    "square root",
    "speed of light",
    "boiling point",
    "freezing point",
    "how many continents",
    "largest planet",
];

/// Classify a prompt at store time. Operates on the lowercased prompt;
/// time-sensitive wins when both classes match ("current population of
/// France" is time-sensitive even though it reads factual).
pub fn classify(prompt: &str, extra_seeds: &[String]) -> ContentType {
    let lower = prompt.to_lowercase();

    let time_sensitive = TIME_SENSITIVE_SEEDS
        .iter()
        .any(|seed| lower.contains(seed))
        || extra_seeds.iter().any(|seed| !seed.is_empty() && lower.contains(&seed.to_lowercase()))
        || YEAR_20XX.is_match(&lower);
    if time_sensitive {
        return ContentType::TimeSensitive;
    }

    let factual = FACTUAL_QUESTION.is_match(lower.trim())
        || FACTUAL_MARKERS.iter().any(|marker| lower.contains(marker));
    if factual {
        return ContentType::Factual;
    }

    ContentType::General
}

/// Built-in TTL defaults (ms).
pub const FACTUAL_TTL_MS: u64 = 7 * 24 * 60 * 60 * 1000;
pub const GENERAL_TTL_MS: u64 = 24 * 60 * 60 * 1000;
pub const TIME_SENSITIVE_TTL_MS: u64 = 5 * 60 * 1000;

/// Resolved TTLs after applying config overrides. An explicit override for
/// any content type replaces its built-in default; `ttl_ms` keeps meaning
/// only for `general`.
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    pub factual_ms: u64,
    pub general_ms: u64,
    pub time_sensitive_ms: u64,
}

impl TtlPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        let overrides = &config.ttl_by_content_type;
        Self {
            factual_ms: overrides
                .get(&ContentType::Factual)
                .copied()
                .unwrap_or(FACTUAL_TTL_MS),
            general_ms: overrides
                .get(&ContentType::General)
                .copied()
                .unwrap_or(config.ttl_ms),
            time_sensitive_ms: overrides
                .get(&ContentType::TimeSensitive)
                .copied()
                .unwrap_or(TIME_SENSITIVE_TTL_MS),
        }
    }

    pub fn ttl_for(&self, content_type: ContentType) -> u64 {
        match content_type {
            ContentType::Factual => self.factual_ms,
            ContentType::General => self.general_ms,
            ContentType::TimeSensitive => self.time_sensitive_ms,
        }
    }
}
