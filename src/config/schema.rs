use crate::cache::classify::ContentType;
use crate::pricing::ModelPricing;
use crate::router::ComplexityTier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Enable/disable individual pipeline stages. Everything defaults to on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    pub guard: bool,
    pub cache: bool,
    pub context: bool,
    pub router: bool,
    pub prefix: bool,
    pub ledger: bool,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            guard: true,
            cache: true,
            context: true,
            router: true,
            prefix: true,
            ledger: true,
        }
    }
}

/// Fuzzy-match text encoding for the response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncodingStrategy {
    #[default]
    Bigram,
    /// Trigram encoding; denser signatures, stricter matching.
    Holographic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    /// TTL for `general` entries when no override is present (ms).
    pub ttl_ms: u64,
    /// Explicit per-content-type TTL overrides. An override for any type
    /// replaces its built-in default.
    pub ttl_by_content_type: HashMap<ContentType, u64>,
    pub similarity_threshold: f64,
    pub encoding_strategy: EncodingStrategy,
    /// Extra keywords classified as time-sensitive, merged with the built-in
    /// seed set.
    pub semantic_seeds: Vec<String>,
    /// KV namespace for persisted entries.
    pub store_name: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl_ms: 24 * 60 * 60 * 1000,
            ttl_by_content_type: HashMap::new(),
            similarity_threshold: 0.85,
            encoding_strategy: EncodingStrategy::Bigram,
            semantic_seeds: Vec::new(),
            store_name: "tokenshield-cache".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub debounce_ms: u64,
    pub max_requests_per_minute: u32,
    pub max_cost_per_hour: f64,
    /// Normalized prompts shorter than this are rejected.
    pub min_input_length: usize,
    /// Model assumed when estimating the cost of a request for the hourly
    /// cost gate; defaults to the request's own model.
    pub model_id: Option<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2000,
            max_requests_per_minute: 60,
            max_cost_per_hour: 10.0,
            min_input_length: 2,
            model_id: None,
        }
    }
}

/// Context trimming strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContextStrategy {
    #[default]
    #[serde(rename = "fit")]
    FitToBudget,
    Sliding,
    Priority,
    Smart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_context_tokens: u32,
    pub reserved_for_output: u32,
    pub tool_token_overhead: u32,
    pub strategy: ContextStrategy,
    /// Message count for the sliding-window strategy.
    pub sliding_max: Option<usize>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 8000,
            reserved_for_output: 1000,
            tool_token_overhead: 0,
            strategy: ContextStrategy::FitToBudget,
            sliding_max: None,
        }
    }
}

/// One routable model, cheapest first in the candidate list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCandidate {
    pub model_id: String,
    pub tier: ComplexityTier,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Ordered cheapest → most capable.
    pub candidates: Vec<ModelCandidate>,
    /// Report routing decisions without rewriting the model.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefixConfig {}

/// Breaker action when a spend limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BreakerAction {
    #[default]
    Stop,
    Throttle,
    Warn,
}

/// Rolling-window spend caps in dollars. `None` leaves a window unenforced;
/// `Some(0.0)` is a zero budget that blocks everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerLimits {
    pub per_session: Option<f64>,
    pub per_hour: Option<f64>,
    pub per_day: Option<f64>,
    pub per_month: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub limits: BreakerLimits,
    pub action: BreakerAction,
    pub persist: bool,
}

/// Per-user caps in dollars. `0` means no limit in that window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    pub daily: f64,
    pub monthly: f64,
    pub tier: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetsConfig {
    /// User-specific limits; users absent here fall back to `default_budget`.
    pub users: HashMap<String, BudgetLimits>,
    pub default_budget: Option<BudgetLimits>,
    /// Tier name → model id; consulted by the pipeline to rewrite the model
    /// for a user's resolved tier.
    pub tier_models: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserBudgetConfig {
    pub budgets: BudgetsConfig,
    pub persist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub persist: bool,
    /// Default feature tag applied to entries without one.
    pub feature: Option<String>,
    pub capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            persist: false,
            feature: None,
            capacity: 10_000,
        }
    }
}

/// One coherent configuration object per pipeline instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldConfig {
    pub modules: ModulesConfig,
    pub cache: CacheConfig,
    pub guard: GuardConfig,
    pub context: ContextConfig,
    pub router: RouterConfig,
    pub prefix: PrefixConfig,
    pub breaker: BreakerConfig,
    pub user_budget: UserBudgetConfig,
    pub ledger: LedgerConfig,
    /// Model pricing overrides, prefix-matched before the embedded snapshot.
    pub pricing_overrides: HashMap<String, ModelPricing>,
    /// Report every stage's would-be action without changing any state.
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_fully_enabled() {
        let config = ShieldConfig::default();
        assert!(config.modules.cache && config.modules.guard && config.modules.ledger);
        assert_eq!(config.cache.max_entries, 1000);
        assert!((config.cache.similarity_threshold - 0.85).abs() < 1e-9);
        assert_eq!(config.ledger.capacity, 10_000);
        assert!(!config.dry_run);
    }

    #[test]
    fn config_deserializes_from_partial_json() {
        let config: ShieldConfig = serde_json::from_str(
            r#"{
                "cache": { "max_entries": 50, "similarity_threshold": 0.95 },
                "breaker": { "limits": { "per_hour": 0.25 }, "action": "stop" },
                "router": { "candidates": [
                    { "model_id": "gpt-4o-mini", "tier": "simple" },
                    { "model_id": "gpt-4o", "tier": "complex" }
                ]}
            }"#,
        )
        .unwrap();
        assert_eq!(config.cache.max_entries, 50);
        assert_eq!(config.breaker.limits.per_hour, Some(0.25));
        assert_eq!(config.breaker.limits.per_day, None);
        assert_eq!(config.router.candidates.len(), 2);
        // Untouched sections keep defaults
        assert_eq!(config.context.max_context_tokens, 8000);
    }

    #[test]
    fn ttl_override_map_uses_content_type_keys() {
        let config: CacheConfig = serde_json::from_str(
            r#"{ "ttl_by_content_type": { "factual": 1000, "time-sensitive": 50 } }"#,
        )
        .unwrap();
        assert_eq!(config.ttl_by_content_type[&ContentType::Factual], 1000);
        assert_eq!(config.ttl_by_content_type[&ContentType::TimeSensitive], 50);
    }
}
