use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    /// Fraction of the input rate charged for provider-cached input tokens
    /// (0.1 means cached tokens cost 10% of the normal input rate).
    #[serde(default = "default_cached_discount")]
    pub cached_discount: f64,
}

fn default_cached_discount() -> f64 {
    1.0
}

/// How to match a model id against a pricing entry.
#[derive(Debug, Clone)]
enum ModelMatcher {
    StartsWith(String),
}

/// Embedded pricing snapshot covering common models.
const PRICING_DATA: &str = include_str!("pricing_data.json");

/// Default pricing for unknown models ($10 input / $30 output per 1M tokens).
pub const DEFAULT_INPUT_PER_MILLION: f64 = 10.0;
pub const DEFAULT_OUTPUT_PER_MILLION: f64 = 30.0;

/// Maps model ids to per-million pricing. Config overrides are consulted
/// before the embedded snapshot; unknown models fall back to the declared
/// default.
pub struct PricingRegistry {
    lookup: Vec<(ModelMatcher, ModelPricing)>,
}

impl PricingRegistry {
    pub fn new(overrides: &HashMap<String, ModelPricing>) -> Self {
        let mut lookup = Vec::new();

        // Config overrides take priority
        for (pattern, pricing) in overrides {
            lookup.push((ModelMatcher::StartsWith(pattern.clone()), pricing.clone()));
        }

        if let Ok(entries) = serde_json::from_str::<Vec<serde_json::Value>>(PRICING_DATA) {
            for entry in entries {
                let pattern = entry["pattern"].as_str().unwrap_or_default();
                if pattern.is_empty() {
                    continue;
                }
                lookup.push((
                    ModelMatcher::StartsWith(pattern.to_string()),
                    ModelPricing {
                        input_per_million: entry["input_mtok"]
                            .as_f64()
                            .unwrap_or(DEFAULT_INPUT_PER_MILLION),
                        output_per_million: entry["output_mtok"]
                            .as_f64()
                            .unwrap_or(DEFAULT_OUTPUT_PER_MILLION),
                        cached_discount: entry["cached_discount"].as_f64().unwrap_or(1.0),
                    },
                ));
            }
        } else {
            warn!("failed to parse embedded pricing data");
        }

        Self { lookup }
    }

    /// Look up pricing for a model id.
    pub fn resolve(&self, model: &str) -> ModelPricing {
        for (matcher, pricing) in &self.lookup {
            match matcher {
                ModelMatcher::StartsWith(prefix) => {
                    if model.starts_with(prefix.as_str()) {
                        return pricing.clone();
                    }
                }
            }
        }
        ModelPricing {
            input_per_million: DEFAULT_INPUT_PER_MILLION,
            output_per_million: DEFAULT_OUTPUT_PER_MILLION,
            cached_discount: 1.0,
        }
    }

    /// Whether the model matched a known entry (overrides or snapshot).
    pub fn is_known(&self, model: &str) -> bool {
        self.lookup.iter().any(|(matcher, _)| match matcher {
            ModelMatcher::StartsWith(prefix) => model.starts_with(prefix.as_str()),
        })
    }
}

impl Default for PricingRegistry {
    fn default() -> Self {
        Self::new(&HashMap::new())
    }
}
