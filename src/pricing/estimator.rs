use crate::pricing::registry::PricingRegistry;
use std::sync::Arc;

/// Dollar cost of one request, split by component.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostBreakdown {
    /// Cost of uncached input tokens.
    pub input_cost: f64,
    /// Cost of provider-cached input tokens at the discounted rate.
    pub cached_cost: f64,
    pub output_cost: f64,
    pub total: f64,
}

/// Pure cost function over the pricing registry.
///
/// `cached_tokens` is the portion of `input_tokens` the provider served from
/// its prompt cache; it is charged at `cached_discount × input rate`.
pub struct CostEstimator {
    registry: Arc<PricingRegistry>,
}

impl CostEstimator {
    pub fn new(registry: Arc<PricingRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PricingRegistry {
        &self.registry
    }

    pub fn estimate(
        &self,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
        cached_tokens: u32,
    ) -> CostBreakdown {
        let pricing = self.registry.resolve(model);
        let cached = cached_tokens.min(input_tokens);
        let uncached = input_tokens - cached;

        let input_cost = f64::from(uncached) / 1_000_000.0 * pricing.input_per_million;
        let cached_cost =
            f64::from(cached) / 1_000_000.0 * pricing.input_per_million * pricing.cached_discount;
        let output_cost = f64::from(output_tokens) / 1_000_000.0 * pricing.output_per_million;

        CostBreakdown {
            input_cost,
            cached_cost,
            output_cost,
            total: input_cost + cached_cost + output_cost,
        }
    }

    /// Total dollars for a request with no cached tokens.
    pub fn estimate_total(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        self.estimate(model, input_tokens, output_tokens, 0).total
    }
}
