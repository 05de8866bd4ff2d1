use crate::config::schema::ShieldConfig;
use crate::errors::ShieldError;

impl ShieldConfig {
    /// Validate every recognized option. Called at pipeline construction so a
    /// typo fails fast instead of surfacing as runtime misbehaviour.
    pub fn validate(&self) -> Result<(), ShieldError> {
        if self.modules.cache {
            if self.cache.max_entries == 0 {
                return Err(ShieldError::Config("cache.max_entries must be > 0".into()));
            }
            let t = self.cache.similarity_threshold;
            if !(t > 0.0 && t <= 1.0) {
                return Err(ShieldError::Config(format!(
                    "cache.similarity_threshold must be in (0, 1], got {}",
                    t
                )));
            }
            if self.cache.store_name.is_empty() {
                return Err(ShieldError::Config("cache.store_name must not be empty".into()));
            }
        }

        if self.modules.guard {
            if self.guard.max_requests_per_minute == 0 {
                return Err(ShieldError::Config(
                    "guard.max_requests_per_minute must be > 0".into(),
                ));
            }
            if self.guard.max_cost_per_hour < 0.0 {
                return Err(ShieldError::Config(
                    "guard.max_cost_per_hour must not be negative".into(),
                ));
            }
        }

        if self.modules.context {
            let budget = self.context.max_context_tokens;
            let reserved = self.context.reserved_for_output + self.context.tool_token_overhead;
            if budget == 0 {
                return Err(ShieldError::Config(
                    "context.max_context_tokens must be > 0".into(),
                ));
            }
            if reserved >= budget {
                return Err(ShieldError::Config(format!(
                    "context.reserved_for_output + tool_token_overhead ({}) must be below max_context_tokens ({})",
                    reserved, budget
                )));
            }
        }

        if self.modules.router {
            for candidate in &self.router.candidates {
                if candidate.model_id.is_empty() {
                    return Err(ShieldError::Config(
                        "router.candidates entries must name a model_id".into(),
                    ));
                }
            }
        }

        for (name, limit) in [
            ("per_session", self.breaker.limits.per_session),
            ("per_hour", self.breaker.limits.per_hour),
            ("per_day", self.breaker.limits.per_day),
            ("per_month", self.breaker.limits.per_month),
        ] {
            if let Some(value) = limit
                && value < 0.0
            {
                return Err(ShieldError::Config(format!(
                    "breaker.limits.{} must not be negative, got {}",
                    name, value
                )));
            }
        }

        let budgets = &self.user_budget.budgets;
        for (user, limits) in budgets
            .users
            .iter()
            .map(|(u, l)| (u.as_str(), l))
            .chain(budgets.default_budget.iter().map(|l| ("default", l)))
        {
            if limits.daily < 0.0 || limits.monthly < 0.0 {
                return Err(ShieldError::Config(format!(
                    "user_budget limits for {} must not be negative",
                    user
                )));
            }
        }
        for (tier, model) in &budgets.tier_models {
            if model.is_empty() {
                return Err(ShieldError::Config(format!(
                    "user_budget.tier_models[{}] must name a model",
                    tier
                )));
            }
        }

        if self.modules.ledger && self.ledger.capacity == 0 {
            return Err(ShieldError::Config("ledger.capacity must be > 0".into()));
        }

        for (pattern, pricing) in &self.pricing_overrides {
            if pricing.input_per_million < 0.0
                || pricing.output_per_million < 0.0
                || pricing.cached_discount < 0.0
            {
                return Err(ShieldError::Config(format!(
                    "pricing_overrides[{}] must not contain negative rates",
                    pattern
                )));
            }
        }

        Ok(())
    }
}
