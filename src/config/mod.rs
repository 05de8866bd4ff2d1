//! Configuration surface and fail-fast validation.

pub mod schema;
mod validate;

pub use schema::{
    BreakerAction, BreakerConfig, BreakerLimits, BudgetLimits, BudgetsConfig, CacheConfig,
    ContextConfig, ContextStrategy, EncodingStrategy, GuardConfig, LedgerConfig, ModelCandidate,
    ModulesConfig, PrefixConfig, RouterConfig, ShieldConfig, UserBudgetConfig,
};

use crate::bus::events::{BreakerAlertEvent, BudgetAlertEvent, RequestBlockedEvent};
use std::sync::Arc;

/// Stage-level report emitted in dry-run mode.
#[derive(Debug, Clone)]
pub struct DryRunReport {
    /// Stage label: "guard", "cache", "context", "router", "prefix",
    /// "breaker" or "user-budget".
    pub stage: &'static str,
    pub description: String,
}

/// Post-call usage summary handed to `on_usage`.
#[derive(Debug, Clone)]
pub struct UsageReport {
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: u32,
    pub actual_cost: f64,
    pub total_saved: f64,
    pub cache_hit: bool,
}

pub type DryRunHook = Arc<dyn Fn(&DryRunReport) + Send + Sync>;
pub type UsageHook = Arc<dyn Fn(&UsageReport) + Send + Sync>;
pub type BlockedHook = Arc<dyn Fn(&RequestBlockedEvent) + Send + Sync>;
pub type BreakerAlertHook = Arc<dyn Fn(&BreakerAlertEvent) + Send + Sync>;
pub type BudgetAlertHook = Arc<dyn Fn(&BudgetAlertEvent) + Send + Sync>;

/// Caller callbacks. Kept apart from `ShieldConfig` because closures do not
/// serialize.
#[derive(Clone, Default)]
pub struct ShieldHooks {
    pub on_dry_run: Option<DryRunHook>,
    pub on_usage: Option<UsageHook>,
    pub on_blocked: Option<BlockedHook>,
    pub on_breaker_warning: Option<BreakerAlertHook>,
    pub on_breaker_tripped: Option<BreakerAlertHook>,
    pub on_budget_warning: Option<BudgetAlertHook>,
    pub on_budget_exceeded: Option<BudgetAlertHook>,
}

impl std::fmt::Debug for ShieldHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShieldHooks")
            .field("on_dry_run", &self.on_dry_run.is_some())
            .field("on_usage", &self.on_usage.is_some())
            .field("on_blocked", &self.on_blocked.is_some())
            .field("on_breaker_warning", &self.on_breaker_warning.is_some())
            .field("on_breaker_tripped", &self.on_breaker_tripped.is_some())
            .field("on_budget_warning", &self.on_budget_warning.is_some())
            .field("on_budget_exceeded", &self.on_budget_exceeded.is_some())
            .finish()
    }
}
