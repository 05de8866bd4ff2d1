use crate::errors::BlockReason;

/// Discriminant for subscribing to one event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CacheHit,
    CacheMiss,
    RequestBlocked,
    RouterDowngraded,
    ContextTrimmed,
    PrefixOptimized,
    LedgerEntry,
    BreakerWarning,
    BreakerTripped,
    BudgetWarning,
    BudgetExceeded,
    BudgetSpend,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CacheHit => "cache:hit",
            Self::CacheMiss => "cache:miss",
            Self::RequestBlocked => "request:blocked",
            Self::RouterDowngraded => "router:downgraded",
            Self::ContextTrimmed => "context:trimmed",
            Self::PrefixOptimized => "prefix:optimized",
            Self::LedgerEntry => "ledger:entry",
            Self::BreakerWarning => "breaker:warning",
            Self::BreakerTripped => "breaker:tripped",
            Self::BudgetWarning => "userBudget:warning",
            Self::BudgetExceeded => "userBudget:exceeded",
            Self::BudgetSpend => "userBudget:spend",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheHitEvent {
    pub model: String,
    pub exact: bool,
    pub similarity: f64,
    pub saved_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct CacheMissEvent {
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct RequestBlockedEvent {
    pub reason: BlockReason,
    pub detail: String,
    pub user_id: Option<String>,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone)]
pub struct RouterDowngradedEvent {
    pub from_model: String,
    pub to_model: String,
    pub complexity_score: u32,
}

#[derive(Debug, Clone)]
pub struct ContextTrimmedEvent {
    pub evicted_count: usize,
    pub evicted_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct PrefixOptimizedEvent {
    pub moved_messages: usize,
    pub stable_prefix_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct LedgerEntryEvent {
    pub entry_id: String,
    pub model: String,
    pub actual_cost: f64,
    pub total_saved: f64,
    pub cache_hit: bool,
}

#[derive(Debug, Clone)]
pub struct BreakerAlertEvent {
    /// Window label: "session", "hour", "day" or "month".
    pub window: &'static str,
    pub limit: f64,
    pub current_spend: f64,
}

#[derive(Debug, Clone)]
pub struct BudgetAlertEvent {
    pub user_id: String,
    /// "daily" or "monthly".
    pub limit_type: &'static str,
    pub limit: f64,
    pub current_spend: f64,
}

#[derive(Debug, Clone)]
pub struct BudgetSpendEvent {
    pub user_id: String,
    pub cost: f64,
    pub model: String,
}

/// Every event a pipeline instance can emit, with its typed payload.
#[derive(Debug, Clone)]
pub enum ShieldEvent {
    CacheHit(CacheHitEvent),
    CacheMiss(CacheMissEvent),
    RequestBlocked(RequestBlockedEvent),
    RouterDowngraded(RouterDowngradedEvent),
    ContextTrimmed(ContextTrimmedEvent),
    PrefixOptimized(PrefixOptimizedEvent),
    LedgerEntry(LedgerEntryEvent),
    BreakerWarning(BreakerAlertEvent),
    BreakerTripped(BreakerAlertEvent),
    BudgetWarning(BudgetAlertEvent),
    BudgetExceeded(BudgetAlertEvent),
    BudgetSpend(BudgetSpendEvent),
}

impl ShieldEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::CacheHit(_) => EventKind::CacheHit,
            Self::CacheMiss(_) => EventKind::CacheMiss,
            Self::RequestBlocked(_) => EventKind::RequestBlocked,
            Self::RouterDowngraded(_) => EventKind::RouterDowngraded,
            Self::ContextTrimmed(_) => EventKind::ContextTrimmed,
            Self::PrefixOptimized(_) => EventKind::PrefixOptimized,
            Self::LedgerEntry(_) => EventKind::LedgerEntry,
            Self::BreakerWarning(_) => EventKind::BreakerWarning,
            Self::BreakerTripped(_) => EventKind::BreakerTripped,
            Self::BudgetWarning(_) => EventKind::BudgetWarning,
            Self::BudgetExceeded(_) => EventKind::BudgetExceeded,
            Self::BudgetSpend(_) => EventKind::BudgetSpend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels() {
        assert_eq!(EventKind::CacheHit.as_str(), "cache:hit");
        assert_eq!(EventKind::BudgetExceeded.as_str(), "userBudget:exceeded");
        assert_eq!(EventKind::LedgerEntry.as_str(), "ledger:entry");
    }

    #[test]
    fn event_reports_its_kind() {
        let event = ShieldEvent::CacheMiss(CacheMissEvent {
            model: "gpt-4o".into(),
        });
        assert_eq!(event.kind(), EventKind::CacheMiss);
    }
}
