use crate::bus::events::{BudgetAlertEvent, BudgetSpendEvent};
use crate::bus::{EventBus, ShieldEvent};
use crate::config::{BudgetAlertHook, BudgetLimits, BudgetsConfig};
use crate::pricing::CostEstimator;
use crate::store::{KvStore, unversioned, versioned};
use crate::utils::now_millis;
use chrono::{DateTime, Datelike, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Oldest-first cap on distinct users with live reservations.
pub const MAX_TRACKED_USERS: usize = 10_000;
/// Hard cap on retained spend records.
pub const MAX_BUDGET_RECORDS: usize = 10_000;
/// Spend records older than this are dropped.
const RETENTION_DAYS: i64 = 30;
/// Status snapshots are reused within this time bucket.
const SNAPSHOT_BUCKET_MS: u64 = 10_000;
/// Snapshot cache bound; overflow clears the map.
const MAX_SNAPSHOT_USERS: usize = 4096;

const KV_NAMESPACE: &str = "tokenshield-budget";
const KV_RECORDS_KEY: &str = "records";

/// One settled spend. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendRecord {
    pub timestamp: u64,
    pub cost: f64,
    pub model: String,
    pub user_id: String,
}

/// Spend and headroom in one window. `limit` is `None` when the window is
/// unenforced (no limits resolved, or a configured limit of 0).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStatus {
    pub spend: f64,
    pub limit: Option<f64>,
    pub remaining: Option<f64>,
    pub percent_used: Option<f64>,
}

impl WindowStatus {
    fn build(spend: f64, limit: f64) -> Self {
        if limit <= 0.0 {
            Self {
                spend,
                limit: None,
                remaining: None,
                percent_used: None,
            }
        } else {
            Self {
                spend,
                limit: Some(limit),
                remaining: Some((limit - spend).max(0.0)),
                percent_used: Some(spend / limit * 100.0),
            }
        }
    }
}

/// Derived view of one user's budget position.
#[derive(Debug, Clone, PartialEq)]
pub struct UserBudgetStatus {
    pub user_id: String,
    pub daily: WindowStatus,
    pub monthly: WindowStatus,
    pub inflight: f64,
    pub is_over_budget: bool,
    pub tier: Option<String>,
}

/// Outcome of a budget check.
pub enum BudgetDecision {
    /// Allowed; holds the reservation to release or settle. `None` when the
    /// user has no limits configured (nothing was reserved).
    Allowed {
        reservation: Option<ReservationGuard>,
        estimated_cost: f64,
    },
    Blocked {
        limit_type: &'static str,
        detail: String,
    },
}

/// RAII inflight reservation. Dropping an unsettled guard releases the
/// reserved estimate, so every exit path — block, provider error, stream
/// abort — releases exactly once.
pub struct ReservationGuard {
    shared: Arc<BudgetShared>,
    user_id: String,
    amount: f64,
    armed: bool,
}

impl ReservationGuard {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Settle the reservation against the actual cost: releases inflight by
    /// the reserved estimate (never the actual — estimation error must not
    /// drift the inflight balance) and appends the spend record.
    pub fn settle(mut self, actual_cost: f64, model: &str) {
        self.armed = false;
        self.shared
            .record_spend(&self.user_id, actual_cost, model, self.amount);
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_inflight(&self.user_id, self.amount);
        }
    }
}

struct CachedSnapshot {
    version: u64,
    bucket: u64,
    snapshot: Arc<UserBudgetStatus>,
}

struct BudgetInner {
    records: VecDeque<SpendRecord>,
    inflight: IndexMap<String, f64>,
    /// "{user}:{window}[:exceeded]" → fire timestamp.
    alerts_fired: HashMap<String, u64>,
    snapshots: HashMap<String, CachedSnapshot>,
    version: u64,
}

/// Mutable budget state plus the event bus, shared with live reservation
/// guards so a guard can release or settle without a handle to the manager.
struct BudgetShared {
    bus: Arc<EventBus>,
    inner: Mutex<BudgetInner>,
}

impl BudgetShared {
    /// Settle a request: release inflight by the original estimate (never
    /// the actual cost — the critical invariant keeping phantom inflight
    /// from drifting) and append the spend record. A zero actual cost
    /// releases and notifies without appending.
    fn record_spend(&self, user_id: &str, actual_cost: f64, model: &str, estimated_release: f64) {
        let now = now_millis();
        {
            let mut inner = self.lock();
            Self::release_locked(&mut inner, user_id, estimated_release);

            if actual_cost > 0.0 {
                inner.records.push_back(SpendRecord {
                    timestamp: now,
                    cost: actual_cost,
                    model: model.to_string(),
                    user_id: user_id.to_string(),
                });
                truncate_records(&mut inner.records, now);
            }
            inner.version += 1;
        }
        self.bus.emit(&ShieldEvent::BudgetSpend(BudgetSpendEvent {
            user_id: user_id.to_string(),
            cost: actual_cost,
            model: model.to_string(),
        }));
    }

    fn release_inflight(&self, user_id: &str, amount: f64) {
        let mut inner = self.lock();
        Self::release_locked(&mut inner, user_id, amount);
        inner.version += 1;
    }

    fn release_locked(inner: &mut BudgetInner, user_id: &str, amount: f64) {
        if let Some(value) = inner.inflight.get_mut(user_id) {
            *value = (*value - amount).max(0.0);
            if *value < 1e-12 {
                inner.inflight.shift_remove(user_id);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BudgetInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Per-user daily and monthly caps with in-flight reservations preventing
/// concurrent overspend.
pub struct UserBudgetManager {
    config: BudgetsConfig,
    estimator: Arc<CostEstimator>,
    kv: Option<Arc<dyn KvStore>>,
    on_warning: Option<BudgetAlertHook>,
    on_exceeded: Option<BudgetAlertHook>,
    shared: Arc<BudgetShared>,
}

impl UserBudgetManager {
    pub fn new(
        config: BudgetsConfig,
        estimator: Arc<CostEstimator>,
        bus: Arc<EventBus>,
        kv: Option<Arc<dyn KvStore>>,
        on_warning: Option<BudgetAlertHook>,
        on_exceeded: Option<BudgetAlertHook>,
    ) -> Self {
        Self {
            config,
            estimator,
            kv,
            on_warning,
            on_exceeded,
            shared: Arc::new(BudgetShared {
                bus,
                inner: Mutex::new(BudgetInner {
                    records: VecDeque::new(),
                    inflight: IndexMap::new(),
                    alerts_fired: HashMap::new(),
                    snapshots: HashMap::new(),
                    version: 0,
                }),
            }),
        }
    }

    /// User-specific limits, else the default budget, else none.
    fn resolve_limits(&self, user_id: &str) -> Option<&BudgetLimits> {
        self.config
            .users
            .get(user_id)
            .or(self.config.default_budget.as_ref())
    }

    fn resolve_tier(&self, user_id: &str) -> Option<String> {
        self.resolve_limits(user_id).and_then(|l| l.tier.clone())
    }

    /// Model mapped to the user's resolved tier, if any.
    pub fn model_for_user(&self, user_id: &str) -> Option<String> {
        let tier = self.resolve_tier(user_id)?;
        self.config.tier_models.get(&tier).cloned()
    }

    fn same_window(window: &'static str, a_ms: u64, b_ms: u64) -> bool {
        let a = datetime(a_ms);
        let b = datetime(b_ms);
        match window {
            "daily" => a.date_naive() == b.date_naive(),
            _ => a.year() == b.year() && a.month() == b.month(),
        }
    }

    fn window_spend(records: &VecDeque<SpendRecord>, user_id: &str, window: &'static str, now: u64) -> f64 {
        records
            .iter()
            .filter(|r| r.user_id == user_id && Self::same_window(window, r.timestamp, now))
            .map(|r| r.cost)
            .sum()
    }

    /// Gate a request and reserve its estimated cost on success.
    pub fn check(
        &self,
        user_id: &str,
        model: &str,
        est_input_tokens: u32,
        est_output_tokens: u32,
    ) -> BudgetDecision {
        self.check_at(user_id, model, est_input_tokens, est_output_tokens, now_millis())
    }

    fn check_at(
        &self,
        user_id: &str,
        model: &str,
        est_input_tokens: u32,
        est_output_tokens: u32,
        now: u64,
    ) -> BudgetDecision {
        // Unknown models estimate to zero rather than the punitive default
        let estimated_cost = if self.estimator.registry().is_known(model) {
            self.estimator
                .estimate_total(model, est_input_tokens, est_output_tokens)
        } else {
            0.0
        };

        let Some(limits) = self.resolve_limits(user_id) else {
            return BudgetDecision::Allowed {
                reservation: None,
                estimated_cost,
            };
        };
        let limits = limits.clone();

        let mut alerts: Vec<(bool, BudgetAlertEvent)> = Vec::new();
        let mut blocked: Option<(&'static str, String)> = None;
        {
            let mut inner = self.shared.lock();
            let inner = &mut *inner;
            let inflight = inner.inflight.get(user_id).copied().unwrap_or(0.0);
            for (window, limit) in [("daily", limits.daily), ("monthly", limits.monthly)] {
                if limit <= 0.0 {
                    continue; // 0 means no limit in that window
                }
                let spend = Self::window_spend(&inner.records, user_id, window, now);
                let projected = spend + estimated_cost + inflight;

                if projected >= limit {
                    let key = format!("{}:{}:exceeded", user_id, window);
                    if Self::may_fire(&inner.alerts_fired, &key, window, now) {
                        inner.alerts_fired.insert(key, now);
                        alerts.push((
                            true,
                            BudgetAlertEvent {
                                user_id: user_id.to_string(),
                                limit_type: window,
                                limit,
                                current_spend: spend,
                            },
                        ));
                    }
                    if blocked.is_none() {
                        blocked = Some((
                            window,
                            format!(
                                "{} budget for {} reached: ${:.4} spent (+${:.4} projected) of ${:.2}",
                                window, user_id, spend, estimated_cost + inflight, limit
                            ),
                        ));
                    }
                } else if projected >= 0.8 * limit {
                    let key = format!("{}:{}", user_id, window);
                    if Self::may_fire(&inner.alerts_fired, &key, window, now) {
                        inner.alerts_fired.insert(key, now);
                        alerts.push((
                            false,
                            BudgetAlertEvent {
                                user_id: user_id.to_string(),
                                limit_type: window,
                                limit,
                                current_spend: spend,
                            },
                        ));
                    }
                }
            }

            if blocked.is_none() {
                // Reserve under the same lock so concurrent checks see it
                if !inner.inflight.contains_key(user_id)
                    && inner.inflight.len() >= MAX_TRACKED_USERS
                {
                    // FIFO-evict the oldest tracked user
                    if let Some((evicted, amount)) = inner.inflight.shift_remove_index(0) {
                        debug!(
                            "inflight map full, dropping oldest user {} (${:.4})",
                            evicted, amount
                        );
                    }
                }
                *inner
                    .inflight
                    .entry(user_id.to_string())
                    .or_insert(0.0) += estimated_cost;
                inner.version += 1;
            }
        }

        for (exceeded, alert) in alerts {
            if exceeded {
                self.shared.bus.emit(&ShieldEvent::BudgetExceeded(alert.clone()));
                if let Some(hook) = &self.on_exceeded {
                    hook(&alert);
                }
            } else {
                self.shared.bus.emit(&ShieldEvent::BudgetWarning(alert.clone()));
                if let Some(hook) = &self.on_warning {
                    hook(&alert);
                }
            }
        }

        match blocked {
            Some((limit_type, detail)) => BudgetDecision::Blocked { limit_type, detail },
            None => BudgetDecision::Allowed {
                reservation: Some(ReservationGuard {
                    shared: Arc::clone(&self.shared),
                    user_id: user_id.to_string(),
                    amount: estimated_cost,
                    armed: true,
                }),
                estimated_cost,
            },
        }
    }

    fn may_fire(fired: &HashMap<String, u64>, key: &str, window: &'static str, now: u64) -> bool {
        match fired.get(key) {
            None => true,
            Some(&at) => !Self::same_window(window, at, now),
        }
    }

    /// Settle a request without a live guard (see `ReservationGuard::settle`
    /// for the reservation path). Releases inflight by `estimated_release`
    /// and appends the spend record unless `actual_cost` is zero.
    pub fn record_spend(&self, user_id: &str, actual_cost: f64, model: &str, estimated_release: f64) {
        self.shared
            .record_spend(user_id, actual_cost, model, estimated_release);
    }

    /// Release a reservation for a request that will never settle
    /// (failure or cancellation paths).
    pub fn release_inflight(&self, user_id: &str, amount: f64) {
        self.shared.release_inflight(user_id, amount);
    }

    /// Snapshot of one user's budget position. Cached by `(version, 10s
    /// bucket)`; when the underlying values are unchanged the same `Arc` is
    /// returned, so reactive consumers can rely on pointer identity.
    pub fn status(&self, user_id: &str) -> Arc<UserBudgetStatus> {
        self.status_at(user_id, now_millis())
    }

    fn status_at(&self, user_id: &str, now: u64) -> Arc<UserBudgetStatus> {
        let bucket = now / SNAPSHOT_BUCKET_MS;
        let mut inner = self.shared.lock();
        let version = inner.version;

        if let Some(cached) = inner.snapshots.get(user_id)
            && cached.version == version
            && cached.bucket == bucket
        {
            return Arc::clone(&cached.snapshot);
        }

        let limits = self.resolve_limits(user_id).cloned().unwrap_or_default();
        let daily = WindowStatus::build(
            Self::window_spend(&inner.records, user_id, "daily", now),
            limits.daily,
        );
        let monthly = WindowStatus::build(
            Self::window_spend(&inner.records, user_id, "monthly", now),
            limits.monthly,
        );
        let fresh = UserBudgetStatus {
            user_id: user_id.to_string(),
            daily,
            monthly,
            inflight: inner.inflight.get(user_id).copied().unwrap_or(0.0),
            is_over_budget: [daily, monthly]
                .iter()
                .any(|w| w.limit.is_some_and(|limit| w.spend >= limit)),
            tier: self.resolve_tier(user_id),
        };

        // Reference stability: keep the old Arc when nothing changed
        let snapshot = match inner.snapshots.get(user_id) {
            Some(cached) if *cached.snapshot == fresh => Arc::clone(&cached.snapshot),
            _ => Arc::new(fresh),
        };

        if inner.snapshots.len() >= MAX_SNAPSHOT_USERS
            && !inner.snapshots.contains_key(user_id)
        {
            inner.snapshots.clear();
        }
        inner.snapshots.insert(
            user_id.to_string(),
            CachedSnapshot {
                version,
                bucket,
                snapshot: Arc::clone(&snapshot),
            },
        );
        snapshot
    }

    /// Merge persisted records with in-memory state, deduplicating on
    /// `(user, timestamp, cost, model)` and dropping everything outside the
    /// retention window. Returns the number of records merged in.
    pub async fn hydrate(&self) -> usize {
        let Some(kv) = &self.kv else { return 0 };
        let value = match kv.get(KV_NAMESPACE, KV_RECORDS_KEY).await {
            Ok(Some(value)) => value,
            Ok(None) => return 0,
            Err(e) => {
                warn!("budget hydrate failed: {}", e);
                return 0;
            }
        };
        let Some(payload) = unversioned(value) else {
            return 0;
        };
        let persisted: Vec<SpendRecord> = match serde_json::from_value(payload) {
            Ok(records) => records,
            Err(e) => {
                warn!("budget hydrate skipped corrupted records: {}", e);
                return 0;
            }
        };

        let now = now_millis();
        let mut inner = self.shared.lock();
        let mut seen: HashSet<(String, u64, u64, String)> = inner
            .records
            .iter()
            .map(|r| (r.user_id.clone(), r.timestamp, r.cost.to_bits(), r.model.clone()))
            .collect();
        let mut merged = 0;
        for record in persisted {
            let key = (
                record.user_id.clone(),
                record.timestamp,
                record.cost.to_bits(),
                record.model.clone(),
            );
            if seen.insert(key) {
                inner.records.push_back(record);
                merged += 1;
            }
        }
        inner
            .records
            .make_contiguous()
            .sort_by_key(|r| r.timestamp);
        truncate_records(&mut inner.records, now);
        inner.version += 1;
        merged
    }

    /// Best-effort persistence of the record log.
    pub async fn persist(&self) {
        let Some(kv) = &self.kv else { return };
        let records: Vec<SpendRecord> = {
            let inner = self.shared.lock();
            inner.records.iter().cloned().collect()
        };
        let payload = versioned(serde_json::to_value(records).unwrap_or_default());
        if let Err(e) = kv.set(KV_NAMESPACE, KV_RECORDS_KEY, payload).await {
            warn!("budget persist failed: {}", e);
        }
    }

}

/// Drop records outside the retention window, then enforce the hard cap.
fn truncate_records(records: &mut VecDeque<SpendRecord>, now: u64) {
    let cutoff = now.saturating_sub((RETENTION_DAYS as u64) * 24 * 60 * 60 * 1000);
    while records.front().is_some_and(|r| r.timestamp < cutoff) {
        records.pop_front();
    }
    while records.len() > MAX_BUDGET_RECORDS {
        records.pop_front();
    }
}

fn datetime(ms: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(Utc::now)
}
