//! Cost ledger: actual and counterfactual cost per request, with savings
//! attributed to the module that produced them.

use crate::bus::events::LedgerEntryEvent;
use crate::bus::{EventBus, ShieldEvent};
use crate::config::LedgerConfig;
use crate::pricing::CostEstimator;
use crate::store::{KvStore, unversioned, versioned};
use crate::utils::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;

const KV_NAMESPACE: &str = "tokenshield-ledger";
const KV_ENTRIES_KEY: &str = "entries";

/// Dollar savings attributed per module. The components always sum to the
/// entry's `total_saved` (they are derived from the same estimates).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SavingsBreakdown {
    pub guard: f64,
    pub cache: f64,
    pub context: f64,
    pub router: f64,
    pub prefix: f64,
}

impl SavingsBreakdown {
    pub fn sum(&self) -> f64 {
        self.guard + self.cache + self.context + self.router + self.prefix
    }

    fn add(&mut self, other: &SavingsBreakdown) {
        self.guard += other.guard;
        self.cache += other.cache;
        self.context += other.context;
        self.router += other.router;
        self.prefix += other.prefix;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub timestamp: u64,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub cached_tokens: u32,
    pub actual_cost: f64,
    pub cost_without_shield: f64,
    pub total_saved: f64,
    pub savings: SavingsBreakdown,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_input_tokens: Option<u32>,
    #[serde(default)]
    pub cache_hit: bool,
}

/// Inputs for recording one completed provider call.
#[derive(Debug, Clone, Default)]
pub struct CallRecord {
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: u32,
    /// Model originally requested, when the router downgraded it.
    pub original_model: Option<String>,
    /// Input size before context trimming.
    pub original_input_tokens: Option<u32>,
    pub feature: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelStats {
    pub calls: u64,
    pub tokens: u64,
    pub spent: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeatureStats {
    pub calls: u64,
    pub spent: f64,
    pub saved: f64,
}

#[derive(Debug, Clone, Default)]
pub struct LedgerSummary {
    pub total_calls: u64,
    pub total_spent: f64,
    pub total_saved: f64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    /// `total_saved / (total_spent + total_saved)`.
    pub savings_rate: f64,
    pub by_model: HashMap<String, ModelStats>,
    pub by_feature: HashMap<String, FeatureStats>,
    pub by_module: SavingsBreakdown,
}

/// Bounded in-memory ledger. Evicts oldest entries past `capacity`.
pub struct CostLedger {
    estimator: Arc<CostEstimator>,
    bus: Arc<EventBus>,
    kv: Option<Arc<dyn KvStore>>,
    capacity: usize,
    default_feature: Option<String>,
    entries: Mutex<VecDeque<LedgerEntry>>,
}

impl CostLedger {
    pub fn new(
        config: &LedgerConfig,
        estimator: Arc<CostEstimator>,
        bus: Arc<EventBus>,
        kv: Option<Arc<dyn KvStore>>,
    ) -> Self {
        Self {
            estimator,
            bus,
            kv,
            capacity: config.capacity,
            default_feature: config.feature.clone(),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a completed call. `actual_cost` comes from the estimator over
    /// real usage; `cost_without_shield` is the counterfactual request
    /// (original model if downgraded, original input if trimmed, no
    /// cached-token discount), decomposed stage by stage so the module
    /// savings sum to `total_saved` exactly.
    pub fn record(&self, call: CallRecord) -> LedgerEntry {
        let model = call.model.as_str();
        let original_model = call.original_model.as_deref().unwrap_or(model);
        let original_input = call.original_input_tokens.unwrap_or(call.input_tokens);

        let actual = self
            .estimator
            .estimate(model, call.input_tokens, call.output_tokens, call.cached_tokens)
            .total;
        let counterfactual = self
            .estimator
            .estimate_total(original_model, original_input, call.output_tokens);

        // Stage decomposition along the transform chain
        let after_context = self
            .estimator
            .estimate_total(original_model, call.input_tokens, call.output_tokens);
        let after_router = self
            .estimator
            .estimate_total(model, call.input_tokens, call.output_tokens);

        let savings = SavingsBreakdown {
            guard: 0.0,
            cache: 0.0,
            context: counterfactual - after_context,
            router: after_context - after_router,
            prefix: after_router - actual,
        };

        let entry = LedgerEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            model: call.model,
            input_tokens: call.input_tokens,
            output_tokens: call.output_tokens,
            cached_tokens: call.cached_tokens,
            actual_cost: actual,
            cost_without_shield: counterfactual,
            total_saved: counterfactual - actual,
            savings,
            feature: call.feature.or_else(|| self.default_feature.clone()),
            original_model: call.original_model,
            original_input_tokens: call.original_input_tokens,
            cache_hit: false,
        };
        self.append(entry.clone());
        entry
    }

    /// Record a request the guard (or breaker/budget) blocked: the whole
    /// would-have-been cost is attributed to `savings.guard`.
    pub fn record_blocked(
        &self,
        model: &str,
        est_input_tokens: u32,
        est_output_tokens: u32,
        feature: Option<String>,
    ) -> LedgerEntry {
        let avoided = self
            .estimator
            .estimate_total(model, est_input_tokens, est_output_tokens);
        let entry = LedgerEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            model: model.to_string(),
            input_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
            actual_cost: 0.0,
            cost_without_shield: avoided,
            total_saved: avoided,
            savings: SavingsBreakdown {
                guard: avoided,
                ..SavingsBreakdown::default()
            },
            feature: feature.or_else(|| self.default_feature.clone()),
            original_model: None,
            original_input_tokens: None,
            cache_hit: false,
        };
        self.append(entry.clone());
        entry
    }

    /// Record a cache hit: the avoided call's cost is attributed to
    /// `savings.cache`.
    pub fn record_cache_hit(
        &self,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
        feature: Option<String>,
    ) -> LedgerEntry {
        let avoided = self
            .estimator
            .estimate_total(model, input_tokens, output_tokens);
        let entry = LedgerEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cached_tokens: 0,
            actual_cost: 0.0,
            cost_without_shield: avoided,
            total_saved: avoided,
            savings: SavingsBreakdown {
                cache: avoided,
                ..SavingsBreakdown::default()
            },
            feature: feature.or_else(|| self.default_feature.clone()),
            original_model: None,
            original_input_tokens: None,
            cache_hit: true,
        };
        self.append(entry.clone());
        entry
    }

    fn append(&self, entry: LedgerEntry) {
        let event = LedgerEntryEvent {
            entry_id: entry.id.clone(),
            model: entry.model.clone(),
            actual_cost: entry.actual_cost,
            total_saved: entry.total_saved,
            cache_hit: entry.cache_hit,
        };
        {
            let mut entries = self.lock();
            entries.push_back(entry);
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }
        self.bus.emit(&ShieldEvent::LedgerEntry(event));
    }

    pub fn summary(&self) -> LedgerSummary {
        let entries = self.lock();
        let mut summary = LedgerSummary::default();
        for entry in entries.iter() {
            summary.total_calls += 1;
            summary.total_spent += entry.actual_cost;
            summary.total_saved += entry.total_saved;
            if entry.cache_hit {
                summary.cache_hits += 1;
            }
            summary.by_module.add(&entry.savings);

            let model = summary.by_model.entry(entry.model.clone()).or_default();
            model.calls += 1;
            model.tokens += u64::from(entry.input_tokens) + u64::from(entry.output_tokens);
            model.spent += entry.actual_cost;

            let tag = entry.feature.clone().unwrap_or_else(|| "_untagged".into());
            let feature = summary.by_feature.entry(tag).or_default();
            feature.calls += 1;
            feature.spent += entry.actual_cost;
            feature.saved += entry.total_saved;
        }
        if summary.total_calls > 0 {
            summary.cache_hit_rate = summary.cache_hits as f64 / summary.total_calls as f64;
        }
        let denominator = summary.total_spent + summary.total_saved;
        if denominator > 0.0 {
            summary.savings_rate = summary.total_saved / denominator;
        }
        summary
    }

    /// Entries with `timestamp >= now − since_ms`. Negative `since_ms`
    /// yields an empty slice.
    pub fn entries_since(&self, since_ms: i64) -> Vec<LedgerEntry> {
        if since_ms < 0 {
            return Vec::new();
        }
        let cutoff = now_millis().saturating_sub(since_ms as u64);
        self.lock()
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn export_json(&self) -> String {
        let entries = self.lock();
        serde_json::to_string_pretty(&entries.iter().collect::<Vec<_>>())
            .unwrap_or_else(|_| "[]".into())
    }

    pub fn export_csv(&self) -> String {
        const HEADER: &str = "id,timestamp,model,input_tokens,output_tokens,cached_tokens,\
                              actual_cost,cost_without_shield,total_saved,savings_guard,\
                              savings_cache,savings_context,savings_router,savings_prefix,\
                              feature,original_model,original_input_tokens,cache_hit";
        let entries = self.lock();
        let mut out = String::from(HEADER);
        out.push('\n');
        for e in entries.iter() {
            let fields = [
                e.id.clone(),
                e.timestamp.to_string(),
                e.model.clone(),
                e.input_tokens.to_string(),
                e.output_tokens.to_string(),
                e.cached_tokens.to_string(),
                format!("{:.9}", e.actual_cost),
                format!("{:.9}", e.cost_without_shield),
                format!("{:.9}", e.total_saved),
                format!("{:.9}", e.savings.guard),
                format!("{:.9}", e.savings.cache),
                format!("{:.9}", e.savings.context),
                format!("{:.9}", e.savings.router),
                format!("{:.9}", e.savings.prefix),
                e.feature.clone().unwrap_or_default(),
                e.original_model.clone().unwrap_or_default(),
                e.original_input_tokens.map(|t| t.to_string()).unwrap_or_default(),
                e.cache_hit.to_string(),
            ];
            let row: Vec<String> = fields.iter().map(|f| csv_quote(f)).collect();
            out.push_str(&row.join(","));
            out.push('\n');
        }
        out
    }

    /// Replay previously exported entries (e.g. from another process) into
    /// the buffer, keeping their derived fields as recorded.
    pub fn import_entries(&self, imported: Vec<LedgerEntry>) {
        let mut entries = self.lock();
        for entry in imported {
            entries.push_back(entry);
        }
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub async fn hydrate(&self) -> usize {
        let Some(kv) = &self.kv else { return 0 };
        let value = match kv.get(KV_NAMESPACE, KV_ENTRIES_KEY).await {
            Ok(Some(value)) => value,
            Ok(None) => return 0,
            Err(e) => {
                warn!("ledger hydrate failed: {}", e);
                return 0;
            }
        };
        let Some(payload) = unversioned(value) else {
            return 0;
        };
        match serde_json::from_value::<Vec<LedgerEntry>>(payload) {
            Ok(loaded) => {
                let count = loaded.len();
                self.import_entries(loaded);
                count
            }
            Err(e) => {
                warn!("ledger hydrate skipped corrupted entries: {}", e);
                0
            }
        }
    }

    pub async fn persist(&self) {
        let Some(kv) = &self.kv else { return };
        let entries: Vec<LedgerEntry> = self.entries();
        let payload = versioned(serde_json::to_value(entries).unwrap_or_default());
        if let Err(e) = kv.set(KV_NAMESPACE, KV_ENTRIES_KEY, payload).await {
            warn!("ledger persist failed: {}", e);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<LedgerEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Quote a CSV field when it contains a comma, quote or newline.
fn csv_quote(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::PricingRegistry;

    fn ledger() -> CostLedger {
        ledger_with(LedgerConfig::default())
    }

    fn ledger_with(config: LedgerConfig) -> CostLedger {
        CostLedger::new(
            &config,
            Arc::new(CostEstimator::new(Arc::new(PricingRegistry::default()))),
            Arc::new(EventBus::new()),
            None,
        )
    }

    #[test]
    fn plain_call_has_no_savings() {
        let l = ledger();
        let entry = l.record(CallRecord {
            model: "gpt-4o".into(),
            input_tokens: 1000,
            output_tokens: 500,
            ..CallRecord::default()
        });
        assert!(entry.total_saved.abs() < 1e-12);
        assert!((entry.cost_without_shield - entry.actual_cost).abs() < 1e-12);
    }

    #[test]
    fn module_savings_sum_to_total() {
        let l = ledger();
        let entry = l.record(CallRecord {
            model: "gpt-4o-mini".into(),
            input_tokens: 450,
            output_tokens: 200,
            cached_tokens: 100,
            original_model: Some("gpt-4o".into()),
            original_input_tokens: Some(900),
            ..CallRecord::default()
        });
        assert!(entry.savings.context > 0.0);
        assert!(entry.savings.router > 0.0);
        assert!(entry.savings.prefix > 0.0);
        assert!((entry.savings.sum() - entry.total_saved).abs() < 1e-12);
        assert!((entry.total_saved - (entry.cost_without_shield - entry.actual_cost)).abs() < 1e-12);
    }

    #[test]
    fn blocked_attributes_to_guard() {
        let l = ledger();
        let entry = l.record_blocked("gpt-4o", 1000, 500, None);
        assert_eq!(entry.input_tokens, 0);
        assert_eq!(entry.output_tokens, 0);
        assert_eq!(entry.actual_cost, 0.0);
        assert!(entry.savings.guard > 0.0);
        assert!((entry.savings.guard - entry.total_saved).abs() < 1e-12);
    }

    #[test]
    fn cache_hit_attributes_to_cache() {
        let l = ledger();
        let entry = l.record_cache_hit("gpt-4o-mini", 50, 20, None);
        assert!(entry.cache_hit);
        assert!(entry.savings.cache > 0.0);
        assert_eq!(entry.actual_cost, 0.0);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let l = ledger_with(LedgerConfig {
            capacity: 3,
            ..LedgerConfig::default()
        });
        for i in 0..5 {
            l.record(CallRecord {
                model: format!("model-{}", i),
                input_tokens: 10,
                output_tokens: 10,
                ..CallRecord::default()
            });
        }
        let entries = l.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].model, "model-2");
    }

    #[test]
    fn summary_aggregates() {
        let l = ledger();
        l.record(CallRecord {
            model: "gpt-4o".into(),
            input_tokens: 1000,
            output_tokens: 100,
            feature: Some("chat".into()),
            ..CallRecord::default()
        });
        l.record_cache_hit("gpt-4o", 1000, 100, Some("chat".into()));
        l.record_blocked("gpt-4o", 500, 50, None);

        let s = l.summary();
        assert_eq!(s.total_calls, 3);
        assert_eq!(s.cache_hits, 1);
        assert!((s.cache_hit_rate - 1.0 / 3.0).abs() < 1e-12);
        assert!(s.savings_rate > 0.0 && s.savings_rate <= 1.0);
        assert_eq!(s.by_model["gpt-4o"].calls, 3);
        assert_eq!(s.by_feature["chat"].calls, 2);
        assert_eq!(s.by_feature["_untagged"].calls, 1);
        assert!(s.by_module.cache > 0.0);
        assert!(s.by_module.guard > 0.0);
    }

    #[test]
    fn export_json_roundtrips() {
        let l = ledger();
        l.record(CallRecord {
            model: "gpt-4o-mini".into(),
            input_tokens: 450,
            output_tokens: 200,
            original_model: Some("gpt-4o".into()),
            original_input_tokens: Some(900),
            ..CallRecord::default()
        });
        let json = l.export_json();
        let parsed: Vec<LedgerEntry> = serde_json::from_str(&json).unwrap();

        let replay = ledger();
        replay.import_entries(parsed);
        let original = l.entries();
        let replayed = replay.entries();
        assert_eq!(original.len(), replayed.len());
        for (a, b) in original.iter().zip(replayed.iter()) {
            assert!((a.actual_cost - b.actual_cost).abs() <= 1e-9);
            assert!((a.savings.sum() - b.savings.sum()).abs() <= 1e-9);
        }
    }

    #[test]
    fn export_csv_quotes_commas_and_newlines() {
        let l = ledger();
        l.record(CallRecord {
            model: "weird,model\nname".into(),
            input_tokens: 10,
            output_tokens: 10,
            feature: Some("tag \"quoted\"".into()),
            ..CallRecord::default()
        });
        let csv = l.export_csv();
        assert!(csv.contains("\"weird,model\nname\""));
        assert!(csv.contains("\"tag \"\"quoted\"\"\""));
        // Header plus one (quoted, multi-line) row
        assert!(csv.starts_with("id,timestamp,model"));
    }

    #[test]
    fn entries_since_filters_by_age() {
        let l = ledger();
        l.record(CallRecord {
            model: "gpt-4o".into(),
            input_tokens: 10,
            output_tokens: 10,
            ..CallRecord::default()
        });
        assert_eq!(l.entries_since(60_000).len(), 1);
        assert!(l.entries_since(-1).is_empty());
    }

    #[test]
    fn default_feature_tag_applied() {
        let l = ledger_with(LedgerConfig {
            feature: Some("search".into()),
            ..LedgerConfig::default()
        });
        let entry = l.record(CallRecord {
            model: "gpt-4o".into(),
            input_tokens: 10,
            output_tokens: 10,
            ..CallRecord::default()
        });
        assert_eq!(entry.feature.as_deref(), Some("search"));
    }
}
