//! Pre-flight request guard: rejects duplicate, over-rate, or over-cost
//! requests before they reach the expensive pipeline stages.

use crate::config::GuardConfig;
use crate::errors::BlockReason;
use crate::utils::{HOUR_MS, MINUTE_MS, now_millis};
use lru::LruCache;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Tracked fingerprints (normalized last user message). Oldest evicted.
const MAX_TRACKED_FINGERPRINTS: usize = 4096;
/// Arrival timestamps retained per fingerprint.
const FINGERPRINT_HISTORY: usize = 8;

/// Guard verdict; `Rejected` carries the matching pipeline block reason.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardVerdict {
    Allowed,
    Rejected { reason: BlockReason, detail: String },
}

impl GuardVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

struct GuardInner {
    fingerprints: LruCache<String, VecDeque<u64>>,
    request_times: VecDeque<u64>,
    hourly_costs: VecDeque<(u64, f64)>,
}

pub struct RequestGuard {
    config: GuardConfig,
    inner: Mutex<GuardInner>,
}

impl RequestGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(GuardInner {
                fingerprints: LruCache::new(
                    NonZeroUsize::new(MAX_TRACKED_FINGERPRINTS).expect("non-zero capacity"),
                ),
                request_times: VecDeque::new(),
                hourly_costs: VecDeque::new(),
            }),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Check a request and, when allowed, record its arrival.
    pub fn check(&self, fingerprint: &str, estimated_cost: f64) -> GuardVerdict {
        self.check_at(fingerprint, estimated_cost, now_millis())
    }

    fn check_at(&self, fingerprint: &str, estimated_cost: f64, now: u64) -> GuardVerdict {
        if fingerprint.chars().count() < self.config.min_input_length {
            return GuardVerdict::Rejected {
                reason: BlockReason::Guard,
                detail: format!(
                    "input shorter than the {}-character minimum",
                    self.config.min_input_length
                ),
            };
        }

        let mut inner = self.lock();
        let inner = &mut *inner;

        // Debounce: same fingerprint within the window
        if let Some(history) = inner.fingerprints.get(fingerprint)
            && let Some(&last) = history.back()
            && now.saturating_sub(last) < self.config.debounce_ms
        {
            return GuardVerdict::Rejected {
                reason: BlockReason::Guard,
                detail: format!(
                    "duplicate request within {}ms debounce window",
                    self.config.debounce_ms
                ),
            };
        }

        // Sliding minute rate
        let minute_cutoff = now.saturating_sub(MINUTE_MS);
        while inner.request_times.front().is_some_and(|&t| t < minute_cutoff) {
            inner.request_times.pop_front();
        }
        if inner.request_times.len() as u32 >= self.config.max_requests_per_minute {
            return GuardVerdict::Rejected {
                reason: BlockReason::RateLimit,
                detail: format!(
                    "{} requests in the last minute, limit {}",
                    inner.request_times.len(),
                    self.config.max_requests_per_minute
                ),
            };
        }

        // Hourly cost gate over observed spend plus this request's estimate
        let hour_cutoff = now.saturating_sub(HOUR_MS);
        while inner.hourly_costs.front().is_some_and(|&(t, _)| t < hour_cutoff) {
            inner.hourly_costs.pop_front();
        }
        let hour_spend: f64 = inner.hourly_costs.iter().map(|&(_, c)| c).sum();
        if hour_spend + estimated_cost > self.config.max_cost_per_hour {
            return GuardVerdict::Rejected {
                reason: BlockReason::CostGate,
                detail: format!(
                    "hourly cost gate: ${:.4} observed + ${:.4} estimated exceeds ${:.2}",
                    hour_spend, estimated_cost, self.config.max_cost_per_hour
                ),
            };
        }

        // Allowed: record arrival
        let history = inner
            .fingerprints
            .get_or_insert_mut(fingerprint.to_string(), VecDeque::new);
        history.push_back(now);
        while history.len() > FINGERPRINT_HISTORY {
            history.pop_front();
        }
        inner.request_times.push_back(now);

        GuardVerdict::Allowed
    }

    /// Record actual spend for the hourly cost gate.
    pub fn record_cost(&self, cost: f64) {
        self.record_cost_at(cost, now_millis());
    }

    fn record_cost_at(&self, cost: f64, now: u64) {
        if cost <= 0.0 {
            return;
        }
        let mut inner = self.lock();
        inner.hourly_costs.push_back((now, cost));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GuardInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard_with(config: GuardConfig) -> RequestGuard {
        RequestGuard::new(config)
    }

    fn default_guard() -> RequestGuard {
        guard_with(GuardConfig::default())
    }

    #[test]
    fn fresh_request_allowed() {
        let guard = default_guard();
        assert!(guard.check("what is rust", 0.01).is_allowed());
    }

    #[test]
    fn debounce_rejects_rapid_duplicate() {
        let guard = default_guard();
        assert!(guard.check_at("same prompt", 0.0, 1_000).is_allowed());
        let verdict = guard.check_at("same prompt", 0.0, 1_500);
        assert_eq!(
            verdict,
            GuardVerdict::Rejected {
                reason: BlockReason::Guard,
                detail: "duplicate request within 2000ms debounce window".into(),
            }
        );
        // A different fingerprint is unaffected
        assert!(guard.check_at("other prompt", 0.0, 1_500).is_allowed());
    }

    #[test]
    fn debounce_expires() {
        let guard = default_guard();
        assert!(guard.check_at("same prompt", 0.0, 1_000).is_allowed());
        assert!(guard.check_at("same prompt", 0.0, 3_500).is_allowed());
    }

    #[test]
    fn rate_limit_enforced_on_sliding_minute() {
        let config = GuardConfig {
            max_requests_per_minute: 2,
            debounce_ms: 0,
            ..GuardConfig::default()
        };
        let guard = guard_with(config);
        assert!(guard.check_at("p1", 0.0, 1_000).is_allowed());
        assert!(guard.check_at("p2", 0.0, 2_000).is_allowed());
        let verdict = guard.check_at("p3", 0.0, 3_000);
        assert!(matches!(
            verdict,
            GuardVerdict::Rejected {
                reason: BlockReason::RateLimit,
                ..
            }
        ));
        // One minute later the window has rolled
        assert!(guard.check_at("p4", 0.0, 62_500).is_allowed());
    }

    #[test]
    fn cost_gate_counts_observed_spend() {
        let config = GuardConfig {
            max_cost_per_hour: 0.10,
            ..GuardConfig::default()
        };
        let guard = guard_with(config);
        guard.record_cost_at(0.08, 1_000);
        let verdict = guard.check_at("pricey prompt", 0.05, 2_000);
        assert!(matches!(
            verdict,
            GuardVerdict::Rejected {
                reason: BlockReason::CostGate,
                ..
            }
        ));
        // Cheap request still fits under the gate
        assert!(guard.check_at("cheap prompt", 0.01, 2_000).is_allowed());
    }

    #[test]
    fn cost_gate_window_rolls() {
        let config = GuardConfig {
            max_cost_per_hour: 0.10,
            ..GuardConfig::default()
        };
        let guard = guard_with(config);
        guard.record_cost_at(0.09, 1_000);
        // 61 minutes later the old spend has aged out
        assert!(guard.check_at("prompt", 0.05, 1_000 + 61 * 60 * 1000).is_allowed());
    }

    #[test]
    fn min_length_rejects_short_input() {
        let config = GuardConfig {
            min_input_length: 5,
            ..GuardConfig::default()
        };
        let guard = guard_with(config);
        let verdict = guard.check("hi", 0.0);
        assert!(matches!(
            verdict,
            GuardVerdict::Rejected {
                reason: BlockReason::Guard,
                ..
            }
        ));
        assert!(guard.check("hello there", 0.0).is_allowed());
    }

    #[test]
    fn fingerprint_history_bounded() {
        let config = GuardConfig {
            debounce_ms: 0,
            ..GuardConfig::default()
        };
        let guard = guard_with(config);
        for i in 0..20 {
            assert!(guard.check_at("p", 0.0, 1_000 + i * 1_000).is_allowed());
        }
        let mut inner = guard.lock();
        assert!(inner.fingerprints.get("p").unwrap().len() <= FINGERPRINT_HISTORY);
    }
}
