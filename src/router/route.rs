use crate::config::{ModelCandidate, RouterConfig};
use crate::router::complexity::{ComplexityReport, ComplexityTier};
use tracing::debug;

/// Routing outcome for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub model_id: String,
    pub tier: ComplexityTier,
    /// True when the selected model differs from the requested one.
    pub downgraded: bool,
}

/// Picks the cheapest candidate whose capability tier covers the prompt's
/// required tier. Candidates are ordered cheapest → most capable.
pub struct ModelRouter {
    candidates: Vec<ModelCandidate>,
    pub dry_run: bool,
}

impl ModelRouter {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            candidates: config.candidates.clone(),
            dry_run: config.dry_run,
        }
    }

    pub fn has_candidates(&self) -> bool {
        !self.candidates.is_empty()
    }

    /// First candidate with `tier >= required`; falls back to the most
    /// capable candidate when none covers the requirement.
    pub fn route(&self, report: &ComplexityReport, requested_model: &str) -> Option<RouteDecision> {
        let selected = self
            .candidates
            .iter()
            .find(|c| c.tier >= report.tier)
            .or_else(|| self.candidates.last())?;

        let downgraded = selected.model_id != requested_model;
        if downgraded {
            debug!(
                "router selected {} over requested {} (score {}, tier {})",
                selected.model_id,
                requested_model,
                report.score,
                report.tier.as_str()
            );
        }
        Some(RouteDecision {
            model_id: selected.model_id.clone(),
            tier: selected.tier,
            downgraded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::complexity::analyze_complexity;

    fn router() -> ModelRouter {
        ModelRouter::new(&RouterConfig {
            candidates: vec![
                ModelCandidate {
                    model_id: "gpt-4o-mini".into(),
                    tier: ComplexityTier::Simple,
                },
                ModelCandidate {
                    model_id: "gpt-4.1".into(),
                    tier: ComplexityTier::Moderate,
                },
                ModelCandidate {
                    model_id: "gpt-4o".into(),
                    tier: ComplexityTier::Complex,
                },
            ],
            dry_run: false,
        })
    }

    #[test]
    fn simple_prompt_routes_to_cheapest() {
        let report = analyze_complexity("hello there");
        let decision = router().route(&report, "gpt-4o").unwrap();
        assert_eq!(decision.model_id, "gpt-4o-mini");
        assert!(decision.downgraded);
    }

    #[test]
    fn complex_prompt_keeps_capable_model() {
        let body = format!(
            "First, analyze the trade-off between the two architecture options. \
             Then compare their failure modes, derive a cost model and prove the bound. {}",
            "Additional background material follows here. ".repeat(50)
        );
        let report = analyze_complexity(&body);
        let decision = router().route(&report, "gpt-4o").unwrap();
        assert_eq!(decision.model_id, "gpt-4o");
        assert!(!decision.downgraded);
    }

    #[test]
    fn no_candidates_yields_none() {
        let empty = ModelRouter::new(&RouterConfig::default());
        let report = analyze_complexity("hello");
        assert!(empty.route(&report, "gpt-4o").is_none());
    }

    #[test]
    fn requested_model_already_cheapest_not_downgraded() {
        let report = analyze_complexity("hello");
        let decision = router().route(&report, "gpt-4o-mini").unwrap();
        assert!(!decision.downgraded);
    }

    #[test]
    fn falls_back_to_most_capable_when_uncovered() {
        let low_only = ModelRouter::new(&RouterConfig {
            candidates: vec![ModelCandidate {
                model_id: "gpt-4o-mini".into(),
                tier: ComplexityTier::Simple,
            }],
            dry_run: false,
        });
        let body = "Analyze, compare, derive, prove, evaluate and optimize this design. "
            .repeat(20);
        let report = analyze_complexity(&body);
        let decision = low_only.route(&report, "gpt-4o").unwrap();
        assert_eq!(decision.model_id, "gpt-4o-mini");
    }
}
