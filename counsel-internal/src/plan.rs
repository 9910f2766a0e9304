use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Subscription level of a caller. Unknown or missing tiers resolve to `Free`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum PlanTier {
    #[default]
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl PlanTier {
    /// Parse a plan name from a user record, falling back to the default tier.
    pub fn from_record(plan: Option<&str>) -> Self {
        plan.and_then(|p| p.trim().parse().ok()).unwrap_or_default()
    }
}

/// Static limits attached to a plan tier. Looked up per request, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanLimits {
    /// `None` disables the daily ceiling entirely.
    #[serde(default)]
    pub max_questions_per_day: Option<u32>,
    pub max_tokens_per_request: u32,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max_requests: u32,
    /// Overrides `upstream.model` for this tier
    #[serde(default)]
    pub model: Option<String>,
}

impl PlanLimits {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }
}

/// Plan limits keyed by tier.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanTable {
    plans: HashMap<PlanTier, PlanLimits>,
}

impl PlanTable {
    pub fn new(plans: HashMap<PlanTier, PlanLimits>) -> Self {
        Self { plans }
    }

    /// Limits for `tier`; tiers missing from the table get the free tier's limits,
    /// and a table without a free tier falls back to the built-in free limits.
    pub fn limits(&self, tier: PlanTier) -> PlanLimits {
        self.plans
            .get(&tier)
            .or_else(|| self.plans.get(&PlanTier::Free))
            .cloned()
            .unwrap_or_else(default_free_limits)
    }

    pub fn insert(&mut self, tier: PlanTier, limits: PlanLimits) {
        self.plans.insert(tier, limits);
    }

    pub fn tiers(&self) -> impl Iterator<Item = &PlanTier> {
        self.plans.keys()
    }
}

impl Default for PlanTable {
    fn default() -> Self {
        let mut plans = HashMap::new();
        plans.insert(PlanTier::Free, default_free_limits());
        plans.insert(
            PlanTier::Basic,
            PlanLimits {
                max_questions_per_day: Some(50),
                max_tokens_per_request: 2048,
                rate_limit_window_ms: 60_000,
                rate_limit_max_requests: 10,
                model: None,
            },
        );
        plans.insert(
            PlanTier::Pro,
            PlanLimits {
                max_questions_per_day: Some(200),
                max_tokens_per_request: 4096,
                rate_limit_window_ms: 60_000,
                rate_limit_max_requests: 30,
                model: None,
            },
        );
        plans.insert(
            PlanTier::Enterprise,
            PlanLimits {
                max_questions_per_day: None,
                max_tokens_per_request: 8192,
                rate_limit_window_ms: 60_000,
                rate_limit_max_requests: 120,
                model: None,
            },
        );
        Self { plans }
    }
}

fn default_free_limits() -> PlanLimits {
    PlanLimits {
        max_questions_per_day: Some(10),
        max_tokens_per_request: 1024,
        rate_limit_window_ms: 60_000,
        rate_limit_max_requests: 5,
        model: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_tier_from_record() {
        assert_eq!(PlanTier::from_record(Some("pro")), PlanTier::Pro);
        assert_eq!(PlanTier::from_record(Some(" Basic ")), PlanTier::Basic);
        assert_eq!(PlanTier::from_record(Some("platinum")), PlanTier::Free);
        assert_eq!(PlanTier::from_record(None), PlanTier::Free);
    }

    #[test]
    fn test_missing_tier_falls_back_to_free() {
        let mut plans = HashMap::new();
        plans.insert(
            PlanTier::Free,
            PlanLimits {
                max_questions_per_day: Some(3),
                max_tokens_per_request: 256,
                rate_limit_window_ms: 1000,
                rate_limit_max_requests: 1,
                model: None,
            },
        );
        let table = PlanTable::new(plans);
        assert_eq!(table.limits(PlanTier::Pro).max_questions_per_day, Some(3));
        assert_eq!(
            PlanTable::new(HashMap::new()).limits(PlanTier::Pro),
            default_free_limits()
        );
    }

    #[test]
    fn test_default_enterprise_is_unlimited() {
        let table = PlanTable::default();
        assert!(table.limits(PlanTier::Enterprise).max_questions_per_day.is_none());
        assert!(table.limits(PlanTier::Free).max_questions_per_day.is_some());
    }
}
