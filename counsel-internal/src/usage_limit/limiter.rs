use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::Error;
use crate::plan::{PlanTable, PlanTier};
use crate::usage_limit::store::CounterStore;
use crate::usage_limit::QuotaDecision;

/// Configuration for the daily quota tracker
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    /// Whether to fail open (allow) or closed (deny) when the counter store errors
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
}

fn default_fail_open() -> bool {
    true
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            fail_open: default_fail_open(),
        }
    }
}

/// Metrics for the quota tracker
#[derive(Debug, Default)]
pub struct QuotaMetrics {
    pub allowed_requests: AtomicU64,
    pub denied_requests: AtomicU64,
    pub unlimited_requests: AtomicU64,
    pub store_errors: AtomicU64,
}

impl QuotaMetrics {
    pub fn record_allowed(&self) {
        self.allowed_requests.fetch_add(1, Ordering::Relaxed);
        record_check("allowed");
    }

    pub fn record_denied(&self) {
        self.denied_requests.fetch_add(1, Ordering::Relaxed);
        record_check("denied");
    }

    pub fn record_unlimited(&self) {
        self.unlimited_requests.fetch_add(1, Ordering::Relaxed);
        record_check("unlimited");
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("counsel_quota_store_errors_total").increment(1);
    }
}

fn record_check(outcome: &'static str) {
    metrics::counter!("counsel_quota_checks_total", "outcome" => outcome).increment(1);
}

/// Enforces `max_questions_per_day` per user. Days are UTC calendar days.
pub struct QuotaTracker {
    store: Arc<dyn CounterStore>,
    plans: PlanTable,
    config: QuotaConfig,
    metrics: Arc<QuotaMetrics>,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn CounterStore>, plans: PlanTable, config: QuotaConfig) -> Self {
        Self {
            store,
            plans,
            config,
            metrics: Arc::new(QuotaMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<QuotaMetrics> {
        self.metrics.clone()
    }

    /// Checks the daily ceiling and, when there is room, consumes one unit in the same step.
    pub async fn check_usage_quota(
        &self,
        user_id: &str,
        tier: PlanTier,
    ) -> Result<QuotaDecision, Error> {
        self.check_usage_quota_on(user_id, tier, Utc::now().date_naive())
            .await
    }

    pub async fn check_usage_quota_on(
        &self,
        user_id: &str,
        tier: PlanTier,
        day: NaiveDate,
    ) -> Result<QuotaDecision, Error> {
        let Some(limit) = self.plans.limits(tier).max_questions_per_day else {
            self.metrics.record_unlimited();
            return Ok(QuotaDecision::unlimited());
        };

        match self.store.increment_if_below(user_id, day, limit).await {
            Ok(update) => {
                if update.consumed {
                    self.metrics.record_allowed();
                } else {
                    self.metrics.record_denied();
                }
                debug!(
                    "Quota check for user {user_id}: used={}, limit={limit}, allowed={}",
                    update.count, update.consumed
                );
                Ok(QuotaDecision {
                    within_quota: update.consumed,
                    used: update.count,
                    limit: Some(limit),
                })
            }
            Err(e) => {
                self.metrics.record_store_error();
                if self.config.fail_open {
                    warn!("Quota store unavailable, allowing request for user {user_id}: {e}");
                    Ok(QuotaDecision {
                        within_quota: true,
                        used: 0,
                        limit: Some(limit),
                    })
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Read-only view of today's usage.
    pub async fn usage(&self, user_id: &str, tier: PlanTier) -> Result<QuotaDecision, Error> {
        let limit = self.plans.limits(tier).max_questions_per_day;
        let used = self
            .store
            .current(user_id, Utc::now().date_naive())
            .await?;
        Ok(QuotaDecision {
            within_quota: limit.is_none_or(|limit| used < limit),
            used,
            limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorDetails;
    use crate::plan::PlanLimits;
    use crate::usage_limit::store::{CounterUpdate, InMemoryCounterStore};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn increment_if_below(
            &self,
            _user_id: &str,
            _day: NaiveDate,
            _limit: u32,
        ) -> Result<CounterUpdate, Error> {
            Err(Error::new_without_logging(ErrorDetails::CounterStore {
                message: "connection refused".to_string(),
            }))
        }

        async fn current(&self, _user_id: &str, _day: NaiveDate) -> Result<u32, Error> {
            Ok(0)
        }
    }

    fn plans(max_questions_per_day: Option<u32>) -> PlanTable {
        let mut plans = HashMap::new();
        plans.insert(
            PlanTier::Free,
            PlanLimits {
                max_questions_per_day,
                max_tokens_per_request: 1024,
                rate_limit_window_ms: 60_000,
                rate_limit_max_requests: 100,
                model: None,
            },
        );
        PlanTable::new(plans)
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    #[tokio::test]
    async fn test_exactly_limit_requests_are_admitted() {
        let tracker = QuotaTracker::new(
            Arc::new(InMemoryCounterStore::new()),
            plans(Some(3)),
            QuotaConfig::default(),
        );
        for used in 1..=3 {
            let decision = tracker
                .check_usage_quota_on("alice", PlanTier::Free, day())
                .await
                .unwrap();
            assert!(decision.within_quota);
            assert_eq!(decision.used, used);
        }
        let decision = tracker
            .check_usage_quota_on("alice", PlanTier::Free, day())
            .await
            .unwrap();
        assert!(!decision.within_quota);
        assert_eq!(decision.limit, Some(3));

        let metrics = tracker.metrics();
        assert_eq!(metrics.allowed_requests.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.denied_requests.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unlimited_plan_bypasses_store() {
        let tracker = QuotaTracker::new(Arc::new(BrokenStore), plans(None), QuotaConfig::default());
        let decision = tracker
            .check_usage_quota("alice", PlanTier::Enterprise)
            .await
            .unwrap();
        assert_eq!(decision, QuotaDecision::unlimited());
        assert_eq!(
            tracker.metrics().store_errors.load(Ordering::Relaxed),
            0
        );
    }

    #[tokio::test]
    async fn test_store_failure_fail_open() {
        let tracker = QuotaTracker::new(Arc::new(BrokenStore), plans(Some(1)), QuotaConfig::default());
        let decision = tracker
            .check_usage_quota("alice", PlanTier::Free)
            .await
            .unwrap();
        assert!(decision.within_quota);
        assert_eq!(tracker.metrics().store_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_store_failure_fail_closed() {
        let tracker = QuotaTracker::new(
            Arc::new(BrokenStore),
            plans(Some(1)),
            QuotaConfig { fail_open: false },
        );
        let err = tracker
            .check_usage_quota("alice", PlanTier::Free)
            .await
            .unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::CounterStore { .. }));
    }

    #[tokio::test]
    async fn test_usage_is_read_only() {
        let tracker = QuotaTracker::new(
            Arc::new(InMemoryCounterStore::new()),
            plans(Some(2)),
            QuotaConfig::default(),
        );
        tracker.check_usage_quota("alice", PlanTier::Free).await.unwrap();
        for _ in 0..3 {
            let usage = tracker.usage("alice", PlanTier::Free).await.unwrap();
            assert_eq!(usage.used, 1);
            assert_eq!(usage.remaining(), Some(1));
        }
    }

    #[test]
    fn test_metrics_are_exported() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let metrics = QuotaMetrics::default();
        metrics::with_local_recorder(&recorder, || {
            metrics.record_allowed();
            metrics.record_allowed();
            metrics.record_denied();
            metrics.record_store_error();
        });
        let rendered = handle.render();
        assert!(rendered.contains(r#"counsel_quota_checks_total{outcome="allowed"} 2"#));
        assert!(rendered.contains(r#"counsel_quota_checks_total{outcome="denied"} 1"#));
        assert!(rendered.contains("counsel_quota_store_errors_total 1"));
        assert_eq!(metrics.allowed_requests.load(Ordering::Relaxed), 2);
    }
}
