pub mod config;
pub mod limiter;
pub mod store;

pub use config::{RateLimitAlgorithm, RateLimitConfig};
pub use limiter::LocalRateLimitStore;
pub use store::{RateLimitStore, RedisRateLimitStore};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, HeaderValue};
use tokio::task::JoinHandle;

use crate::error::{retry_after_seconds, Error};
use crate::plan::PlanLimits;

/// Helper function to get current Unix timestamp.
/// Returns 0 if system time is before UNIX_EPOCH (extremely rare).
pub(crate) fn get_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Headers returned with rate limit information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset: u64,               // Unix timestamp
    pub retry_after: Option<u64>, // Seconds
}

impl RateLimitHeaders {
    pub fn allowed(limit: u32, remaining: u32, reset_in: Duration) -> Self {
        Self {
            limit,
            remaining,
            reset: get_unix_timestamp() + retry_after_seconds(reset_in),
            retry_after: None,
        }
    }

    pub fn denied(limit: u32, retry_after: Duration) -> Self {
        let seconds = retry_after_seconds(retry_after);
        Self {
            limit,
            remaining: 0,
            reset: get_unix_timestamp() + seconds,
            retry_after: Some(seconds),
        }
    }

    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        // Numbers always produce valid header values.
        if let Ok(value) = HeaderValue::from_str(&self.limit.to_string()) {
            headers.insert("X-RateLimit-Limit", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.remaining.to_string()) {
            headers.insert("X-RateLimit-Remaining", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.reset.to_string()) {
            headers.insert("X-RateLimit-Reset", value);
        }

        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                headers.insert("Retry-After", value);
            }
        }

        headers
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allow(RateLimitHeaders),
    Deny {
        headers: RateLimitHeaders,
        retry_after: Duration,
    },
}

impl RateLimitDecision {
    pub fn deny(limit: u32, retry_after: Duration) -> Self {
        RateLimitDecision::Deny {
            headers: RateLimitHeaders::denied(limit, retry_after),
            retry_after,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allow(_))
    }

    pub fn headers(&self) -> &RateLimitHeaders {
        match self {
            RateLimitDecision::Allow(h) | RateLimitDecision::Deny { headers: h, .. } => h,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitDecision::Allow(_) => None,
            RateLimitDecision::Deny { retry_after, .. } => Some(*retry_after),
        }
    }
}

/// Metrics for rate limiter monitoring
#[derive(Debug, Default)]
pub struct RateLimiterMetrics {
    pub allowed: AtomicU64,
    pub rate_limit_exceeded: AtomicU64,
    pub store_errors: AtomicU64,
}

impl RateLimiterMetrics {
    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("counsel_rate_limit_checks_total", "outcome" => "allowed").increment(1);
    }

    pub fn record_rate_limit_exceeded(&self) {
        self.rate_limit_exceeded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("counsel_rate_limit_checks_total", "outcome" => "exceeded").increment(1);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("counsel_rate_limit_store_errors_total").increment(1);
    }
}

/// Short-window request cap per user, backed by a [`RateLimitStore`].
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RateLimitConfig,
    metrics: Arc<RateLimiterMetrics>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config,
            metrics: Arc::new(RateLimiterMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<RateLimiterMetrics> {
        self.metrics.clone()
    }

    /// Check and record one request for `user_id` against the plan's window.
    pub async fn check(
        &self,
        user_id: &str,
        limits: &PlanLimits,
    ) -> Result<RateLimitDecision, Error> {
        let max_requests = limits.rate_limit_max_requests;
        let window = limits.rate_limit_window();
        if !self.config.enabled {
            return Ok(RateLimitDecision::Allow(RateLimitHeaders::allowed(
                max_requests,
                max_requests,
                window,
            )));
        }

        match self.store.check(user_id, max_requests, window).await {
            Ok(decision) => {
                if decision.is_allowed() {
                    self.metrics.record_allowed();
                } else {
                    self.metrics.record_rate_limit_exceeded();
                    tracing::debug!(
                        user_id,
                        retry_after_ms = decision.retry_after().unwrap_or_default().as_millis() as u64,
                        "Rate limit exceeded"
                    );
                }
                Ok(decision)
            }
            Err(e) => {
                self.metrics.record_store_error();
                if self.config.fail_open {
                    tracing::warn!("Rate limit store unavailable, allowing request for user {user_id}: {e}");
                    Ok(RateLimitDecision::Allow(RateLimitHeaders::allowed(
                        max_requests,
                        max_requests,
                        window,
                    )))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Periodically evicts idle window state. The task stops when the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                limiter.store.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorDetails;
    use async_trait::async_trait;

    fn limits(max: u32, window_ms: u64) -> PlanLimits {
        PlanLimits {
            max_questions_per_day: None,
            max_tokens_per_request: 1024,
            rate_limit_window_ms: window_ms,
            rate_limit_max_requests: max,
            model: None,
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl RateLimitStore for BrokenStore {
        async fn check(
            &self,
            _key: &str,
            _max_requests: u32,
            _window: Duration,
        ) -> Result<RateLimitDecision, Error> {
            Err(Error::new_without_logging(ErrorDetails::CounterStore {
                message: "timeout".to_string(),
            }))
        }
    }

    #[test]
    fn test_rate_limit_headers() {
        let headers = RateLimitHeaders {
            limit: 100,
            remaining: 45,
            reset: 1234567890,
            retry_after: None,
        };

        let header_map = headers.to_header_map();

        assert!(header_map.contains_key("X-RateLimit-Limit"));
        assert!(header_map.contains_key("X-RateLimit-Remaining"));
        assert!(header_map.contains_key("X-RateLimit-Reset"));
        assert!(!header_map.contains_key("Retry-After"));
    }

    #[test]
    fn test_denied_headers_round_retry_after_up() {
        let decision = RateLimitDecision::deny(5, Duration::from_millis(1500));
        assert!(!decision.is_allowed());
        assert_eq!(decision.headers().remaining, 0);
        assert_eq!(decision.headers().retry_after, Some(2));
        assert_eq!(decision.retry_after(), Some(Duration::from_millis(1500)));
        let header_map = decision.headers().to_header_map();
        assert_eq!(
            header_map.get("Retry-After").and_then(|v| v.to_str().ok()),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_sliding_window_through_facade() {
        let limiter = RateLimiter::new(
            Arc::new(LocalRateLimitStore::new(RateLimitAlgorithm::SlidingWindow)),
            RateLimitConfig::default(),
        );
        let plan = limits(2, 60_000);
        assert!(limiter.check("alice", &plan).await.unwrap().is_allowed());
        assert!(limiter.check("alice", &plan).await.unwrap().is_allowed());
        let denied = limiter.check("alice", &plan).await.unwrap();
        assert!(denied.retry_after().unwrap() > Duration::ZERO);
        // Other users have their own window
        assert!(limiter.check("bob", &plan).await.unwrap().is_allowed());

        let metrics = limiter.metrics();
        assert_eq!(metrics.allowed.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.rate_limit_exceeded.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_disabled_limiter_allows_everything() {
        let limiter = RateLimiter::new(
            Arc::new(BrokenStore),
            RateLimitConfig {
                enabled: false,
                ..Default::default()
            },
        );
        for _ in 0..10 {
            assert!(limiter.check("alice", &limits(1, 1000)).await.unwrap().is_allowed());
        }
    }

    #[tokio::test]
    async fn test_store_failure_modes() {
        let open = RateLimiter::new(Arc::new(BrokenStore), RateLimitConfig::default());
        assert!(open.check("alice", &limits(1, 1000)).await.unwrap().is_allowed());
        assert_eq!(open.metrics().store_errors.load(Ordering::Relaxed), 1);

        let closed = RateLimiter::new(
            Arc::new(BrokenStore),
            RateLimitConfig {
                fail_open: false,
                ..Default::default()
            },
        );
        assert!(closed.check("alice", &limits(1, 1000)).await.is_err());
    }

    #[test]
    fn test_metrics_are_exported() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let metrics = RateLimiterMetrics::default();
        metrics::with_local_recorder(&recorder, || {
            metrics.record_allowed();
            metrics.record_rate_limit_exceeded();
            metrics.record_rate_limit_exceeded();
        });
        let rendered = handle.render();
        assert!(rendered.contains(r#"counsel_rate_limit_checks_total{outcome="allowed"} 1"#));
        assert!(rendered.contains(r#"counsel_rate_limit_checks_total{outcome="exceeded"} 2"#));
    }
}
