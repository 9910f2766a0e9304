use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use governor::{
    clock::{Clock, QuantaClock, Reference},
    middleware::StateInformationMiddleware,
    state::keyed::DashMapStateStore,
    Quota, RateLimiter as GovernorRateLimiter,
};

use crate::error::Error;
use crate::rate_limit::config::RateLimitAlgorithm;
use crate::rate_limit::store::RateLimitStore;
use crate::rate_limit::{RateLimitDecision, RateLimitHeaders};

type KeyedLimiter<C> =
    GovernorRateLimiter<String, DashMapStateStore<String>, C, StateInformationMiddleware>;

fn elapsed<I: Reference>(now: I, earlier: I) -> Duration {
    Duration::from(now.duration_since(earlier))
}

/// Timestamps of admitted requests still inside the window, oldest first
#[derive(Debug)]
struct Window<I> {
    window: Duration,
    hits: VecDeque<I>,
}

impl<I: Reference> Window<I> {
    fn expire(&mut self, now: I) {
        while let Some(oldest) = self.hits.front() {
            if elapsed(now, *oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until the oldest admitted request leaves the window
    fn time_to_free_slot(&self, now: I) -> Duration {
        self.hits
            .front()
            .map(|oldest| self.window.saturating_sub(elapsed(now, *oldest)))
            .unwrap_or(self.window)
    }
}

/// In-process rate limit state. The clock is injectable so tests can move time by hand.
pub struct LocalRateLimitStore<C: Clock = QuantaClock> {
    algorithm: RateLimitAlgorithm,
    clock: C,
    windows: DashMap<String, Window<C::Instant>>,
    /// One governor limiter per distinct `(max_requests, window)` quota
    buckets: DashMap<(u32, Duration), Arc<KeyedLimiter<C>>>,
}

impl LocalRateLimitStore<QuantaClock> {
    pub fn new(algorithm: RateLimitAlgorithm) -> Self {
        Self::with_clock(algorithm, QuantaClock::default())
    }
}

impl<C: Clock> LocalRateLimitStore<C> {
    pub fn with_clock(algorithm: RateLimitAlgorithm, clock: C) -> Self {
        Self {
            algorithm,
            clock,
            windows: DashMap::new(),
            buckets: DashMap::new(),
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    fn check_sliding_window(&self, key: &str, max_requests: u32, window: Duration) -> RateLimitDecision {
        let now = self.clock.now();
        // The entry guard serializes concurrent checks for the same user
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Window {
                window,
                hits: VecDeque::new(),
            });
        entry.window = window;
        entry.expire(now);

        if (entry.hits.len() as u64) < u64::from(max_requests) {
            entry.hits.push_back(now);
            let remaining = max_requests.saturating_sub(entry.hits.len() as u32);
            RateLimitDecision::Allow(RateLimitHeaders::allowed(
                max_requests,
                remaining,
                entry.time_to_free_slot(now),
            ))
        } else {
            RateLimitDecision::deny(max_requests, entry.time_to_free_slot(now))
        }
    }

    fn bucket(&self, max_requests: u32, window: Duration) -> Option<Arc<KeyedLimiter<C>>> {
        let burst = NonZeroU32::new(max_requests)?;
        let quota = Quota::with_period(window / max_requests)?.allow_burst(burst);
        let limiter = self
            .buckets
            .entry((max_requests, window))
            .or_insert_with(|| {
                Arc::new(
                    GovernorRateLimiter::dashmap_with_clock(quota, &self.clock)
                        .with_middleware::<StateInformationMiddleware>(),
                )
            })
            .clone();
        Some(limiter)
    }

    fn check_token_bucket(&self, key: &str, max_requests: u32, window: Duration) -> RateLimitDecision {
        let Some(limiter) = self.bucket(max_requests, window) else {
            return RateLimitDecision::deny(max_requests, window);
        };
        match limiter.check_key(&key.to_string()) {
            Ok(snapshot) => RateLimitDecision::Allow(RateLimitHeaders::allowed(
                max_requests,
                snapshot.remaining_burst_capacity(),
                window,
            )),
            Err(not_until) => {
                RateLimitDecision::deny(max_requests, not_until.wait_time_from(self.clock.now()))
            }
        }
    }
}

#[async_trait]
impl<C> RateLimitStore for LocalRateLimitStore<C>
where
    C: Clock + Send + Sync + 'static,
{
    async fn check(
        &self,
        key: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<RateLimitDecision, Error> {
        Ok(match self.algorithm {
            RateLimitAlgorithm::SlidingWindow => self.check_sliding_window(key, max_requests, window),
            RateLimitAlgorithm::TokenBucket => self.check_token_bucket(key, max_requests, window),
        })
    }

    fn sweep(&self) {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, state| {
            state
                .hits
                .back()
                .is_some_and(|newest| elapsed(now, *newest) < state.window)
        });
        for bucket in self.buckets.iter() {
            bucket.retain_recent();
        }
        tracing::debug!(
            "Rate limit sweep evicted {} idle users",
            before.saturating_sub(self.windows.len())
        );
    }
}
