use serde::{Deserialize, Serialize};

/// Algorithm to use for rate limiting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Exact per-user timestamp log
    #[default]
    SlidingWindow,
    /// GCRA token bucket - smooth rate limiting with a burst of `rate_limit_max_requests`
    TokenBucket,
}

/// Configuration for per-user rate limiting. The limits themselves come from the plan tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Algorithm to use (in-memory storage only; Redis always uses a sliding window)
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,

    /// Interval between sweeps of idle window state, in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Redis operation timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub redis_timeout_ms: u64,

    /// Allow requests when the window store is unreachable
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_redis_timeout_ms() -> u64 {
    50
}

fn default_fail_open() -> bool {
    true
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            algorithm: RateLimitAlgorithm::default(),
            sweep_interval_ms: default_sweep_interval_ms(),
            redis_timeout_ms: default_redis_timeout_ms(),
            fail_open: default_fail_open(),
        }
    }
}
