use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use tokio::time::timeout;

use crate::error::{Error, ErrorDetails};
use crate::rate_limit::{RateLimitDecision, RateLimitHeaders};

/// Storage for per-key request windows.
///
/// `check` both decides and records: an allowed request is counted in the same
/// atomic step, a denied one is not.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn check(
        &self,
        key: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<RateLimitDecision, Error>;

    /// Drop state for keys whose window has fully elapsed.
    fn sweep(&self) {}
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Sliding window shared across gateway instances, one sorted set per user.
pub struct RedisRateLimitStore {
    conn: MultiplexedConnection,
    key_prefix: String,
    redis_timeout: Duration,
    check_and_increment_script: Script,
}

impl RedisRateLimitStore {
    pub fn new(
        conn: MultiplexedConnection,
        key_prefix: impl Into<String>,
        redis_timeout: Duration,
    ) -> Self {
        let check_and_increment_script = Script::new(
            r#"
            local key = KEYS[1]
            local limit = tonumber(ARGV[1])
            local window = tonumber(ARGV[2])
            local now = tonumber(ARGV[3])
            local member = ARGV[4]

            -- Clean old entries for sliding window
            redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)

            local current = redis.call('ZCARD', key)

            if current < limit then
                redis.call('ZADD', key, now, member)
                redis.call('PEXPIRE', key, window)
                return {1, limit - current - 1, window}
            end

            -- Oldest entry decides when a slot frees up
            local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
            local retry_after = window
            if oldest[2] then
                retry_after = tonumber(oldest[2]) + window - now
            end
            return {0, 0, retry_after}
            "#,
        );
        Self {
            conn,
            key_prefix: key_prefix.into(),
            redis_timeout,
            check_and_increment_script,
        }
    }

    async fn execute_script(
        &self,
        key: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<(i64, i64, i64), redis::RedisError> {
        let mut conn = self.conn.clone();
        self.check_and_increment_script
            .key(format!("{}rl:{key}", self.key_prefix))
            .arg(max_requests)
            .arg(window.as_millis() as u64)
            .arg(unix_millis())
            .arg(uuid::Uuid::now_v7().to_string())
            .invoke_async(&mut conn)
            .await
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn check(
        &self,
        key: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<RateLimitDecision, Error> {
        let result = timeout(self.redis_timeout, self.execute_script(key, max_requests, window))
            .await
            .map_err(|_| {
                Error::new(ErrorDetails::CounterStore {
                    message: format!(
                        "Rate limit check timed out after {}ms",
                        self.redis_timeout.as_millis()
                    ),
                })
            })?
            .map_err(|e| {
                Error::new(ErrorDetails::CounterStore {
                    message: format!("Rate limit script failed: {e}"),
                })
            })?;

        let (allowed, remaining, millis) = result;
        let millis = Duration::from_millis(u64::try_from(millis).unwrap_or(0));
        if allowed == 1 {
            Ok(RateLimitDecision::Allow(RateLimitHeaders::allowed(
                max_requests,
                u32::try_from(remaining).unwrap_or(0),
                millis,
            )))
        } else {
            Ok(RateLimitDecision::deny(
                max_requests,
                millis.max(Duration::from_millis(1)),
            ))
        }
    }
}
