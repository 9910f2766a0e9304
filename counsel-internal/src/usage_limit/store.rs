use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::Script;

use crate::error::{Error, ErrorDetails};

/// Counters outlive the day they belong to by this long in Redis.
const DAY_KEY_TTL_SECS: u64 = 2 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterUpdate {
    /// Whether this call took one unit of quota
    pub consumed: bool,
    /// Counter value after the call
    pub count: u32,
}

/// Per-user, per-day usage counters.
///
/// `increment_if_below` must be a single atomic operation per `(user, day)`:
/// concurrent callers can never push a counter past `limit`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn increment_if_below(
        &self,
        user_id: &str,
        day: NaiveDate,
        limit: u32,
    ) -> Result<CounterUpdate, Error>;

    async fn current(&self, user_id: &str, day: NaiveDate) -> Result<u32, Error>;
}

#[derive(Debug, Clone, Copy)]
struct DayCounter {
    day: NaiveDate,
    count: u32,
}

/// Single-process counter store. One entry per user, reset when the day changes.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<String, DayCounter>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop counters from days before `today`.
    pub fn evict_stale(&self, today: NaiveDate) {
        self.counters.retain(|_, counter| counter.day >= today);
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment_if_below(
        &self,
        user_id: &str,
        day: NaiveDate,
        limit: u32,
    ) -> Result<CounterUpdate, Error> {
        // The entry guard holds the shard lock for the whole read-modify-write
        let mut entry = self
            .counters
            .entry(user_id.to_string())
            .or_insert(DayCounter { day, count: 0 });
        if entry.day != day {
            *entry = DayCounter { day, count: 0 };
        }
        if entry.count >= limit {
            return Ok(CounterUpdate {
                consumed: false,
                count: entry.count,
            });
        }
        entry.count += 1;
        Ok(CounterUpdate {
            consumed: true,
            count: entry.count,
        })
    }

    async fn current(&self, user_id: &str, day: NaiveDate) -> Result<u32, Error> {
        Ok(self
            .counters
            .get(user_id)
            .filter(|counter| counter.day == day)
            .map(|counter| counter.count)
            .unwrap_or(0))
    }
}

/// Counter store shared by every gateway instance.
pub struct RedisCounterStore {
    conn: MultiplexedConnection,
    key_prefix: String,
    increment_script: Script,
}

impl RedisCounterStore {
    pub fn new(conn: MultiplexedConnection, key_prefix: impl Into<String>) -> Self {
        let increment_script = Script::new(
            r#"
            local key = KEYS[1]
            local limit = tonumber(ARGV[1])
            local ttl = tonumber(ARGV[2])

            local current = tonumber(redis.call('GET', key) or '0')
            if current >= limit then
                return {0, current}
            end

            current = redis.call('INCR', key)
            if current == 1 then
                redis.call('EXPIRE', key, ttl)
            end
            return {1, current}
            "#,
        );
        Self {
            conn,
            key_prefix: key_prefix.into(),
            increment_script,
        }
    }

    fn key(&self, user_id: &str, day: NaiveDate) -> String {
        format!("{}quota:{user_id}:{}", self.key_prefix, day.format("%Y-%m-%d"))
    }
}

fn store_error(e: redis::RedisError) -> Error {
    Error::new(ErrorDetails::CounterStore {
        message: e.to_string(),
    })
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_if_below(
        &self,
        user_id: &str,
        day: NaiveDate,
        limit: u32,
    ) -> Result<CounterUpdate, Error> {
        let mut conn = self.conn.clone();
        let (consumed, count): (i64, i64) = self
            .increment_script
            .key(self.key(user_id, day))
            .arg(limit)
            .arg(DAY_KEY_TTL_SECS)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(CounterUpdate {
            consumed: consumed == 1,
            count: u32::try_from(count).unwrap_or(u32::MAX),
        })
    }

    async fn current(&self, user_id: &str, day: NaiveDate) -> Result<u32, Error> {
        let mut conn = self.conn.clone();
        let count: Option<u32> = redis::cmd("GET")
            .arg(self.key(user_id, day))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(count.unwrap_or(0))
    }
}
