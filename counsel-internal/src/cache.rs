use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::prompt::Category;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Upper bound on stored answers (in-memory storage only)
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
    /// Entries never expire when unset
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_capacity() -> u64 {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_capacity: default_max_capacity(),
            ttl_secs: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// Lowercases, trims, and collapses internal whitespace.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// BLAKE3 over the category and the normalized question. The NUL separator
/// keeps the two parts from running into each other.
pub fn fingerprint(question: &str, category: Category) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(category.as_ref().as_bytes());
    hasher.update(&[0]);
    hasher.update(normalize_question(question).as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Write-once answer storage keyed by fingerprint.
#[async_trait]
pub trait ResponseCacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, Error>;

    /// Stores `entry` unless the key is already present. Returns whether it was stored.
    async fn insert_if_absent(&self, key: &str, entry: CacheEntry) -> Result<bool, Error>;
}

pub struct MokaCacheStore {
    cache: Cache<String, CacheEntry>,
}

impl MokaCacheStore {
    pub fn new(max_capacity: u64, ttl: Option<Duration>) -> Self {
        let mut builder = Cache::builder().max_capacity(max_capacity);
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }
        Self {
            cache: builder.build(),
        }
    }
}

#[async_trait]
impl ResponseCacheStore for MokaCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, Error> {
        Ok(self.cache.get(key).await)
    }

    async fn insert_if_absent(&self, key: &str, entry: CacheEntry) -> Result<bool, Error> {
        Ok(self
            .cache
            .entry(key.to_string())
            .or_insert(entry)
            .await
            .is_fresh())
    }
}

pub struct RedisCacheStore {
    conn: MultiplexedConnection,
    key_prefix: String,
    ttl: Option<Duration>,
}

impl RedisCacheStore {
    pub fn new(conn: MultiplexedConnection, key_prefix: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
            ttl,
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}answer:{key}", self.key_prefix)
    }
}

fn cache_error(message: String) -> Error {
    Error::new(ErrorDetails::Cache { message })
}

#[async_trait]
impl ResponseCacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, Error> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| cache_error(format!("GET failed: {e}")))?;
        raw.map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| cache_error(format!("Corrupt cache entry for {key}: {e}")))
        })
        .transpose()
    }

    async fn insert_if_absent(&self, key: &str, entry: CacheEntry) -> Result<bool, Error> {
        let value = serde_json::to_string(&entry).map_err(|e| {
            Error::new(ErrorDetails::Serialization {
                message: format!("Failed to serialize cache entry: {e}"),
            })
        })?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value).arg("NX");
        if let Some(ttl) = self.ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        let mut conn = self.conn.clone();
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| cache_error(format!("SET NX failed: {e}")))?;
        Ok(reply.is_some())
    }
}

/// Question-level facade over a [`ResponseCacheStore`]. Store failures are
/// logged and treated as misses so they never fail a request.
#[derive(Clone)]
pub struct ResponseCache {
    store: Option<Arc<dyn ResponseCacheStore>>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn ResponseCacheStore>) -> Self {
        Self { store: Some(store) }
    }

    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        if config.enabled {
            Self::new(Arc::new(MokaCacheStore::new(config.max_capacity, config.ttl())))
        } else {
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub async fn get(&self, question: &str, category: Category) -> Option<CacheEntry> {
        let store = self.store.as_ref()?;
        match store.get(&fingerprint(question, category)).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Cache lookup failed, treating as miss: {e}");
                None
            }
        }
    }

    pub async fn set(&self, question: &str, answer: &str, model: &str, category: Category) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let entry = CacheEntry {
            content: answer.to_string(),
            model: model.to_string(),
            created_at: Utc::now(),
        };
        match store
            .insert_if_absent(&fingerprint(question, category), entry)
            .await
        {
            Ok(true) => tracing::debug!("Cached answer for new question"),
            Ok(false) => tracing::debug!("Answer already cached, keeping existing entry"),
            Err(e) => tracing::warn!("Failed to store answer in cache: {e}"),
        }
    }
}
