use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Json, Request};
use chrono::Utc;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::auth::{Auth, AuthResolver};
use crate::cache::{RedisCacheStore, ResponseCache};
use crate::config_parser::{Config, StorageConfig};
use crate::error::{Error, ErrorDetails};
use crate::inference::providers::anthropic::AnthropicProvider;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::rate_limit::{LocalRateLimitStore, RateLimitStore, RateLimiter, RedisRateLimitStore};
use crate::redis_client;
use crate::usage_limit::{CounterStore, InMemoryCounterStore, QuotaTracker, RedisCounterStore};
use crate::usage_log::setup_usage_logger;

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub pipeline: Arc<Pipeline>,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let http_client = setup_http_client()?;
        let storage = setup_storage(&config).await?;
        let auth = Auth::from_config(&config.auth)?;
        let provider = AnthropicProvider::from_config(&config.upstream, http_client)?;

        let rate_limiter = Arc::new(RateLimiter::new(
            storage.rate_limits,
            config.rate_limits.clone(),
        ));
        rate_limiter.spawn_sweeper();

        let pipeline = Pipeline {
            auth: AuthResolver::new(Arc::new(auth)),
            quota: Arc::new(QuotaTracker::new(
                storage.counters,
                config.plans.clone(),
                config.quota.clone(),
            )),
            rate_limiter,
            cache: storage.cache,
            provider: Arc::new(provider),
            usage_logger: setup_usage_logger(&config.usage_log),
            plans: config.plans.clone(),
            settings: PipelineSettings::from_config(&config),
        };
        Ok(Self::from_pipeline(config, pipeline))
    }

    pub fn from_pipeline(config: Arc<Config>, pipeline: Pipeline) -> Self {
        Self {
            config,
            pipeline: Arc::new(pipeline),
        }
    }
}

/// Backends for the shared per-user state, chosen by `[storage]`.
struct Storage {
    counters: Arc<dyn CounterStore>,
    rate_limits: Arc<dyn RateLimitStore>,
    cache: ResponseCache,
}

async fn setup_storage(config: &Config) -> Result<Storage, Error> {
    match &config.storage {
        StorageConfig::Memory => {
            let counters = Arc::new(InMemoryCounterStore::new());
            spawn_counter_eviction(Arc::downgrade(&counters), COUNTER_EVICTION_INTERVAL);
            tracing::info!("Using in-memory storage for quotas, rate limits, and cache");
            Ok(Storage {
                counters,
                rate_limits: Arc::new(LocalRateLimitStore::new(config.rate_limits.algorithm)),
                cache: ResponseCache::from_config(&config.cache),
            })
        }
        StorageConfig::Redis { url, key_prefix } => {
            let conn = redis_client::connect(url).await?;
            let cache = if config.cache.enabled {
                ResponseCache::new(Arc::new(RedisCacheStore::new(
                    conn.clone(),
                    key_prefix.clone(),
                    config.cache.ttl(),
                )))
            } else {
                ResponseCache::disabled()
            };
            tracing::info!("Using Redis storage with key prefix `{key_prefix}`");
            Ok(Storage {
                counters: Arc::new(RedisCounterStore::new(conn.clone(), key_prefix.clone())),
                rate_limits: Arc::new(RedisRateLimitStore::new(
                    conn,
                    key_prefix.clone(),
                    Duration::from_millis(config.rate_limits.redis_timeout_ms),
                )),
                cache,
            })
        }
    }
}

const COUNTER_EVICTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Drops quota counters from previous days. Stops when the store is dropped.
fn spawn_counter_eviction(store: Weak<InMemoryCounterStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(store) = store.upgrade() else {
                break;
            };
            store.evict_stale(Utc::now().date_naive());
        }
    })
}

/// Custom Axum extractor that validates the JSON body and deserializes it into a custom type
///
/// When this extractor is present, we don't check if the `Content-Type` header is `application/json`,
/// and instead simply assume that the request body is a JSON object.
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    #[instrument(skip_all, level = "trace", name = "StructuredJson::from_request")]
    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = axum::body::Bytes::from_request(req, state)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::JsonRequest {
                    message: format!("{} ({})", e, e.status()),
                })
            })?;

        let value = Json::<serde_json::Value>::from_bytes(&bytes)
            .map_err(|e| {
                Error::new(ErrorDetails::JsonRequest {
                    message: format!("{} ({})", e, e.status()),
                })
            })?
            .0;

        // `serde_path_to_error` names the offending field in the message
        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}

/// Per-attempt timeouts are set on each upstream request; this only bounds runaway streams.
pub const DEFAULT_HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub fn setup_http_client() -> Result<Client, Error> {
    Client::builder()
        .timeout(DEFAULT_HTTP_CLIENT_TIMEOUT)
        .build()
        .map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to build HTTP client: {e}"),
            })
        })
}
