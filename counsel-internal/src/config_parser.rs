use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use url::Url;

use crate::auth::AuthConfig;
use crate::cache::CacheConfig;
use crate::error::{Error, ErrorDetails};
use crate::plan::{PlanLimits, PlanTable, PlanTier};
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryConfig;
use crate::usage_limit::QuotaConfig;
use crate::usage_log::UsageLogConfig;

pub const DEFAULT_MAX_QUESTION_LENGTH: usize = 2000;
pub const DEFAULT_MAX_CHAT_HISTORY: usize = 20;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub plans: PlanTable,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    pub rate_limits: RateLimitConfig,
    pub quota: QuotaConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub usage_log: UsageLogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_max_question_length")]
    pub max_question_length: usize,
    /// Number of most recent chat turns forwarded upstream
    #[serde(default = "default_max_chat_history")]
    pub max_chat_history: usize,
}

fn default_max_question_length() -> usize {
    DEFAULT_MAX_QUESTION_LENGTH
}

fn default_max_chat_history() -> usize {
    DEFAULT_MAX_CHAT_HISTORY
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            debug: false,
            max_question_length: default_max_question_length(),
            max_chat_history: default_max_chat_history(),
        }
    }
}

/// Settings for the upstream Anthropic Messages API.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Defaults to `https://api.anthropic.com`
    pub api_base: Option<Url>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Applied to each attempt separately
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_model() -> String {
    "claude-3-5-haiku-20241022".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_anthropic_version() -> String {
    "2023-06-01".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            model: default_model(),
            temperature: default_temperature(),
            timeout_ms: default_timeout_ms(),
            api_key_env: default_api_key_env(),
            anthropic_version: default_anthropic_version(),
            retry: RetryConfig::default(),
        }
    }
}

/// Backend for the quota counters, rate-limit windows, and response cache.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    #[default]
    Memory,
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

fn default_key_prefix() -> String {
    "counsel:".to_string()
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct UninitializedConfig {
    #[serde(default)]
    gateway: GatewayConfig,
    #[serde(default)]
    plans: HashMap<PlanTier, PlanLimits>,
    #[serde(default)]
    upstream: UpstreamConfig,
    #[serde(default)]
    cache: CacheConfig,
    #[serde(default)]
    rate_limits: RateLimitConfig,
    #[serde(default)]
    quota: QuotaConfig,
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    auth: AuthConfig,
    #[serde(default)]
    usage_log: UsageLogConfig,
}

impl Config {
    pub async fn load_and_verify_from_path(path: &Path) -> Result<Self, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        let config = Self::from_toml_str(&contents)?;
        tracing::info!("Loaded config from `{}`", path.display());
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, Error> {
        let uninitialized: UninitializedConfig = toml::from_str(contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file: {e}"),
            })
        })?;
        let config = uninitialized.load();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.gateway.max_question_length == 0 {
            return Err(config_error("`gateway.max_question_length` must be positive"));
        }
        if self.gateway.max_chat_history == 0 {
            return Err(config_error("`gateway.max_chat_history` must be positive"));
        }
        for tier in self.plans.tiers() {
            let limits = self.plans.limits(*tier);
            if limits.rate_limit_max_requests == 0 || limits.rate_limit_window_ms == 0 {
                return Err(config_error(&format!(
                    "`plans.{tier}` must allow at least one request per non-empty window"
                )));
            }
            if limits.max_tokens_per_request == 0 {
                return Err(config_error(&format!(
                    "`plans.{tier}.max_tokens_per_request` must be positive"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.upstream.temperature) {
            return Err(config_error("`upstream.temperature` must be in [0, 1]"));
        }
        if self.upstream.retry.max_attempts == 0 {
            return Err(config_error("`upstream.retry.max_attempts` must be at least 1"));
        }
        if self.upstream.retry.initial_backoff_ms > self.upstream.retry.max_backoff_ms {
            return Err(config_error(
                "`upstream.retry.initial_backoff_ms` cannot exceed `max_backoff_ms`",
            ));
        }
        if self.cache.enabled && self.cache.max_capacity == 0 {
            return Err(config_error("`cache.max_capacity` must be positive"));
        }
        Ok(())
    }
}

fn config_error(message: &str) -> Error {
    Error::new(ErrorDetails::Config {
        message: message.to_string(),
    })
}

impl UninitializedConfig {
    fn load(self) -> Config {
        // Tiers omitted from the file keep their built-in limits
        let mut plans = PlanTable::default();
        for (tier, limits) in self.plans {
            plans.insert(tier, limits);
        }
        Config {
            gateway: self.gateway,
            plans,
            upstream: self.upstream,
            cache: self.cache,
            rate_limits: self.rate_limits,
            quota: self.quota,
            storage: self.storage,
            auth: self.auth,
            usage_log: self.usage_log,
        }
    }
}
