use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Bounded exponential backoff for upstream calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f32,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    2000
}

fn default_factor() -> f32 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            factor: default_factor(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn get_backoff(&self) -> ExponentialBuilder {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.initial_backoff_ms))
            .with_max_delay(Duration::from_millis(self.max_backoff_ms))
            .with_factor(self.factor)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize);
        if self.jitter {
            backoff.with_jitter()
        } else {
            backoff
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable [`Error`],
/// or the attempt budget in `config` is spent.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    with_retry_when(config, operation, Error::is_retryable).await
}

/// Generic form of [`with_retry`] with an explicit retryability predicate.
pub async fn with_retry_when<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    operation
        .retry(config.get_backoff())
        .when(is_retryable)
        .notify(|err: &E, delay: Duration| {
            tracing::warn!(
                delay_ms = delay.as_millis() as u64,
                "Retrying after transient failure: {err}"
            );
        })
        .await
}
