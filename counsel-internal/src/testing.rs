#![cfg(test)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;

use crate::auth::{AuthResolver, AuthenticatedUser, CredentialVerifier};
use crate::cache::ResponseCache;
use crate::config_parser::Config;
use crate::error::{Error, ErrorDetails};
use crate::inference::types::{CompletionRequest, CompletionResponse, CompletionStream, StreamChunk, Usage};
use crate::inference::LlmProvider;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::plan::{PlanLimits, PlanTable, PlanTier};
use crate::rate_limit::{LocalRateLimitStore, RateLimitAlgorithm, RateLimitConfig, RateLimiter};
use crate::retry::RetryConfig;
use crate::usage_limit::{InMemoryCounterStore, QuotaConfig, QuotaTracker};
use crate::usage_log::{UsageLogger, UsageRecord};

pub const TEST_TOKEN: &str = "test-token";
pub const TEST_USER: &str = "user-1";
pub const MOCK_USAGE: Usage = Usage {
    input_tokens: 12,
    output_tokens: 34,
};

/// Upstream stand-in that counts calls and returns a fixed answer after any queued failures.
pub struct MockProvider {
    answer: String,
    has_credentials: bool,
    failures: Mutex<VecDeque<Error>>,
    calls: AtomicUsize,
    panics_mid_stream: bool,
}

impl MockProvider {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            has_credentials: true,
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            panics_mid_stream: false,
        }
    }

    pub fn without_credentials() -> Self {
        Self {
            has_credentials: false,
            ..Self::answering("unused")
        }
    }

    pub fn failing_first(self, failures: Vec<Error>) -> Self {
        Self {
            failures: Mutex::new(failures.into()),
            ..self
        }
    }

    /// Streams the first word, then panics instead of finishing.
    pub fn panicking_mid_stream(self) -> Self {
        Self {
            panics_mid_stream: true,
            ..self
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_failure(&self) -> Option<Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.failures.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn provider_name(&self) -> &str {
        "mock"
    }

    fn check_credentials(&self) -> Result<(), Error> {
        if self.has_credentials {
            Ok(())
        } else {
            Err(Error::new(ErrorDetails::MissingApiKey {
                provider_name: "mock".to_string(),
            }))
        }
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, Error> {
        if let Some(error) = self.next_failure() {
            return Err(error);
        }
        Ok(CompletionResponse {
            content: self.answer.clone(),
            model: request.model.clone(),
            usage: MOCK_USAGE,
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream, Error> {
        if let Some(error) = self.next_failure() {
            return Err(error);
        }
        if self.panics_mid_stream {
            let first = self.answer.split_inclusive(' ').next().unwrap_or_default();
            let delta = futures::stream::iter([Ok(StreamChunk::Delta(first.to_string()))]);
            let crash = futures::stream::poll_fn(|_| -> std::task::Poll<Option<Result<StreamChunk, Error>>> {
                panic!("upstream decoder crashed")
            });
            return Ok(Box::pin(delta.chain(crash)));
        }
        let mut chunks: Vec<Result<StreamChunk, Error>> = self
            .answer
            .split_inclusive(' ')
            .map(|word| Ok(StreamChunk::Delta(word.to_string())))
            .collect();
        chunks.push(Ok(StreamChunk::Done {
            model: request.model.clone(),
            usage: MOCK_USAGE,
        }));
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

pub fn upstream_error(status: u16) -> Error {
    let status_code = axum::http::StatusCode::from_u16(status).ok();
    if status >= 500 {
        Error::new(ErrorDetails::InferenceServer {
            message: "upstream failed".to_string(),
            status_code,
            provider_type: "mock".to_string(),
            raw_response: None,
        })
    } else {
        Error::new(ErrorDetails::InferenceClient {
            message: "upstream refused".to_string(),
            status_code,
            provider_type: "mock".to_string(),
            raw_response: None,
        })
    }
}

/// Keeps every record in memory.
#[derive(Default)]
pub struct RecordingUsageLogger {
    records: Mutex<Vec<UsageRecord>>,
}

impl RecordingUsageLogger {
    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl UsageLogger for RecordingUsageLogger {
    fn log(&self, record: UsageRecord) {
        self.records.lock().unwrap().push(record);
    }
}

/// Accepts a fixed set of tokens.
#[derive(Default)]
pub struct StaticVerifier {
    users: HashMap<String, AuthenticatedUser>,
}

impl StaticVerifier {
    pub fn with_user(mut self, token: &str, id: &str, plan: PlanTier) -> Self {
        self.users.insert(
            token.to_string(),
            AuthenticatedUser {
                id: id.to_string(),
                plan,
            },
        );
        self
    }
}

#[async_trait]
impl CredentialVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Option<AuthenticatedUser> {
        self.users.get(token).cloned()
    }
}

pub fn free_limits(max_questions_per_day: u32, rate_limit_max_requests: u32) -> PlanLimits {
    PlanLimits {
        max_questions_per_day: Some(max_questions_per_day),
        max_tokens_per_request: 1024,
        rate_limit_window_ms: 60_000,
        rate_limit_max_requests,
        model: None,
    }
}

/// A pipeline with in-memory stores, a recording usage logger, and one free-tier user
/// authenticated by [`TEST_TOKEN`].
pub struct TestPipeline {
    pub pipeline: Arc<Pipeline>,
    pub provider: Arc<MockProvider>,
    pub usage: Arc<RecordingUsageLogger>,
}

pub fn test_pipeline(provider: MockProvider, limits: PlanLimits) -> TestPipeline {
    let provider = Arc::new(provider);
    let usage = Arc::new(RecordingUsageLogger::default());
    let mut plans = PlanTable::new(HashMap::new());
    plans.insert(PlanTier::Free, limits);
    let config = Config::default();
    let settings = PipelineSettings {
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            factor: 2.0,
            jitter: false,
        },
        ..PipelineSettings::from_config(&config)
    };
    let pipeline = Pipeline {
        auth: AuthResolver::new(Arc::new(
            StaticVerifier::default().with_user(TEST_TOKEN, TEST_USER, PlanTier::Free),
        )),
        quota: Arc::new(QuotaTracker::new(
            Arc::new(InMemoryCounterStore::new()),
            plans.clone(),
            QuotaConfig::default(),
        )),
        rate_limiter: Arc::new(RateLimiter::new(
            Arc::new(LocalRateLimitStore::new(RateLimitAlgorithm::SlidingWindow)),
            RateLimitConfig::default(),
        )),
        cache: ResponseCache::from_config(&config.cache),
        provider: provider.clone(),
        usage_logger: usage.clone(),
        plans,
        settings,
    };
    TestPipeline {
        pipeline: Arc::new(pipeline),
        provider,
        usage,
    }
}
