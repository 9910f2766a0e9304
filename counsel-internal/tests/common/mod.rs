use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use counsel_internal::auth::{hash_api_key, ApiKeyConfig, Auth, AuthResolver};
use counsel_internal::cache::ResponseCache;
use counsel_internal::config_parser::Config;
use counsel_internal::endpoints;
use counsel_internal::error::{Error, ErrorDetails};
use counsel_internal::gateway_util::AppStateData;
use counsel_internal::inference::types::{
    CompletionRequest, CompletionResponse, CompletionStream, StreamChunk, Usage,
};
use counsel_internal::inference::LlmProvider;
use counsel_internal::pipeline::{Pipeline, PipelineSettings};
use counsel_internal::plan::{PlanLimits, PlanTable, PlanTier};
use counsel_internal::rate_limit::{LocalRateLimitStore, RateLimitAlgorithm, RateLimitConfig, RateLimiter};
use counsel_internal::retry::RetryConfig;
use counsel_internal::usage_limit::{InMemoryCounterStore, QuotaConfig, QuotaTracker};
use counsel_internal::usage_log::{UsageLogger, UsageRecord};

pub const API_KEY: &str = "sk-counsel-test";
pub const USER_ID: &str = "user-42";

pub const LANDLORD_ANSWER: &str = "In most states a landlord must give written notice before starting an eviction. The notice period depends on the reason for the eviction and on local law.";

/// Upstream stand-in with a call counter.
pub struct CountingProvider {
    answer: String,
    has_credentials: bool,
    failure_status: Option<StatusCode>,
    calls: AtomicUsize,
}

impl CountingProvider {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            has_credentials: true,
            failure_status: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn without_credentials() -> Self {
        Self {
            has_credentials: false,
            ..Self::answering("unused")
        }
    }

    pub fn failing_with(status: StatusCode) -> Self {
        Self {
            failure_status: Some(status),
            ..Self::answering("unused")
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn attempt(&self) -> Result<(), Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failure_status {
            Some(status) => Err(Error::new(ErrorDetails::InferenceClient {
                message: "rejected by upstream".to_string(),
                status_code: Some(status),
                provider_type: "counting".to_string(),
                raw_response: None,
            })),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LlmProvider for CountingProvider {
    fn provider_name(&self) -> &str {
        "counting"
    }

    fn check_credentials(&self) -> Result<(), Error> {
        if self.has_credentials {
            Ok(())
        } else {
            Err(Error::new(ErrorDetails::MissingApiKey {
                provider_name: "counting".to_string(),
            }))
        }
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, Error> {
        self.attempt()?;
        Ok(CompletionResponse {
            content: self.answer.clone(),
            model: request.model.clone(),
            usage: Usage {
                input_tokens: 40,
                output_tokens: 60,
            },
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream, Error> {
        self.attempt()?;
        let mut chunks: Vec<Result<StreamChunk, Error>> = self
            .answer
            .split_inclusive(". ")
            .map(|sentence| Ok(StreamChunk::Delta(sentence.to_string())))
            .collect();
        chunks.push(Ok(StreamChunk::Done {
            model: request.model.clone(),
            usage: Usage {
                input_tokens: 40,
                output_tokens: 60,
            },
        }));
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

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

pub struct TestGateway {
    pub router: Router,
    pub pipeline: Arc<Pipeline>,
    pub provider: Arc<CountingProvider>,
    pub usage: Arc<RecordingUsageLogger>,
}

pub fn free_plan(max_questions_per_day: u32, rate_limit_max_requests: u32) -> PlanLimits {
    PlanLimits {
        max_questions_per_day: Some(max_questions_per_day),
        max_tokens_per_request: 1024,
        rate_limit_window_ms: 60_000,
        rate_limit_max_requests,
        model: None,
    }
}

/// Router over a pipeline with in-memory stores and the real API key verifier.
/// [`API_KEY`] authenticates [`USER_ID`] on the free plan.
pub fn test_gateway(provider: CountingProvider, free: PlanLimits) -> TestGateway {
    let provider = Arc::new(provider);
    let usage = Arc::new(RecordingUsageLogger::default());
    let mut plans = PlanTable::new(HashMap::new());
    plans.insert(PlanTier::Free, free);

    let mut api_keys = HashMap::new();
    api_keys.insert(
        hash_api_key(API_KEY),
        ApiKeyConfig {
            user_id: USER_ID.to_string(),
            plan: Some("free".to_string()),
        },
    );

    let config = Arc::new(Config::default());
    let pipeline = Pipeline {
        auth: AuthResolver::new(Arc::new(Auth::new(api_keys, None))),
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
        settings: PipelineSettings {
            retry: RetryConfig {
                max_attempts: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
                factor: 1.0,
                jitter: false,
            },
            ..PipelineSettings::from_config(&config)
        },
    };
    let state = AppStateData::from_pipeline(config, pipeline);
    let pipeline = state.pipeline.clone();
    TestGateway {
        router: endpoints::router(state),
        pipeline,
        provider,
        usage,
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: axum::http::HeaderMap,
    pub body: String,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

pub async fn post(router: &Router, path: &str, api_key: Option<&str>, body: &str) -> TestResponse {
    let mut request = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(api_key) = api_key {
        request = request.header(header::AUTHORIZATION, format!("Bearer {api_key}"));
    }
    send(router, request.body(Body::from(body.to_string())).unwrap()).await
}

pub async fn get(router: &Router, path: &str, api_key: Option<&str>) -> TestResponse {
    let mut request = Request::builder().uri(path);
    if let Some(api_key) = api_key {
        request = request.header(header::AUTHORIZATION, format!("Bearer {api_key}"));
    }
    send(router, request.body(Body::empty()).unwrap()).await
}

async fn send(router: &Router, request: Request<Body>) -> TestResponse {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    TestResponse {
        status,
        headers,
        body: String::from_utf8(bytes.to_vec()).unwrap(),
    }
}

pub fn ask_body(question: &str, category: &str) -> String {
    serde_json::json!({ "question": question, "category": category }).to_string()
}
