//! The question-answering pipeline.
//!
//! Every request runs the same ordered stages:
//! auth, upstream credential check, quota (check-and-consume), rate limit,
//! input validation, input moderation, cache lookup, upstream call with retry,
//! output moderation, cache store, confidence scoring, and finally the usage record.
//!
//! Stages return `Result<_, Halt>`; the first halt ends the request. Authenticated
//! requests produce exactly one usage record whatever the outcome.

pub mod outcome;
pub mod stream;
pub mod types;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use uuid::Uuid;

use crate::auth::{AuthResolver, AuthenticatedUser};
use crate::cache::ResponseCache;
use crate::config_parser::Config;
use crate::confidence;
use crate::error::{Error, ErrorCode, ErrorDetails};
use crate::inference::types::{ChatMessage, CompletionRequest, CompletionResponse, Role};
use crate::inference::LlmProvider;
use crate::moderation::{check_legal_context, ensure_legal_disclaimer, moderate_input, moderate_output};
use crate::plan::{PlanLimits, PlanTable};
use crate::prompt::{system_prompt, Category};
use crate::rate_limit::{RateLimitDecision, RateLimitHeaders, RateLimiter};
use crate::retry::{with_retry, RetryConfig};
use crate::usage_limit::QuotaTracker;
use crate::usage_log::{Endpoint, UsageLogger, UsageRecord};
use crate::validation::{sanitize, validate_input};

pub use outcome::{Answered, Failure, Halt, Rejection};
pub use stream::EventStream;
pub use types::{
    AskRequest, AskResponse, ChatRequest, ChatResponse, StreamEvent, UsageSummary,
};

use types::Answer;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Used when the caller's plan has no model override
    pub default_model: String,
    pub temperature: f32,
    pub max_question_length: usize,
    /// Chat turns forwarded upstream, including the current question
    pub max_chat_history: usize,
    pub retry: RetryConfig,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_model: config.upstream.model.clone(),
            temperature: config.upstream.temperature,
            max_question_length: config.gateway.max_question_length,
            max_chat_history: config.gateway.max_chat_history,
            retry: config.upstream.retry.clone(),
        }
    }
}

/// All collaborators are injected so each can be replaced in tests.
pub struct Pipeline {
    pub auth: AuthResolver,
    pub quota: Arc<QuotaTracker>,
    pub rate_limiter: Arc<RateLimiter>,
    pub cache: ResponseCache,
    pub provider: Arc<dyn LlmProvider>,
    pub usage_logger: Arc<dyn UsageLogger>,
    pub plans: PlanTable,
    pub settings: PipelineSettings,
}

struct RequestContext {
    request_id: Uuid,
    user: AuthenticatedUser,
    endpoint: Endpoint,
    category: Category,
    started: Instant,
    rate_limit: Option<RateLimitHeaders>,
    model: Option<String>,
}

/// A question that passed every pre-upstream stage.
struct Admitted {
    question: String,
    limits: PlanLimits,
}

impl Pipeline {
    pub async fn ask(
        &self,
        bearer: Option<&str>,
        request: AskRequest,
    ) -> Result<Answered<AskResponse>, Failure> {
        let mut ctx = self
            .authenticate(bearer, Endpoint::Ask, request.category)
            .await?;
        let result = AssertUnwindSafe(self.answer_question(&mut ctx, &request.question))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Halt::Failed(panic_error(panic))));
        let answered = self.finish(ctx, result)?;
        let answer = answered.body;
        Ok(Answered {
            body: AskResponse {
                question: answer.question,
                answer: answer.content,
                confidence: answer.confidence,
                model: answer.model,
            },
            rate_limit: answered.rate_limit,
        })
    }

    pub async fn chat(
        &self,
        bearer: Option<&str>,
        request: ChatRequest,
    ) -> Result<Answered<ChatResponse>, Failure> {
        let mut ctx = self
            .authenticate(bearer, Endpoint::Chat, request.category)
            .await?;
        let result = AssertUnwindSafe(self.answer_chat(&mut ctx, request.messages))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Halt::Failed(panic_error(panic))));
        let answered = self.finish(ctx, result)?;
        let answer = answered.body;
        Ok(Answered {
            body: ChatResponse {
                answer: answer.content,
                confidence: answer.confidence,
                model: answer.model,
            },
            rate_limit: answered.rate_limit,
        })
    }

    /// Terminal outcome for a request whose body could not be parsed.
    /// Authentication still comes first, so an anonymous caller gets `UNAUTHORIZED`.
    pub async fn reject_body(
        &self,
        bearer: Option<&str>,
        endpoint: Endpoint,
        error: Error,
    ) -> Failure {
        match self.authenticate(bearer, endpoint, Category::default()).await {
            Ok(ctx) => {
                self.record_usage(&ctx, Err(error.code()));
                Failure::new(error, None)
            }
            Err(failure) => failure,
        }
    }

    /// Unauthenticated requests stop here and leave no usage record.
    /// Today's usage for the caller. Reads the counter without counting a question.
    pub async fn usage(&self, bearer: Option<&str>) -> Result<UsageSummary, Error> {
        let user = self.auth.resolve(bearer).await.into_user()?;
        let quota = self.quota.usage(&user.id, user.plan).await?;
        Ok(UsageSummary {
            plan: user.plan,
            used: quota.used,
            limit: quota.limit,
            remaining: quota.remaining(),
        })
    }

    async fn authenticate(
        &self,
        bearer: Option<&str>,
        endpoint: Endpoint,
        category: Category,
    ) -> Result<RequestContext, Failure> {
        let started = Instant::now();
        match self.auth.resolve(bearer).await.into_user() {
            Ok(user) => Ok(RequestContext {
                request_id: Uuid::now_v7(),
                user,
                endpoint,
                category,
                started,
                rate_limit: None,
                model: None,
            }),
            Err(error) => {
                metrics::counter!(
                    "counsel_requests_total",
                    "endpoint" => endpoint.to_string(),
                    "outcome" => <&'static str>::from(ErrorCode::Unauthorized)
                )
                .increment(1);
                Err(Failure::new(error, None))
            }
        }
    }

    /// Runs every stage that precedes the cache lookup.
    async fn admit(&self, ctx: &mut RequestContext, question: &str) -> Result<Admitted, Halt> {
        // Before quota so a misconfigured deployment never charges anyone
        self.provider.check_credentials()?;

        let user_id = ctx.user.id.clone();
        let limits = self.plans.limits(ctx.user.plan);

        let quota = self.quota.check_usage_quota(&user_id, ctx.user.plan).await?;
        if !quota.within_quota {
            return Err(Rejection::QuotaExceeded {
                used: quota.used,
                limit: quota.limit.unwrap_or_default(),
            }
            .into());
        }

        let decision = self.rate_limiter.check(&user_id, &limits).await?;
        ctx.rate_limit = Some(decision.headers().clone());
        if let RateLimitDecision::Deny { retry_after, .. } = decision {
            return Err(Rejection::RateLimited {
                retry_after,
                limit: limits.rate_limit_max_requests,
            }
            .into());
        }

        let question = self.screen_question(ctx, question)?;

        Ok(Admitted { question, limits })
    }

    /// Validates and moderates one user-authored text, returning it sanitized.
    fn screen_question(&self, ctx: &RequestContext, question: &str) -> Result<String, Halt> {
        let verdict = validate_input(question, self.settings.max_question_length);
        let question = match (verdict.blocked, verdict.sanitized) {
            (false, Some(sanitized)) => sanitized,
            _ => {
                return Err(Rejection::InvalidInput {
                    reason: verdict
                        .reason
                        .unwrap_or_else(|| "Invalid question".to_string()),
                }
                .into())
            }
        };

        let moderation = moderate_input(&question);
        if moderation.blocked {
            tracing::warn!(
                request_id = %ctx.request_id,
                category = ?moderation.category,
                "Question blocked by moderation"
            );
            return Err(Rejection::ContentBlocked {
                reason: moderation
                    .reason
                    .unwrap_or_else(|| "This question cannot be answered".to_string()),
            }
            .into());
        }

        Ok(question)
    }

    async fn answer_question(
        &self,
        ctx: &mut RequestContext,
        question: &str,
    ) -> Result<Answer, Halt> {
        let admitted = self.admit(ctx, question).await?;

        if let Some(entry) = self.cache.get(&admitted.question, ctx.category).await {
            metrics::counter!("counsel_cache_hits_total").increment(1);
            ctx.model = Some(entry.model.clone());
            let (confidence, content) = deliver(&entry.content);
            return Ok(Answer {
                question: admitted.question,
                content,
                confidence,
                model: entry.model,
                cached: true,
                input_tokens: 0,
                output_tokens: 0,
            });
        }
        if self.cache.is_enabled() {
            metrics::counter!("counsel_cache_misses_total").increment(1);
        }

        let request = self.completion_request(
            ctx,
            &admitted.limits,
            vec![ChatMessage::user(admitted.question.clone())],
        );
        let completion = self.complete(&request).await?;
        let moderated = moderate(&completion.content);
        self.cache
            .set(&admitted.question, &moderated, &completion.model, ctx.category)
            .await;
        Ok(self.answer_from_completion(ctx, admitted.question, &moderated, completion))
    }

    /// Chat answers are never cached; the history makes every request unique.
    async fn answer_chat(
        &self,
        ctx: &mut RequestContext,
        messages: Vec<ChatMessage>,
    ) -> Result<Answer, Halt> {
        let Some((last, history)) = messages
            .split_last()
            .filter(|(last, _)| last.role == Role::User)
        else {
            return Err(Rejection::InvalidInput {
                reason: "Chat must end with a user message".to_string(),
            }
            .into());
        };
        let admitted = self.admit(ctx, &last.content).await?;

        // Earlier user turns reach the model too, so they pass the same screening
        let mut conversation =
            bounded_history(history, self.settings.max_chat_history.saturating_sub(1))
                .into_iter()
                .map(|message| match message.role {
                    Role::User => self
                        .screen_question(ctx, &message.content)
                        .map(ChatMessage::user),
                    Role::Assistant => Ok(message),
                })
                .collect::<Result<Vec<_>, Halt>>()?;
        conversation.push(ChatMessage::user(admitted.question.clone()));

        let request = self.completion_request(ctx, &admitted.limits, conversation);
        let completion = self.complete(&request).await?;
        let moderated = moderate(&completion.content);
        Ok(self.answer_from_completion(ctx, admitted.question, &moderated, completion))
    }

    fn completion_request(
        &self,
        ctx: &mut RequestContext,
        limits: &PlanLimits,
        messages: Vec<ChatMessage>,
    ) -> CompletionRequest {
        let model = limits
            .model
            .clone()
            .unwrap_or_else(|| self.settings.default_model.clone());
        ctx.model = Some(model.clone());
        CompletionRequest {
            system: system_prompt(ctx.category),
            messages,
            model,
            max_tokens: limits.max_tokens_per_request,
            temperature: self.settings.temperature,
        }
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, Error> {
        let started = Instant::now();
        let result = with_retry(&self.settings.retry, || self.provider.complete(request)).await;
        metrics::histogram!("counsel_upstream_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        result
    }

    fn answer_from_completion(
        &self,
        ctx: &mut RequestContext,
        question: String,
        moderated: &str,
        completion: CompletionResponse,
    ) -> Answer {
        ctx.model = Some(completion.model.clone());
        let (confidence, content) = deliver(moderated);
        Answer {
            question,
            content,
            confidence,
            model: completion.model,
            cached: false,
            input_tokens: completion.usage.input_tokens,
            output_tokens: completion.usage.output_tokens,
        }
    }

    fn finish(
        &self,
        ctx: RequestContext,
        result: Result<Answer, Halt>,
    ) -> Result<Answered<Answer>, Failure> {
        match result {
            Ok(answer) => {
                self.record_usage(&ctx, Ok(&answer));
                Ok(Answered {
                    body: answer,
                    rate_limit: ctx.rate_limit,
                })
            }
            Err(halt) => {
                self.record_usage(&ctx, Err(halt.code()));
                Err(Failure::new(halt.into_error(), ctx.rate_limit))
            }
        }
    }

    /// Writes the single usage record for a terminal outcome.
    fn record_usage(&self, ctx: &RequestContext, outcome: Result<&Answer, ErrorCode>) {
        let latency = ctx.started.elapsed();
        let (input_tokens, output_tokens, cached, model) = match outcome {
            Ok(answer) => (
                answer.input_tokens,
                answer.output_tokens,
                answer.cached,
                Some(answer.model.clone()),
            ),
            Err(_) => (0, 0, false, ctx.model.clone()),
        };
        let error_code = outcome.err();
        let endpoint = ctx.endpoint.to_string();

        metrics::counter!(
            "counsel_requests_total",
            "endpoint" => endpoint.clone(),
            "outcome" => error_code.map_or("success", <&'static str>::from)
        )
        .increment(1);
        metrics::histogram!("counsel_request_duration_seconds", "endpoint" => endpoint)
            .record(latency.as_secs_f64());
        if input_tokens > 0 || output_tokens > 0 {
            metrics::counter!("counsel_upstream_tokens_total", "direction" => "input")
                .increment(u64::from(input_tokens));
            metrics::counter!("counsel_upstream_tokens_total", "direction" => "output")
                .increment(u64::from(output_tokens));
        }

        self.usage_logger.log(UsageRecord {
            request_id: ctx.request_id,
            user_id: ctx.user.id.clone(),
            endpoint: ctx.endpoint,
            input_tokens,
            output_tokens,
            model,
            category: ctx.category,
            cached,
            latency_ms: latency.as_millis() as u64,
            success: error_code.is_none(),
            error_code,
            timestamp: Utc::now(),
        });
    }
}

/// Output moderation. Returns the original text when nothing was redacted.
fn moderate(answer: &str) -> String {
    moderate_output(answer)
        .filtered
        .unwrap_or_else(|| answer.to_string())
}

/// Scores a moderated answer, then appends the disclaimer.
/// Scoring comes first because the disclaimer itself contains hedging words.
fn deliver(moderated: &str) -> (f64, String) {
    let context = check_legal_context(moderated);
    for warning in &context.warnings {
        tracing::warn!("Legal context warning: {warning}");
    }
    let confidence = confidence::score(moderated, context.appropriate);
    (confidence, ensure_legal_disclaimer(moderated))
}

/// The most recent `keep` prior turns, sanitized, starting with a user turn.
fn bounded_history(history: &[ChatMessage], keep: usize) -> Vec<ChatMessage> {
    let start = history.len().saturating_sub(keep);
    history[start..]
        .iter()
        .filter_map(|message| {
            let content = sanitize(&message.content);
            (!content.is_empty()).then_some(ChatMessage {
                role: message.role,
                content,
            })
        })
        .skip_while(|message| message.role != Role::User)
        .collect()
}

fn panic_error(panic: Box<dyn Any + Send>) -> Error {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Error::new(ErrorDetails::InternalError {
        message: format!("Request handler panicked: {message}"),
    })
}
