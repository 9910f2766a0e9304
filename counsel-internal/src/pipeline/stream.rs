use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{FutureExt, Stream, StreamExt};

use crate::cache::CacheEntry;
use crate::error::{Error, ErrorCode, ErrorDetails};
use crate::inference::types::{ChatMessage, CompletionStream, StreamChunk, Usage};
use crate::moderation::moderate_output;
use crate::retry::with_retry;
use crate::usage_log::Endpoint;

use super::types::{Answer, AskRequest, StreamEvent};
use super::{deliver, panic_error, Answered, Failure, Halt, Pipeline, RequestContext};

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

enum StreamSource {
    Cached(CacheEntry),
    Upstream(CompletionStream),
}

impl Pipeline {
    /// Streaming variant of `ask`. Rejections before the upstream stream opens are
    /// returned as ordinary failures; later failures arrive as an `error` event.
    ///
    /// Output is moderated a sentence at a time, so text is released only once the
    /// sentence containing it is complete.
    pub async fn stream(
        self: Arc<Self>,
        bearer: Option<&str>,
        request: AskRequest,
    ) -> Result<Answered<EventStream>, Failure> {
        let mut ctx = self
            .authenticate(bearer, Endpoint::Stream, request.category)
            .await?;
        let opened = AssertUnwindSafe(self.open_stream(&mut ctx, &request.question))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Halt::Failed(panic_error(panic))));
        let (question, source) = match opened {
            Ok(opened) => opened,
            Err(halt) => {
                self.record_usage(&ctx, Err(halt.code()));
                return Err(Failure::new(halt.into_error(), ctx.rate_limit));
            }
        };

        let rate_limit = ctx.rate_limit.clone();
        let recorder = Arc::new(StreamRecorder::new(self, ctx));
        let events = match source {
            StreamSource::Cached(entry) => {
                cached_events(recorder.clone(), question, entry).boxed()
            }
            StreamSource::Upstream(upstream) => {
                upstream_events(recorder.clone(), question, upstream).boxed()
            }
        };
        let events = AssertUnwindSafe(events).catch_unwind().map(move |event| {
            event.unwrap_or_else(|panic| {
                let error = panic_error(panic);
                recorder.record(Err(error.code()));
                error_event(&error)
            })
        });
        Ok(Answered {
            body: Box::pin(events),
            rate_limit,
        })
    }

    async fn open_stream(
        &self,
        ctx: &mut RequestContext,
        question: &str,
    ) -> Result<(String, StreamSource), Halt> {
        let admitted = self.admit(ctx, question).await?;

        if let Some(entry) = self.cache.get(&admitted.question, ctx.category).await {
            metrics::counter!("counsel_cache_hits_total").increment(1);
            ctx.model = Some(entry.model.clone());
            return Ok((admitted.question, StreamSource::Cached(entry)));
        }
        if self.cache.is_enabled() {
            metrics::counter!("counsel_cache_misses_total").increment(1);
        }

        let request = self.completion_request(
            ctx,
            &admitted.limits,
            vec![ChatMessage::user(admitted.question.clone())],
        );
        let upstream =
            with_retry(&self.settings.retry, || self.provider.stream(&request)).await?;
        Ok((admitted.question, StreamSource::Upstream(upstream)))
    }
}

/// Writes the usage record for one stream exactly once, whichever way the stream ends.
struct StreamRecorder {
    pipeline: Arc<Pipeline>,
    ctx: RequestContext,
    recorded: AtomicBool,
}

impl StreamRecorder {
    fn new(pipeline: Arc<Pipeline>, ctx: RequestContext) -> Self {
        Self {
            pipeline,
            ctx,
            recorded: AtomicBool::new(false),
        }
    }

    fn record(&self, outcome: Result<&Answer, ErrorCode>) {
        if !self.recorded.swap(true, Ordering::SeqCst) {
            self.pipeline.record_usage(&self.ctx, outcome);
        }
    }
}

fn cached_events(
    recorder: Arc<StreamRecorder>,
    question: String,
    entry: CacheEntry,
) -> impl Stream<Item = StreamEvent> + Send {
    async_stream::stream! {
        let (confidence, content) = deliver(&entry.content);
        let answer = Answer {
            question,
            content,
            confidence,
            model: entry.model,
            cached: true,
            input_tokens: 0,
            output_tokens: 0,
        };
        yield StreamEvent::Delta { text: answer.content.clone() };
        recorder.record(Ok(&answer));
        yield done_event(answer);
    }
}

fn upstream_events(
    recorder: Arc<StreamRecorder>,
    question: String,
    mut upstream: CompletionStream,
) -> impl Stream<Item = StreamEvent> + Send {
    async_stream::stream! {
        let pipeline = &recorder.pipeline;
        let mut buffer = SentenceBuffer::default();
        let mut moderated = String::new();
        let mut finished: Option<Result<(String, Usage), Error>> = None;

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(StreamChunk::Delta(text)) => {
                    if let Some(sentences) = buffer.push(&text) {
                        let text = moderate_chunk(&sentences);
                        moderated.push_str(&text);
                        yield StreamEvent::Delta { text };
                    }
                }
                Ok(StreamChunk::Done { model, usage }) => {
                    finished = Some(Ok((model, usage)));
                    break;
                }
                Err(e) => {
                    finished = Some(Err(e));
                    break;
                }
            }
        }
        drop(upstream);

        let outcome = match finished {
            Some(Ok((model, usage))) => {
                if let Some(rest) = buffer.finish() {
                    let text = moderate_chunk(&rest);
                    moderated.push_str(&text);
                    yield StreamEvent::Delta { text };
                }
                if moderated.trim().is_empty() {
                    Err(Error::new(ErrorDetails::EmptyResponse {
                        provider_type: pipeline.provider.provider_name().to_string(),
                    }))
                } else {
                    Ok((model, usage))
                }
            }
            Some(Err(e)) => Err(e),
            None => Err(Error::new(ErrorDetails::InferenceServer {
                message: "Stream ended without a final message".to_string(),
                status_code: None,
                provider_type: pipeline.provider.provider_name().to_string(),
                raw_response: None,
            })),
        };

        match outcome {
            Ok((model, usage)) => {
                pipeline
                    .cache
                    .set(&question, &moderated, &model, recorder.ctx.category)
                    .await;
                let (confidence, delivered) = deliver(&moderated);
                let tail = delivered_tail(&moderated, &delivered);
                if !tail.is_empty() {
                    yield StreamEvent::Delta { text: tail.to_string() };
                }
                let content = format!("{moderated}{tail}");
                let answer = Answer {
                    question,
                    content,
                    confidence,
                    model,
                    cached: false,
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                };
                recorder.record(Ok(&answer));
                yield done_event(answer);
            }
            Err(error) => {
                recorder.record(Err(error.code()));
                yield error_event(&error);
            }
        }
    }
}

/// The text `deliver` appended after what was already streamed. The final answer is
/// the streamed text plus this tail, so the deltas always add up to it.
fn delivered_tail<'a>(streamed: &str, delivered: &'a str) -> &'a str {
    delivered
        .strip_prefix(streamed)
        .or_else(|| delivered.strip_prefix(streamed.trim_end()))
        .unwrap_or_default()
}

fn done_event(answer: Answer) -> StreamEvent {
    StreamEvent::Done {
        answer: answer.content,
        confidence: answer.confidence,
        model: answer.model,
        cached: answer.cached,
    }
}

fn error_event(error: &Error) -> StreamEvent {
    StreamEvent::Error {
        error: error.public_message(),
        code: error.code(),
    }
}

/// Holds streamed text until a sentence boundary so moderation sees whole sentences.
#[derive(Debug, Default)]
struct SentenceBuffer {
    pending: String,
}

impl SentenceBuffer {
    /// Appends `text` and releases everything up to the last sentence terminator.
    fn push(&mut self, text: &str) -> Option<String> {
        self.pending.push_str(text);
        let end = self.pending.rfind(['.', '!', '?', '\n'])? + 1;
        let rest = self.pending.split_off(end);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    fn finish(self) -> Option<String> {
        (!self.pending.is_empty()).then_some(self.pending)
    }
}

/// Moderates one released chunk, keeping the whitespace around it so chunks
/// still join up.
fn moderate_chunk(chunk: &str) -> String {
    match moderate_output(chunk).filtered {
        None => chunk.to_string(),
        Some(filtered) => {
            let leading = &chunk[..chunk.len() - chunk.trim_start().len()];
            let trailing = &chunk[chunk.trim_end().len()..];
            format!("{leading}{filtered}{trailing}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::has_legal_disclaimer;
    use crate::prompt::Category;
    use crate::testing::{
        free_limits, test_pipeline, upstream_error, MockProvider, TestPipeline, TEST_TOKEN,
    };

    const ANSWER: &str = "A lease can end early. I guarantee you will win this case. Ask the landlord in writing.";

    fn ask(question: &str) -> AskRequest {
        AskRequest {
            question: question.to_string(),
            category: Category::Contracts,
        }
    }

    fn deltas(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Delta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_stream_moderates_and_ends_with_done() {
        let TestPipeline {
            pipeline,
            provider,
            usage,
        } = test_pipeline(MockProvider::answering(ANSWER), free_limits(10, 10));

        let answered = pipeline
            .clone()
            .stream(Some(TEST_TOKEN), ask("Can I end my lease early?"))
            .await
            .unwrap();
        assert!(answered.rate_limit.is_some());
        let events: Vec<StreamEvent> = answered.body.collect().await;
        let Some(StreamEvent::Done {
            answer,
            confidence,
            cached,
            ..
        }) = events.last()
        else {
            panic!("stream should end with a done event: {events:?}");
        };
        assert!(!cached);
        assert!((0.6..=0.98).contains(confidence));
        assert!(has_legal_disclaimer(answer));
        assert!(!answer.contains("I guarantee"));
        assert_eq!(&deltas(&events), answer);
        assert_eq!(provider.calls(), 1);

        let records = usage.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].endpoint, Endpoint::Stream);
        assert_eq!(records[0].output_tokens, 34);
    }

    #[tokio::test]
    async fn test_stream_replays_cached_answer() {
        let TestPipeline {
            pipeline,
            provider,
            usage,
        } = test_pipeline(MockProvider::answering(ANSWER), free_limits(10, 10));

        let first: Vec<StreamEvent> = pipeline
            .clone()
            .stream(Some(TEST_TOKEN), ask("Can I end my lease early?"))
            .await
            .unwrap()
            .body
            .collect()
            .await;
        let second: Vec<StreamEvent> = pipeline
            .clone()
            .stream(Some(TEST_TOKEN), ask("can I end my lease   early?"))
            .await
            .unwrap()
            .body
            .collect()
            .await;
        assert_eq!(provider.calls(), 1);
        assert_eq!(deltas(&first), deltas(&second));
        assert!(matches!(second.last(), Some(StreamEvent::Done { cached: true, .. })));
        let records = usage.records();
        assert!(records[1].cached);
        assert_eq!(records[1].output_tokens, 0);
    }

    #[tokio::test]
    async fn test_stream_rejections_happen_before_the_stream() {
        let TestPipeline {
            pipeline, provider, ..
        } = test_pipeline(MockProvider::answering(ANSWER), free_limits(10, 10));
        let failure = pipeline
            .clone()
            .stream(Some(TEST_TOKEN), ask("How do I launder money through a lease?"))
            .await
            .err()
            .unwrap();
        assert_eq!(failure.code(), ErrorCode::ContentBlocked);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_stream_open_failure_is_api_error() {
        let provider = MockProvider::answering(ANSWER).failing_first(vec![upstream_error(401)]);
        let TestPipeline {
            pipeline, usage, ..
        } = test_pipeline(provider, free_limits(10, 10));
        let failure = pipeline
            .clone()
            .stream(Some(TEST_TOKEN), ask("Can I end my lease early?"))
            .await
            .err()
            .unwrap();
        assert_eq!(failure.code(), ErrorCode::ApiError);
        assert_eq!(usage.records()[0].error_code, Some(ErrorCode::ApiError));
    }

    #[tokio::test]
    async fn test_stream_deltas_add_up_when_answer_ends_in_whitespace() {
        let TestPipeline { pipeline, .. } = test_pipeline(
            MockProvider::answering("A lease can end early. Give notice in writing. "),
            free_limits(10, 10),
        );
        let events: Vec<StreamEvent> = pipeline
            .clone()
            .stream(Some(TEST_TOKEN), ask("Can I end my lease early?"))
            .await
            .unwrap()
            .body
            .collect()
            .await;
        let Some(StreamEvent::Done { answer, .. }) = events.last() else {
            panic!("stream should end with a done event: {events:?}");
        };
        assert!(has_legal_disclaimer(answer));
        assert_eq!(&deltas(&events), answer);
    }

    #[tokio::test]
    async fn test_stream_panic_is_recorded_once() {
        let TestPipeline {
            pipeline, usage, ..
        } = test_pipeline(
            MockProvider::answering(ANSWER).panicking_mid_stream(),
            free_limits(10, 10),
        );
        let events: Vec<StreamEvent> = pipeline
            .clone()
            .stream(Some(TEST_TOKEN), ask("Can I end my lease early?"))
            .await
            .unwrap()
            .body
            .collect()
            .await;
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error {
                code: ErrorCode::InternalError,
                ..
            })
        ));
        let records = usage.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].endpoint, Endpoint::Stream);
        assert_eq!(records[0].error_code, Some(ErrorCode::InternalError));
    }

    #[test]
    fn test_delivered_tail() {
        let disclaimer = "\n\nThis is general information, not legal advice.";
        let delivered = format!("Give notice.{disclaimer}");
        assert_eq!(delivered_tail("Give notice.", &delivered), disclaimer);
        assert_eq!(delivered_tail("Give notice. ", &delivered), disclaimer);
        assert_eq!(delivered_tail(&delivered, &delivered), "");
    }

    #[test]
    fn test_sentence_buffer_releases_complete_sentences() {
        let mut buffer = SentenceBuffer::default();
        assert_eq!(buffer.push("Tenants have"), None);
        assert_eq!(
            buffer.push(" rights. Landlords"),
            Some("Tenants have rights.".to_string())
        );
        assert_eq!(
            buffer.push(" must give notice!\nAlso"),
            Some(" Landlords must give notice!\n".to_string())
        );
        assert_eq!(buffer.finish(), Some("Also".to_string()));
    }

    #[test]
    fn test_sentence_buffer_empty_finish() {
        let mut buffer = SentenceBuffer::default();
        assert_eq!(buffer.push("Done."), Some("Done.".to_string()));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_moderate_chunk_keeps_surrounding_whitespace() {
        assert_eq!(moderate_chunk(" Plain text. "), " Plain text. ");
        let moderated = moderate_chunk(" I guarantee you will win this case. ");
        assert!(moderated.starts_with(' '));
        assert!(moderated.ends_with(' '));
        assert!(!moderated.contains("guarantee you will win"));
    }
}
