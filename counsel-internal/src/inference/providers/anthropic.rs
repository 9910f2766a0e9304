use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use futures::StreamExt;
use reqwest_eventsource::{retry::Never, Event, EventSource, RequestBuilderExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config_parser::UpstreamConfig;
use crate::error::{DisplayOrDebugGateway, Error, ErrorDetails};
use crate::inference::types::{
    ChatMessage, CompletionRequest, CompletionResponse, CompletionStream, StreamChunk, Usage,
};
use crate::inference::LlmProvider;

const PROVIDER_TYPE: &str = "anthropic";
const DEFAULT_API_BASE: &str = "https://api.anthropic.com/";
const MESSAGES_PATH: &str = "v1/messages";

/// Client for the Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    messages_url: Url,
    api_key: Option<SecretString>,
    anthropic_version: String,
    timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(
        client: reqwest::Client,
        api_base: &Url,
        api_key: Option<SecretString>,
        anthropic_version: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        Ok(Self {
            client,
            messages_url: get_messages_url(api_base)?,
            api_key,
            anthropic_version: anthropic_version.into(),
            timeout,
        })
    }

    /// Reads the API key from the environment variable named in `config`.
    /// A missing key is not fatal here; requests fail with `MISSING_API_KEY` instead.
    pub fn from_config(config: &UpstreamConfig, client: reqwest::Client) -> Result<Self, Error> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from);
        if api_key.is_none() {
            tracing::warn!(
                "Environment variable `{}` is not set; AI requests will fail until it is",
                config.api_key_env
            );
        }
        let default_base;
        let api_base = match &config.api_base {
            Some(api_base) => api_base,
            None => {
                default_base = Url::parse(DEFAULT_API_BASE).map_err(|e| {
                    Error::new(ErrorDetails::Config {
                        message: format!("Invalid default Anthropic API base: {e}"),
                    })
                })?;
                &default_base
            }
        };
        Self::new(
            client,
            api_base,
            api_key,
            config.anthropic_version.clone(),
            Duration::from_millis(config.timeout_ms),
        )
    }

    fn api_key(&self) -> Result<&SecretString, Error> {
        self.api_key.as_ref().ok_or_else(|| {
            Error::new(ErrorDetails::MissingApiKey {
                provider_name: PROVIDER_TYPE.to_string(),
            })
        })
    }

    fn request_builder(
        &self,
        body: &AnthropicRequest<'_>,
    ) -> Result<reqwest::RequestBuilder, Error> {
        let api_key = self.api_key()?;
        Ok(self
            .client
            .post(self.messages_url.clone())
            .header("Content-Type", "application/json")
            .header("x-api-key", api_key.expose_secret())
            .header("anthropic-version", &self.anthropic_version)
            .json(body))
    }
}

fn get_messages_url(api_base: &Url) -> Result<Url, Error> {
    let mut base = api_base.clone();
    if !base.path().ends_with('/') {
        base.set_path(&format!("{}/", base.path()));
    }
    base.join(MESSAGES_PATH).map_err(|e| {
        Error::new(ErrorDetails::Config {
            message: format!("Invalid Anthropic API base `{api_base}`: {e}"),
        })
    })
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        PROVIDER_TYPE
    }

    fn check_credentials(&self) -> Result<(), Error> {
        self.api_key().map(|_| ())
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, Error> {
        let body = AnthropicRequest::new(request, false);
        let res = self
            .request_builder(&body)?
            .timeout(self.timeout)
            .send()
            .await
            .map_err(handle_reqwest_error)?;

        let status = res.status();
        let raw_response = res.text().await.map_err(handle_reqwest_error)?;
        if !status.is_success() {
            return Err(handle_anthropic_error(status, raw_response));
        }

        let response: AnthropicResponse = serde_json::from_str(&raw_response).map_err(|e| {
            Error::new(ErrorDetails::InvalidProviderResponse {
                message: format!("Error parsing response: {}", DisplayOrDebugGateway::new(e)),
                provider_type: PROVIDER_TYPE.to_string(),
                raw_response: Some(raw_response.clone()),
            })
        })?;
        response.try_into()
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream, Error> {
        let body = AnthropicRequest::new(request, true);
        let mut event_source = self.request_builder(&body)?.eventsource().map_err(|e| {
            Error::new(ErrorDetails::InferenceClient {
                message: format!("Error building streaming request: {e:?}"),
                status_code: None,
                provider_type: PROVIDER_TYPE.to_string(),
                raw_response: None,
            })
        })?;
        // Reconnection is decided by the caller's retry policy
        event_source.set_retry_policy(Box::new(Never));

        match tokio::time::timeout(self.timeout, event_source.next()).await {
            Ok(Some(Ok(Event::Open))) => {}
            Ok(Some(Ok(Event::Message(_)))) | Ok(None) => {
                event_source.close();
                return Err(stream_error("Stream closed before it was opened".to_string()));
            }
            Ok(Some(Err(e))) => {
                event_source.close();
                return Err(handle_event_source_error(e).await);
            }
            Err(_) => {
                event_source.close();
                return Err(Error::new(ErrorDetails::InferenceTimeout {
                    provider_type: PROVIDER_TYPE.to_string(),
                }));
            }
        }

        Ok(Box::pin(stream_anthropic(event_source)))
    }
}

fn stream_anthropic(
    mut event_source: EventSource,
) -> impl futures::Stream<Item = Result<StreamChunk, Error>> + Send {
    async_stream::stream! {
        let mut model = String::new();
        let mut usage = Usage::default();
        let mut finished = false;
        while let Some(event) = event_source.next().await {
            let message = match event {
                Ok(Event::Open) => continue,
                Ok(Event::Message(message)) => message,
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => {
                    yield Err(handle_event_source_error(e).await);
                    finished = true;
                    break;
                }
            };
            match serde_json::from_str::<AnthropicStreamEvent>(&message.data) {
                Ok(AnthropicStreamEvent::MessageStart { message }) => {
                    model = message.model;
                    usage.input_tokens = message.usage.input_tokens;
                    usage.output_tokens = message.usage.output_tokens;
                }
                Ok(AnthropicStreamEvent::ContentBlockDelta {
                    delta: AnthropicDelta::TextDelta { text },
                }) => yield Ok(StreamChunk::Delta(text)),
                Ok(AnthropicStreamEvent::ContentBlockDelta { .. }) => {}
                Ok(AnthropicStreamEvent::MessageDelta { usage: delta }) => {
                    usage.output_tokens = delta.output_tokens;
                }
                Ok(AnthropicStreamEvent::MessageStop) => {
                    yield Ok(StreamChunk::Done {
                        model: std::mem::take(&mut model),
                        usage,
                    });
                    finished = true;
                    break;
                }
                Ok(AnthropicStreamEvent::Error { error }) => {
                    yield Err(stream_error(error.message));
                    finished = true;
                    break;
                }
                Ok(AnthropicStreamEvent::Other) => {}
                Err(e) => {
                    tracing::warn!("Skipping unparseable Anthropic stream event: {e}");
                }
            }
        }
        event_source.close();
        if !finished {
            yield Err(stream_error("Stream ended before completion".to_string()));
        }
    }
}

fn stream_error(message: String) -> Error {
    Error::new(ErrorDetails::InferenceServer {
        message,
        status_code: None,
        provider_type: PROVIDER_TYPE.to_string(),
        raw_response: None,
    })
}

fn handle_reqwest_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        return Error::new(ErrorDetails::InferenceTimeout {
            provider_type: PROVIDER_TYPE.to_string(),
        });
    }
    Error::new(ErrorDetails::InferenceServer {
        message: format!(
            "Error sending request: {}",
            DisplayOrDebugGateway::new(&e)
        ),
        status_code: e.status(),
        provider_type: PROVIDER_TYPE.to_string(),
        raw_response: None,
    })
}

async fn handle_event_source_error(e: reqwest_eventsource::Error) -> Error {
    match e {
        reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
            let raw_response = response.text().await.unwrap_or_default();
            handle_anthropic_error(status, raw_response)
        }
        reqwest_eventsource::Error::Transport(e) => handle_reqwest_error(e),
        e => stream_error(format!(
            "Error in event stream: {}",
            DisplayOrDebugGateway::new(e)
        )),
    }
}

/// 5xx (including Anthropic's 529 "overloaded") are server errors; everything else
/// is a client error, of which only 429 is worth retrying.
fn handle_anthropic_error(status: StatusCode, raw_response: String) -> Error {
    let message = serde_json::from_str::<AnthropicErrorBody>(&raw_response)
        .map(|body| body.error.message)
        .unwrap_or_else(|_| format!("Upstream returned {status}"));
    if status.is_server_error() {
        Error::new(ErrorDetails::InferenceServer {
            message,
            status_code: Some(status),
            provider_type: PROVIDER_TYPE.to_string(),
            raw_response: Some(raw_response),
        })
    } else {
        Error::new(ErrorDetails::InferenceClient {
            message,
            status_code: Some(status),
            provider_type: PROVIDER_TYPE.to_string(),
            raw_response: Some(raw_response),
        })
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

impl<'a> AnthropicRequest<'a> {
    fn new(request: &'a CompletionRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: &request.system,
            messages: &request.messages,
            stream,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    usage: AnthropicUsage,
}

impl TryFrom<AnthropicResponse> for CompletionResponse {
    type Error = Error;

    fn try_from(response: AnthropicResponse) -> Result<Self, Self::Error> {
        let content: String = response
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text),
                AnthropicContentBlock::Other => None,
            })
            .collect();
        if content.trim().is_empty() {
            return Err(Error::new(ErrorDetails::EmptyResponse {
                provider_type: PROVIDER_TYPE.to_string(),
            }));
        }
        Ok(CompletionResponse {
            content,
            model: response.model,
            usage: Usage {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamMessage {
    model: String,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart {
        message: AnthropicStreamMessage,
    },
    ContentBlockDelta {
        delta: AnthropicDelta,
    },
    MessageDelta {
        #[serde(default)]
        usage: AnthropicUsage,
    },
    MessageStop,
    Error {
        error: AnthropicErrorDetail,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    error: AnthropicErrorDetail,
}
