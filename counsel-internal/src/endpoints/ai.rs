//! Handlers for the question-answering endpoints.
//!
//! Handlers only extract the bearer token and body. Every stage runs in the pipeline.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::debug_handler;
use futures::StreamExt;

use crate::auth::bearer_token;
use crate::error::Error;
use crate::gateway_util::{AppState, AppStateData, StructuredJson};
use crate::pipeline::{AskRequest, ChatRequest, Failure};
use crate::rate_limit::RateLimitHeaders;
use crate::usage_log::Endpoint;

/// `POST /api/ai/ask`
#[debug_handler(state = AppStateData)]
pub async fn ask_handler(
    State(AppStateData { pipeline, .. }): AppState,
    headers: HeaderMap,
    body: Result<StructuredJson<AskRequest>, Error>,
) -> Result<Response, Failure> {
    let bearer = bearer_token(&headers);
    let request = match body {
        Ok(StructuredJson(request)) => request,
        Err(e) => return Err(pipeline.reject_body(bearer, Endpoint::Ask, e).await),
    };
    let answered = pipeline.ask(bearer, request).await?;
    Ok((rate_limit_headers(answered.rate_limit.as_ref()), Json(answered.body)).into_response())
}

/// `POST /api/ai/chat`
#[debug_handler(state = AppStateData)]
pub async fn chat_handler(
    State(AppStateData { pipeline, .. }): AppState,
    headers: HeaderMap,
    body: Result<StructuredJson<ChatRequest>, Error>,
) -> Result<Response, Failure> {
    let bearer = bearer_token(&headers);
    let request = match body {
        Ok(StructuredJson(request)) => request,
        Err(e) => return Err(pipeline.reject_body(bearer, Endpoint::Chat, e).await),
    };
    let answered = pipeline.chat(bearer, request).await?;
    Ok((rate_limit_headers(answered.rate_limit.as_ref()), Json(answered.body)).into_response())
}

/// `POST /api/ai/stream`
///
/// Rejections that happen before the upstream stream opens are plain JSON errors.
/// After that the body is `text/event-stream` and failures arrive as an `error` event.
#[debug_handler(state = AppStateData)]
pub async fn stream_handler(
    State(AppStateData { pipeline, .. }): AppState,
    headers: HeaderMap,
    body: Result<StructuredJson<AskRequest>, Error>,
) -> Result<Response, Failure> {
    let bearer = bearer_token(&headers);
    let request = match body {
        Ok(StructuredJson(request)) => request,
        Err(e) => return Err(pipeline.reject_body(bearer, Endpoint::Stream, e).await),
    };
    let answered = pipeline.stream(bearer, request).await?;
    let events = answered
        .body
        .map(|event| Event::default().event(event.event_name()).json_data(&event));
    Ok((
        rate_limit_headers(answered.rate_limit.as_ref()),
        Sse::new(events).keep_alive(KeepAlive::new()),
    )
        .into_response())
}

fn rate_limit_headers(rate_limit: Option<&RateLimitHeaders>) -> HeaderMap {
    rate_limit
        .map(RateLimitHeaders::to_header_map)
        .unwrap_or_default()
}
