use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::auth::bearer_token;
use crate::error::Error;
use crate::gateway_util::{AppState, AppStateData};
use crate::pipeline::UsageSummary;

pub const COUNSEL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A handler for a simple liveness check
pub async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSummary>,
}

/// A handler reporting the running version, plus today's usage when the caller
/// presents a bearer token. A token that fails to verify is rejected.
pub async fn status_handler(
    State(AppStateData { pipeline, .. }): AppState,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, Error> {
    let usage = match bearer_token(&headers) {
        Some(token) => Some(pipeline.usage(Some(token)).await?),
        None => None,
    };
    Ok(Json(StatusResponse {
        status: "ok",
        version: COUNSEL_VERSION,
        usage,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::header::AUTHORIZATION;

    use super::*;
    use crate::config_parser::Config;
    use crate::error::ErrorCode;
    use crate::testing::{free_limits, test_pipeline, MockProvider, TestPipeline, TEST_TOKEN};

    fn state() -> AppStateData {
        let TestPipeline { pipeline, .. } =
            test_pipeline(MockProvider::answering("unused"), free_limits(3, 10));
        AppStateData {
            config: Arc::new(Config::default()),
            pipeline,
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn test_health_handler() {
        let Json(body) = health_handler().await;
        assert_eq!(body, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_status_handler_reports_version() {
        let Json(body) = status_handler(State(state()), HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(body.version, COUNSEL_VERSION);
        assert!(body.usage.is_none());
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({ "status": "ok", "version": COUNSEL_VERSION })
        );
    }

    #[tokio::test]
    async fn test_status_handler_reports_usage() {
        let Json(body) = status_handler(State(state()), bearer(TEST_TOKEN))
            .await
            .unwrap();
        let usage = body.usage.unwrap();
        assert_eq!(usage.used, 0);
        assert_eq!(usage.limit, Some(3));
        assert_eq!(usage.remaining, Some(3));

        let error = status_handler(State(state()), bearer("not-a-token"))
            .await
            .unwrap_err();
        assert_eq!(error.code(), ErrorCode::Unauthorized);
    }
}
