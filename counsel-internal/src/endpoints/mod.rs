use axum::routing::{get, post};
use axum::Router;

use crate::gateway_util::AppStateData;

pub mod ai;
pub mod fallback;
pub mod status;

/// Routes served by the gateway, except `/metrics` which needs the process-wide recorder.
pub fn router(app_state: AppStateData) -> Router {
    Router::new()
        .route("/api/ai/ask", post(ai::ask_handler))
        .route("/api/ai/chat", post(ai::chat_handler))
        .route("/api/ai/stream", post(ai::stream_handler))
        .route("/health", get(status::health_handler))
        .route("/status", get(status::status_handler))
        .fallback(fallback::handle_404)
        .with_state(app_state)
}
