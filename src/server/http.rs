//! Health and session-summary HTTP surface
//!
//! A thin side-channel on its own port: liveness for the orchestrator, and
//! the summary/end API the voice-control service polls after a call.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::session::SessionRegistry;

pub fn router(registry: SessionRegistry) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/voice/sessions/{id}/summary", get(summary_handler))
        .route("/v1/voice/sessions/{id}/end", post(end_handler))
        .with_state(registry)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn summary_handler(
    State(registry): State<SessionRegistry>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match registry.summary(&id) {
        Some(summary) => (
            StatusCode::OK,
            Json(json!({"ok": true, "session_id": id, "summary": summary})),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"ok": false, "error": "unknown_session"})),
        ),
    }
}

async fn end_handler(
    State(registry): State<SessionRegistry>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match registry.end_session(&id) {
        Some(summary) => (
            StatusCode::OK,
            Json(json!({"ok": true, "session_id": id, "summary": summary})),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"ok": false, "error": "unknown_session"})),
        ),
    }
}
