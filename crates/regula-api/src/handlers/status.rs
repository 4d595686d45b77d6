//! Diagnostics.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use regula_core::QueueStatus;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDiagnostics {
    #[serde(flatten)]
    pub queue: QueueStatus,
    pub scheduled_retries: usize,
    pub active_streams: usize,
    pub embedding_backend: &'static str,
}

/// `GET /api/v1/queue/status`
pub async fn queue_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(QueueDiagnostics {
        queue: state.scan_queue.status().await,
        scheduled_retries: state.scan_queue.scheduled_retries().await,
        active_streams: state.fanout.active_connections(),
        embedding_backend: if state.embeddings.is_managed() {
            "managed"
        } else {
            "memory"
        },
    })
}

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
