//! Embedding refresh jobs and managed-queue deliveries.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use regula_core::EmbeddingTask;
use regula_jobs::ATTEMPT_HEADER;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    /// Entries to refresh; omitted means every entry of the organization.
    #[serde(default)]
    pub dictionary_ids: Option<Vec<Uuid>>,
}

/// `POST /api/v1/organizations/:org_id/embeddings/refresh`
pub async fn refresh_embeddings(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<RefreshRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .embeddings
        .enqueue_organization(org_id, req.dictionary_ids)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// `GET /api/v1/embeddings/jobs/:id`
pub async fn get_embedding_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.embeddings.get_job(id).await?))
}

/// `GET /api/v1/organizations/:org_id/embeddings/jobs`
pub async fn list_embedding_jobs(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> impl IntoResponse {
    Json(state.embeddings.list_jobs(org_id).await)
}

/// `POST /api/v1/internal/embeddings/deliver`
///
/// Callback for the managed queue. A non-2xx response asks for redelivery.
pub async fn deliver_embedding_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(task): Json<EmbeddingTask>,
) -> Result<impl IntoResponse, ApiError> {
    let attempt = delivery_attempt(&headers);
    let outcome = state.embeddings.process_delivery(&task, attempt).await?;
    Ok(Json(serde_json::json!({ "outcome": outcome })))
}

/// 1-based attempt number; a missing or malformed header counts as the first.
fn delivery_attempt(headers: &HeaderMap) -> u32 {
    headers
        .get(ATTEMPT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(1)
}
