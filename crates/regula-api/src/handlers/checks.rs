//! Scan admission and cancellation.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;

use regula_core::{CheckStatus, Error, Priority, ServerEvent};
use regula_jobs::CANCELLED_MESSAGE;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct QueueCheckRequest {
    /// Content handed to the scanner.
    pub payload: JsonValue,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Serialize)]
pub struct QueueCheckResponse {
    pub check_id: Uuid,
    pub status: &'static str,
    pub priority: Priority,
}

/// `POST /api/v1/checks/:id/queue`
///
/// Admits a persisted `pending` record into the scan queue once the
/// organization's monthly allowance has been checked.
pub async fn queue_check(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<QueueCheckRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .checks
        .get(id)
        .await?
        .ok_or(Error::CheckNotFound(id))?;

    if record.status != CheckStatus::Pending {
        return Err(ApiError::Conflict(format!(
            "check {} is {}, only pending checks can be queued",
            id, record.status
        )));
    }

    // The record being admitted is already part of this month's count.
    let quota = state.quotas.quota(record.organization_id).await?;
    if quota.current_month_checks > quota.monthly_limit {
        return Err(Error::QuotaExceeded {
            organization_id: record.organization_id,
            limit: quota.monthly_limit,
        }
        .into());
    }

    state
        .scan_queue
        .enqueue(
            id,
            req.payload,
            record.organization_id,
            req.priority,
            record.input_type,
        )
        .await?;

    info!(
        subsystem = "api",
        check_id = %id,
        organization_id = %record.organization_id,
        priority = %req.priority,
        "Check admitted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(QueueCheckResponse {
            check_id: id,
            status: "queued",
            priority: req.priority,
        }),
    ))
}

/// `POST /api/v1/checks/:id/cancel`
///
/// Cancels the scan wherever the queue holds it. A pending record the queue
/// never saw is failed directly.
pub async fn cancel_check(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if state.scan_queue.cancel(id).await {
        return Ok(Json(serde_json::json!({ "check_id": id, "cancelled": true })));
    }

    let record = state
        .checks
        .get(id)
        .await?
        .ok_or(Error::CheckNotFound(id))?;

    if record.status.is_terminal() || !state.checks.mark_failed(id, CANCELLED_MESSAGE).await? {
        return Err(ApiError::Conflict(format!(
            "check {} already finished",
            id
        )));
    }

    state.notify(ServerEvent::check_updated(
        id,
        record.organization_id,
        CheckStatus::Failed,
    ));
    info!(subsystem = "api", check_id = %id, "Unqueued check cancelled");

    Ok(Json(serde_json::json!({ "check_id": id, "cancelled": true })))
}
