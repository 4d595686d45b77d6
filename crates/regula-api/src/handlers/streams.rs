//! Server-Sent Events endpoints.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures::StreamExt;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;
use crate::stream::{Outbound, StreamConnection};

/// `GET /api/v1/checks/:id/stream`
pub async fn check_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let connection = state.fanout.open_check(id).await?;
    Ok(into_sse(connection))
}

/// `GET /api/v1/organizations/:org_id/queue/stream`
pub async fn queue_stream(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let connection = state.fanout.open_organization(org_id).await?;
    Ok(into_sse(connection))
}

/// Frames become `data: <json>` events and heartbeats `: heartbeat` comments.
/// The response body owns the connection, so a client disconnect drops it.
fn into_sse(connection: StreamConnection) -> Response {
    let events = connection.map(|item| {
        Ok::<_, Infallible>(match item {
            Outbound::Data(json) => Event::default().data(json),
            Outbound::Heartbeat => Event::default().comment("heartbeat"),
        })
    });

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(events),
    )
        .into_response()
}
