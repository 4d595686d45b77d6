//! # regula-api
//!
//! HTTP surface for the regula scheduler: scan admission and cancellation,
//! embedding refresh jobs, the managed-queue delivery callback, and the
//! Server-Sent Events status streams.
//!
//! The binary in `main.rs` is the composition root; [`router`] is exposed so
//! tests can serve the same routes over any [`AppState`].

pub mod config;
pub mod error;
pub mod handlers;
pub mod state;
pub mod stream;

use axum::routing::{get, post};
use axum::Router;

pub use config::{ApiConfig, InstanceMode, QueueDurability, StoreBackend};
pub use error::ApiError;
pub use state::AppState;
pub use stream::{StatusSnapshot, StreamConfig, StreamFanout};

/// Every route, without middleware.
pub fn router(state: AppState) -> Router {
    use handlers::{checks, embeddings, status, streams};

    Router::new()
        .route("/health", get(status::health))
        .route("/api/v1/queue/status", get(status::queue_status))
        .route("/api/v1/checks/:id/queue", post(checks::queue_check))
        .route("/api/v1/checks/:id/cancel", post(checks::cancel_check))
        .route("/api/v1/checks/:id/stream", get(streams::check_stream))
        .route(
            "/api/v1/organizations/:org_id/queue/stream",
            get(streams::queue_stream),
        )
        .route(
            "/api/v1/organizations/:org_id/embeddings/refresh",
            post(embeddings::refresh_embeddings),
        )
        .route(
            "/api/v1/organizations/:org_id/embeddings/jobs",
            get(embeddings::list_embedding_jobs),
        )
        .route(
            "/api/v1/embeddings/jobs/:id",
            get(embeddings::get_embedding_job),
        )
        .route(
            "/api/v1/internal/embeddings/deliver",
            post(embeddings::deliver_embedding_task),
        )
        .with_state(state)
}
