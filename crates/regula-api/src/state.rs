//! Shared handler state.

use std::sync::Arc;

use regula_core::{CheckRepository, EventBus, QuotaRepository, ServerEvent};
use regula_jobs::{EmbeddingJobQueue, ScanQueue};

use crate::stream::StreamFanout;

/// Services handed to every route handler.
///
/// Built once by the binary's composition root; tests build their own.
#[derive(Clone)]
pub struct AppState {
    pub checks: Arc<dyn CheckRepository>,
    pub quotas: Arc<dyn QuotaRepository>,
    pub scan_queue: ScanQueue,
    pub embeddings: EmbeddingJobQueue,
    pub fanout: StreamFanout,
    pub events: Arc<EventBus>,
    /// Emit change notifications from handlers. Off when the store's own
    /// trigger already publishes them.
    pub emit_events: bool,
}

impl AppState {
    pub(crate) fn notify(&self, event: ServerEvent) {
        if self.emit_events {
            self.events.emit(event);
        }
    }
}
