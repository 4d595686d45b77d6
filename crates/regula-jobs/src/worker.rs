//! The unit of work executed by the scan queue.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use regula_core::{
    CheckRepository, CheckStatus, Error, EventBus, Result, ScanBackend, ScanQueueItem, ScanRequest,
    ServerEvent,
};

/// Performs one scan job.
///
/// Returning an error from [`process`](ScanWorker::process) hands the item to
/// the queue's retry policy. [`abandon`](ScanWorker::abandon) is called once
/// when the queue gives up on an item (retries exhausted or cancelled) and
/// must leave the persisted record in a terminal state.
#[async_trait]
pub trait ScanWorker: Send + Sync {
    async fn process(&self, item: &ScanQueueItem) -> Result<()>;

    async fn abandon(&self, item: &ScanQueueItem, error: &str) {
        let _ = (item, error);
    }
}

/// Default worker: drives a check record through the scanner and persists
/// the outcome.
pub struct ComplianceScanWorker {
    checks: Arc<dyn CheckRepository>,
    scanner: Arc<dyn ScanBackend>,
    events: Option<Arc<EventBus>>,
}

impl ComplianceScanWorker {
    pub fn new(checks: Arc<dyn CheckRepository>, scanner: Arc<dyn ScanBackend>) -> Self {
        Self {
            checks,
            scanner,
            events: None,
        }
    }

    /// Publish transitions directly on the bus.
    ///
    /// Used when the store has no change feed of its own (memory backend);
    /// with PostgreSQL the `NOTIFY` trigger already publishes every write.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, item: &ScanQueueItem, status: CheckStatus) {
        if let Some(events) = &self.events {
            events.emit(ServerEvent::check_updated(
                item.id,
                item.organization_id,
                status,
            ));
        }
    }
}

#[async_trait]
impl ScanWorker for ComplianceScanWorker {
    async fn process(&self, item: &ScanQueueItem) -> Result<()> {
        let start = Instant::now();

        match self.checks.mark_processing(item.id).await {
            Ok(()) => self.emit(item, CheckStatus::Processing),
            Err(Error::Conflict(reason)) => {
                info!(
                    subsystem = "jobs",
                    component = "scan_worker",
                    check_id = %item.id,
                    %reason,
                    "Check no longer awaiting a scan, skipping"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        debug!(
            subsystem = "jobs",
            component = "scan_worker",
            check_id = %item.id,
            kind = %item.kind,
            retry_count = item.retry_count,
            "Scanning"
        );

        let outcome = self.scanner.scan(&ScanRequest::from(item)).await?;

        match self.checks.mark_completed(item.id, &outcome).await {
            Ok(()) => {}
            Err(Error::Conflict(reason)) => {
                info!(
                    subsystem = "jobs",
                    component = "scan_worker",
                    check_id = %item.id,
                    %reason,
                    "Discarding scan result for a finished check"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.emit(item, CheckStatus::Completed);

        info!(
            subsystem = "jobs",
            component = "scan_worker",
            check_id = %item.id,
            organization_id = %item.organization_id,
            violations = outcome.violations.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Scan completed"
        );
        Ok(())
    }

    async fn abandon(&self, item: &ScanQueueItem, error: &str) {
        match self.checks.mark_failed(item.id, error).await {
            Ok(true) => {
                self.emit(item, CheckStatus::Failed);
                warn!(
                    subsystem = "jobs",
                    component = "scan_worker",
                    check_id = %item.id,
                    error = %error,
                    "Check marked failed"
                );
            }
            Ok(false) => debug!(
                subsystem = "jobs",
                component = "scan_worker",
                check_id = %item.id,
                "Check already terminal"
            ),
            Err(e) => error!(
                subsystem = "jobs",
                component = "scan_worker",
                check_id = %item.id,
                error = %e,
                "Failed to mark check failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regula_core::{InputType, Priority};
    use regula_db::MemoryStore;
    use regula_inference::mock::MockScanBackend;

    fn item_for(id: uuid::Uuid, org: uuid::Uuid) -> ScanQueueItem {
        ScanQueueItem::new(
            id,
            serde_json::json!({"text": "Guaranteed returns"}),
            org,
            Priority::Normal,
            InputType::Text,
        )
    }

    #[tokio::test]
    async fn test_process_completes_record_and_emits() {
        let store = MemoryStore::new();
        let org = uuid::Uuid::new_v4();
        let id = store.create_check(org, InputType::Text).await;
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();

        let worker = ComplianceScanWorker::new(
            Arc::new(store.clone()),
            Arc::new(MockScanBackend::new()),
        )
        .with_events(bus.clone());

        worker.process(&item_for(id, org)).await.unwrap();

        let record = CheckRepository::get(&store, id).await.unwrap().unwrap();
        assert_eq!(record.status, CheckStatus::Completed);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            ServerEvent::CheckUpdated {
                status: CheckStatus::Processing,
                ..
            }
        ));
        assert!(matches!(
            second,
            ServerEvent::CheckUpdated {
                status: CheckStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_scan_error_leaves_record_processing() {
        let store = MemoryStore::new();
        let org = uuid::Uuid::new_v4();
        let id = store.create_check(org, InputType::Text).await;
        let worker = ComplianceScanWorker::new(
            Arc::new(store.clone()),
            Arc::new(MockScanBackend::new().fail_always(id)),
        );

        assert!(worker.process(&item_for(id, org)).await.is_err());
        let record = CheckRepository::get(&store, id).await.unwrap().unwrap();
        assert_eq!(record.status, CheckStatus::Processing);

        worker.abandon(&item_for(id, org), "Scan failed").await;
        let record = CheckRepository::get(&store, id).await.unwrap().unwrap();
        assert_eq!(record.status, CheckStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("Scan failed"));
    }

    #[tokio::test]
    async fn test_terminal_record_is_skipped() {
        let store = MemoryStore::new();
        let org = uuid::Uuid::new_v4();
        let id = store.create_check(org, InputType::Text).await;
        store.mark_failed(id, "Cancelled").await.unwrap();
        let scanner = MockScanBackend::new();

        let worker = ComplianceScanWorker::new(Arc::new(store.clone()), Arc::new(scanner.clone()));
        worker.process(&item_for(id, org)).await.unwrap();

        assert_eq!(scanner.attempts_for(id), 0);
    }
}
