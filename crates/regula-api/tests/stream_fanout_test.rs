//! Status stream behaviour under a paused clock.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Instant};
use uuid::Uuid;

use regula_api::stream::{CloseReason, Outbound, StreamConnection};
use regula_api::{StatusSnapshot, StreamConfig, StreamFanout};
use regula_core::{
    CheckRepository, CheckStatus, Error, EventBus, InputType, ScanOutcome, ServerEvent, Violation,
};
use regula_db::MemoryStore;
use regula_inference::mock::MockScanBackend;
use regula_jobs::{ComplianceScanWorker, ScanQueue, ScanQueueConfig};

struct Harness {
    store: MemoryStore,
    events: Arc<EventBus>,
    fanout: StreamFanout,
    org: Uuid,
}

impl Harness {
    fn new(config: StreamConfig) -> Self {
        let store = MemoryStore::new();
        let events = Arc::new(EventBus::new(64));
        let worker = ComplianceScanWorker::new(
            Arc::new(store.clone()),
            Arc::new(MockScanBackend::new()),
        )
        .with_events(events.clone());
        let queue = ScanQueue::start(ScanQueueConfig::default(), Arc::new(worker));
        let snapshot = StatusSnapshot::new(queue, Arc::new(store.clone()), Arc::new(store.clone()));
        let fanout = StreamFanout::new(snapshot, events.clone(), config);
        Self {
            store,
            events,
            fanout,
            org: Uuid::new_v4(),
        }
    }

    fn emit(&self, check_id: Uuid, status: CheckStatus) {
        self.events
            .emit(ServerEvent::check_updated(check_id, self.org, status));
    }
}

async fn next_data(conn: &mut StreamConnection) -> Value {
    match conn.recv().await {
        Some(Outbound::Data(json)) => serde_json::from_str(&json).unwrap(),
        other => panic!("expected data frame, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_identical_aggregate_frames_are_emitted_once() {
    let h = Harness::new(StreamConfig::default());
    let mut conn = h.fanout.open_organization(h.org).await.unwrap();

    let initial = next_data(&mut conn).await;
    assert_eq!(initial["type"], "queue_status");
    assert_eq!(initial["queue"]["maxConcurrent"], 3);
    assert_eq!(initial["organization"]["monthlyLimit"], 100);

    // Five poll ticks recompute unchanged state before the first heartbeat.
    assert!(timeout(Duration::from_secs(29), conn.recv()).await.is_err());
    assert_eq!(conn.recv().await, Some(Outbound::Heartbeat));

    h.store.create_check(h.org, InputType::Text).await;
    let changed = next_data(&mut conn).await;
    assert_eq!(changed["queue"]["processingStats"]["text"], 1);
    assert_eq!(changed["organization"]["currentMonthChecks"], 1);
    assert_eq!(changed["organization"]["remainingChecks"], 99);
}

#[tokio::test(start_paused = true)]
async fn test_change_notification_recomputes_immediately() {
    let h = Harness::new(StreamConfig::default());
    let mut conn = h.fanout.open_organization(h.org).await.unwrap();
    next_data(&mut conn).await;

    let id = h.store.create_check(h.org, InputType::Image).await;
    h.emit(id, CheckStatus::Pending);

    let frame = timeout(Duration::from_secs(1), next_data(&mut conn))
        .await
        .expect("frame before the next poll tick");
    assert_eq!(frame["queue"]["processingStats"]["image"], 1);

    // Notifications for other organizations are ignored.
    h.events.emit(ServerEvent::check_updated(
        Uuid::new_v4(),
        Uuid::new_v4(),
        CheckStatus::Completed,
    ));
    assert!(timeout(Duration::from_secs(1), conn.recv()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_check_stream_closes_after_terminal_frame() {
    let h = Harness::new(StreamConfig::default());
    let id = h.store.create_check(h.org, InputType::Text).await;
    let mut conn = h.fanout.open_check(id).await.unwrap();

    let first = next_data(&mut conn).await;
    assert_eq!(first["type"], "check_progress");
    assert_eq!(first["check"]["id"], id.to_string());
    assert_eq!(first["check"]["status"], "pending");

    CheckRepository::mark_processing(&h.store, id).await.unwrap();
    h.emit(id, CheckStatus::Processing);
    let processing = next_data(&mut conn).await;
    assert_eq!(processing["check"]["status"], "processing");

    let outcome = ScanOutcome {
        extracted_text: None,
        ocr_status: None,
        result: json!({ "compliant": false, "score": 0.4 }),
        violations: vec![Violation {
            category: "advertising".to_string(),
            severity: "high".to_string(),
            excerpt: "guaranteed returns".to_string(),
            explanation: "Performance claims must not be guaranteed".to_string(),
            suggestion: None,
        }],
    };
    CheckRepository::mark_completed(&h.store, id, &outcome)
        .await
        .unwrap();
    h.emit(id, CheckStatus::Completed);

    let last = next_data(&mut conn).await;
    assert_eq!(last["check"]["status"], "completed");
    assert_eq!(last["check"]["result"]["compliant"], false);
    assert_eq!(last["check"]["violations"][0]["excerpt"], "guaranteed returns");

    assert_eq!(conn.recv().await, None);
    assert_eq!(conn.closed().await, Some(CloseReason::Terminal));
    assert_eq!(h.fanout.active_connections(), 0);
    assert_eq!(h.events.subscriber_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_poll_fallback_catches_missed_notification() {
    let h = Harness::new(StreamConfig::default());
    let id = h.store.create_check(h.org, InputType::Text).await;
    let mut conn = h.fanout.open_check(id).await.unwrap();
    next_data(&mut conn).await;

    // Transition without a notification.
    CheckRepository::mark_failed(&h.store, id, "scanner unavailable")
        .await
        .unwrap();

    let started = Instant::now();
    let last = next_data(&mut conn).await;
    assert!(started.elapsed() <= Duration::from_secs(2));
    assert_eq!(last["check"]["status"], "failed");
    assert_eq!(last["check"]["error_message"], "scanner unavailable");
    assert_eq!(conn.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_actor_and_releases_subscription() {
    let h = Harness::new(StreamConfig::default());
    let mut conn = h.fanout.open_organization(h.org).await.unwrap();
    next_data(&mut conn).await;

    assert_eq!(h.fanout.active_connections(), 1);
    assert_eq!(h.events.subscriber_count(), 1);

    drop(conn);
    sleep(Duration::from_millis(1)).await;

    assert_eq!(h.fanout.active_connections(), 0);
    assert_eq!(h.events.subscriber_count(), 0);

    // Nothing left to wake: later notifications and ticks find no actor.
    h.emit(Uuid::new_v4(), CheckStatus::Processing);
    sleep(Duration::from_secs(120)).await;
    assert_eq!(h.fanout.active_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stream_ends_at_lifetime_ceiling() {
    let h = Harness::new(StreamConfig::default());
    let id = h.store.create_check(h.org, InputType::Text).await;
    let started = Instant::now();
    let mut conn = h.fanout.open_check(id).await.unwrap();

    let mut frames = 0;
    let mut heartbeats = 0;
    while let Some(item) = conn.recv().await {
        match item {
            Outbound::Data(_) => frames += 1,
            Outbound::Heartbeat => heartbeats += 1,
        }
    }

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(600));
    assert!(elapsed < Duration::from_secs(601));
    // Initial frame only; unchanged polls are suppressed.
    assert_eq!(frames, 1);
    // Heartbeats at 30s..570s; the ceiling wins the tie at 600s.
    assert_eq!(heartbeats, 19);
    assert_eq!(conn.closed().await, Some(CloseReason::Timeout));
    assert_eq!(h.fanout.active_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shorter_ceiling_from_config() {
    let config = StreamConfig::default()
        .with_heartbeat_interval(Duration::from_secs(10))
        .with_max_duration(Duration::from_secs(25));
    let h = Harness::new(config);
    let mut conn = h.fanout.open_organization(h.org).await.unwrap();

    let mut items = Vec::new();
    while let Some(item) = conn.recv().await {
        items.push(item);
    }
    assert_eq!(items.len(), 3);
    assert_eq!(items[1], Outbound::Heartbeat);
    assert_eq!(items[2], Outbound::Heartbeat);
}

#[tokio::test]
async fn test_missing_record_is_rejected_before_streaming() {
    let h = Harness::new(StreamConfig::default());
    let missing = Uuid::new_v4();
    match h.fanout.open_check(missing).await {
        Err(Error::CheckNotFound(id)) => assert_eq!(id, missing),
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("stream opened for a missing record"),
    }
    assert_eq!(h.fanout.active_connections(), 0);
    assert_eq!(h.events.subscriber_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_every_stream() {
    let h = Harness::new(StreamConfig::default());
    let id = h.store.create_check(h.org, InputType::Text).await;
    let mut a = h.fanout.open_check(id).await.unwrap();
    let mut b = h.fanout.open_organization(h.org).await.unwrap();
    next_data(&mut a).await;
    next_data(&mut b).await;
    assert_eq!(h.fanout.active_connections(), 2);

    h.fanout.shutdown();

    assert_eq!(a.recv().await, None);
    assert_eq!(b.recv().await, None);
    assert_eq!(a.closed().await, Some(CloseReason::Shutdown));
    assert_eq!(b.closed().await, Some(CloseReason::Shutdown));
    assert_eq!(h.fanout.active_connections(), 0);
}
