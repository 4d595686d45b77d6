//! HTTP routes against the in-memory store and mock providers.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use regula_api::{router, AppState, StatusSnapshot, StreamConfig, StreamFanout};
use regula_core::{CheckRepository, CheckStatus, DictionaryEntry, EventBus, InputType};
use regula_db::MemoryStore;
use regula_inference::mock::{MockEmbeddingBackend, MockScanBackend};
use regula_jobs::{
    ComplianceScanWorker, EmbeddingJobQueue, EmbeddingQueueConfig, ScanQueue, ScanQueueConfig,
};

struct TestApp {
    store: MemoryStore,
    scanner: MockScanBackend,
    state: AppState,
    org: Uuid,
}

impl TestApp {
    fn new() -> Self {
        Self::with_scanner(MockScanBackend::new())
    }

    fn with_scanner(scanner: MockScanBackend) -> Self {
        let store = MemoryStore::new();
        let events = Arc::new(EventBus::new(64));
        let worker = ComplianceScanWorker::new(Arc::new(store.clone()), Arc::new(scanner.clone()))
            .with_events(events.clone());
        let scan_queue = ScanQueue::start(ScanQueueConfig::default(), Arc::new(worker));
        let embeddings = EmbeddingJobQueue::new(
            EmbeddingQueueConfig::default(),
            Arc::new(store.clone()),
            Arc::new(MockEmbeddingBackend::new(8)),
        );
        let snapshot = StatusSnapshot::new(
            scan_queue.clone(),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        );
        let fanout = StreamFanout::new(snapshot, events.clone(), StreamConfig::default());

        let state = AppState {
            checks: Arc::new(store.clone()),
            quotas: Arc::new(store.clone()),
            scan_queue,
            embeddings,
            fanout,
            events,
            emit_events: true,
        };
        Self {
            store,
            scanner,
            state,
            org: Uuid::new_v4(),
        }
    }

    fn router(&self) -> Router {
        router(self.state.clone())
    }

    async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn wait_for_status(&self, id: Uuid, expected: CheckStatus) {
        for _ in 0..200 {
            let record = CheckRepository::get(&self.store, id).await.unwrap().unwrap();
            if record.status == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("check {} never reached {}", id, expected);
    }
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let (status, body) = app.send("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_queue_check_runs_scan_to_completion() {
    let app = TestApp::new();
    let id = app.store.create_check(app.org, InputType::Text).await;

    let (status, body) = app
        .send(
            "POST",
            &format!("/api/v1/checks/{}/queue", id),
            Some(json!({ "payload": { "text": "Guaranteed 20% returns" }, "priority": "high" })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["priority"], "high");

    app.wait_for_status(id, CheckStatus::Completed).await;
    assert_eq!(app.scanner.attempts_for(id), 1);
}

#[tokio::test]
async fn test_queue_check_admission_errors() {
    let app = TestApp::new();

    let (status, body) = app
        .send(
            "POST",
            &format!("/api/v1/checks/{}/queue", Uuid::new_v4()),
            Some(json!({ "payload": {} })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("Check not found"));

    let id = app.store.create_check(app.org, InputType::Text).await;
    let (status, _) = app
        .send(
            "POST",
            &format!("/api/v1/checks/{}/queue", id),
            Some(json!({ "payload": "just a string" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    CheckRepository::mark_processing(&app.store, id).await.unwrap();
    let (status, body) = app
        .send(
            "POST",
            &format!("/api/v1/checks/{}/queue", id),
            Some(json!({ "payload": {} })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("processing"));
}

#[tokio::test]
async fn test_queue_check_respects_monthly_quota() {
    let app = TestApp::new();
    app.store.set_monthly_limit(app.org, 1).await;

    let first = app.store.create_check(app.org, InputType::Text).await;
    let (status, _) = app
        .send(
            "POST",
            &format!("/api/v1/checks/{}/queue", first),
            Some(json!({ "payload": {} })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let second = app.store.create_check(app.org, InputType::Image).await;
    let (status, body) = app
        .send(
            "POST",
            &format!("/api/v1/checks/{}/queue", second),
            Some(json!({ "payload": {} })),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap().contains("monthly limit 1"));
}

#[tokio::test]
async fn test_cancel_unqueued_and_finished_checks() {
    let app = TestApp::new();
    let id = app.store.create_check(app.org, InputType::Text).await;

    let (status, body) = app
        .send("POST", &format!("/api/v1/checks/{}/cancel", id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], true);

    let record = CheckRepository::get(&app.store, id).await.unwrap().unwrap();
    assert_eq!(record.status, CheckStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("Cancelled"));

    let (status, _) = app
        .send("POST", &format!("/api/v1/checks/{}/cancel", id), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app
        .send(
            "POST",
            &format!("/api/v1/checks/{}/cancel", Uuid::new_v4()),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_in_flight_scan() {
    let app = TestApp::with_scanner(MockScanBackend::new().with_latency(Duration::from_secs(30)));
    let id = app.store.create_check(app.org, InputType::Text).await;
    app.send(
        "POST",
        &format!("/api/v1/checks/{}/queue", id),
        Some(json!({ "payload": {} })),
    )
    .await;
    app.wait_for_status(id, CheckStatus::Processing).await;

    let (status, _) = app
        .send("POST", &format!("/api/v1/checks/{}/cancel", id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    app.wait_for_status(id, CheckStatus::Failed).await;

    let (_, diag) = app.send("GET", "/api/v1/queue/status", None).await;
    assert_eq!(diag["processingCount"], 0);
    assert_eq!(diag["maxConcurrent"], 3);
}

#[tokio::test]
async fn test_embedding_refresh_and_polling() {
    let app = TestApp::new();
    for phrase in ["risk free", "guaranteed", "no fees"] {
        app.store
            .insert_dictionary_entry(DictionaryEntry {
                id: Uuid::new_v4(),
                organization_id: app.org,
                phrase: phrase.to_string(),
            })
            .await;
    }

    let (status, job) = app
        .send(
            "POST",
            &format!("/api/v1/organizations/{}/embeddings/refresh", app.org),
            Some(json!({})),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(job["total"], 3);
    let job_id = job["id"].as_str().unwrap().to_string();

    let mut last = Value::Null;
    for _ in 0..200 {
        let (status, body) = app
            .send("GET", &format!("/api/v1/embeddings/jobs/{}", job_id), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        last = body;
        if last["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(last["status"], "completed");
    assert_eq!(last["processed"], 3);
    assert_eq!(last["failed"], 0);

    let (_, list) = app
        .send(
            "GET",
            &format!("/api/v1/organizations/{}/embeddings/jobs", app.org),
            None,
        )
        .await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, _) = app
        .send(
            "POST",
            &format!("/api/v1/organizations/{}/embeddings/refresh", app.org),
            Some(json!({ "dictionary_ids": [] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .send(
            "GET",
            &format!("/api/v1/embeddings/jobs/{}", Uuid::new_v4()),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delivery_for_unknown_job() {
    let app = TestApp::new();
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/internal/embeddings/deliver")
        .header("content-type", "application/json")
        .header("x-delivery-attempt", "2")
        .body(Body::from(
            json!({
                "job_id": Uuid::new_v4(),
                "organization_id": app.org,
                "dictionary_id": Uuid::new_v4(),
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["outcome"], "unknown_job");
}

#[tokio::test]
async fn test_stream_routes_reject_missing_check() {
    let app = TestApp::new();
    let (status, body) = app
        .send(
            "GET",
            &format!("/api/v1/checks/{}/stream", Uuid::new_v4()),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_sse_wire_format_over_tcp() {
    let app = TestApp::new();
    let id = app.store.create_check(app.org, InputType::Text).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = app.router();
    tokio::spawn(async move {
        axum::serve(listener, server).await.unwrap();
    });
    let base_url = format!("http://{}", addr);

    let client = reqwest::Client::new();
    let mut response = client
        .get(format!("{}/api/v1/checks/{}/stream", base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let headers = response.headers();
    assert!(headers["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(headers["cache-control"], "no-cache");

    let first = tokio::time::timeout(Duration::from_secs(5), response.chunk())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let first = String::from_utf8_lossy(&first).to_string();
    assert!(first.starts_with("data: "));
    assert!(first.contains("\"type\":\"check_progress\""));
    assert!(first.contains("\"status\":\"pending\""));
    assert_eq!(app.state.fanout.active_connections(), 1);

    let cancel = client
        .post(format!("{}/api/v1/checks/{}/cancel", base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(cancel.status(), 200);

    let mut rest = String::new();
    loop {
        let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .unwrap()
            .unwrap();
        match chunk {
            Some(bytes) => rest.push_str(&String::from_utf8_lossy(&bytes)),
            None => break,
        }
    }
    assert!(rest.contains("\"status\":\"failed\""));
    assert!(rest.contains("Cancelled"));
    assert!(rest.ends_with("\n\n"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(app.state.fanout.active_connections(), 0);
}
