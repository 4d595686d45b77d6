//! HTTP contract tests for the provider backends against a local mock server.

use regula_inference::{
    EmbeddingBackend, HttpScanBackend, InputType, OpenAIBackend, OpenAIConfig, ScanBackend,
    ScanRequest, ScannerConfig,
};
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn openai_config(base_url: String) -> OpenAIConfig {
    OpenAIConfig {
        base_url,
        api_key: Some("sk-test".to_string()),
        embed_model: "test-embed".to_string(),
        embed_dimension: 3,
        timeout_seconds: 5,
    }
}

#[tokio::test]
async fn test_embeddings_are_returned_in_index_order() {
    let mock_server = MockServer::start().await;

    let body = serde_json::json!({
        "data": [
            {"embedding": [0.4, 0.5, 0.6], "index": 1},
            {"embedding": [0.1, 0.2, 0.3], "index": 0}
        ],
        "model": "test-embed",
        "usage": {"prompt_tokens": 2, "total_tokens": 2}
    });

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(header("Authorization", "Bearer sk-test"))
        .and(body_partial_json(serde_json::json!({"model": "test-embed"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(&body))
        .expect(1)
        .mount(&mock_server)
        .await;

    let backend = OpenAIBackend::new(openai_config(mock_server.uri())).unwrap();
    let vectors = backend
        .embed_texts(&["first".to_string(), "second".to_string()])
        .await
        .unwrap();

    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[0].as_slice(), &[0.1, 0.2, 0.3]);
    assert_eq!(vectors[1].as_slice(), &[0.4, 0.5, 0.6]);
    assert_eq!(backend.model_name(), "test-embed");
}

#[tokio::test]
async fn test_embedding_error_surfaces_provider_message() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
            "error": {"message": "rate limited", "type": "rate_limit", "code": null}
        })))
        .mount(&mock_server)
        .await;

    let backend = OpenAIBackend::new(openai_config(mock_server.uri())).unwrap();
    let err = backend
        .embed_texts(&["phrase".to_string()])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("rate limited"));
}

#[tokio::test]
async fn test_empty_batch_skips_request() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&mock_server)
        .await;

    let backend = OpenAIBackend::new(openai_config(mock_server.uri())).unwrap();
    assert!(backend.embed_texts(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_scanner_round_trip() {
    let mock_server = MockServer::start().await;
    let check_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path("/scan"))
        .and(header("Authorization", "Bearer scan-key"))
        .and(body_partial_json(serde_json::json!({
            "check_id": check_id,
            "input_type": "image"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "extracted_text": "Guaranteed 20% returns",
            "ocr_status": "completed",
            "result": {"compliant": false},
            "violations": [{
                "category": "financial_promotion",
                "severity": "high",
                "excerpt": "Guaranteed 20% returns",
                "explanation": "Returns cannot be guaranteed"
            }]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let backend =
        HttpScanBackend::new(ScannerConfig::new(mock_server.uri()).with_api_key("scan-key"))
            .unwrap();
    let outcome = backend
        .scan(&ScanRequest {
            check_id,
            organization_id: Uuid::new_v4(),
            input_type: InputType::Image,
            payload: serde_json::json!({"image_url": "https://cdn.example/ad.png"}),
        })
        .await
        .unwrap();

    assert_eq!(
        outcome.extracted_text.as_deref(),
        Some("Guaranteed 20% returns")
    );
    assert_eq!(outcome.violations.len(), 1);
    assert!(outcome.violations[0].suggestion.is_none());
}

#[tokio::test]
async fn test_scanner_server_error_is_scan_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scan"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&mock_server)
        .await;

    let backend = HttpScanBackend::new(ScannerConfig::new(mock_server.uri())).unwrap();
    let err = backend
        .scan(&ScanRequest {
            check_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            input_type: InputType::Text,
            payload: serde_json::json!({"text": "hello"}),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, regula_inference::Error::Scan(_)));
    assert!(err.to_string().contains("overloaded"));
}
