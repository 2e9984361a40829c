mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;

use common::*;
use inference_server::config::ServeSettings;
use inference_server::server::create_router;

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_generate_json() {
    let (service, _backend) = ready_service(FakeOptions {
        script: "return 42".to_string(),
        ..FakeOptions::default()
    })
    .await;
    let app = create_router(service);

    let response = app
        .oneshot(post_json(
            "/generate",
            serde_json::json!({"prompt": "answer", "temperature": 0.0, "session_id": "abc"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["text"], "return 42");
    assert_eq!(body["tokens_generated"], 9);
    assert_eq!(body["session_id"], "abc");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_generate_sse_ends_with_done() {
    let (service, _backend) = ready_service(FakeOptions {
        script: "ab".to_string(),
        ..FakeOptions::default()
    })
    .await;
    let app = create_router(service);

    let response = app
        .oneshot(post_json(
            "/generate",
            serde_json::json!({"prompt": "x", "temperature": 0.0, "stream": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/event-stream"
    );

    let body = body_string(response).await;
    let data: Vec<&str> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();
    assert_eq!(data, vec!["a", "b", "[DONE]"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_request_is_400() {
    let (service, _backend) = ready_service(FakeOptions::default()).await;
    let app = create_router(service);

    let response = app
        .oneshot(post_json(
            "/generate",
            serde_json::json!({"prompt": "x", "max_new_tokens": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error_code"], "INVALID_REQUEST");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_json_is_400() {
    let (service, _backend) = ready_service(FakeOptions::default()).await;
    let app = create_router(service);

    let request = Request::builder()
        .method("POST")
        .uri("/generate")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"prompt\": "))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_loading_model_is_503_and_health_reports_loading() {
    let backend = FakeBackend::new(FakeOptions::default());
    let loader = loader(&backend, gpus(&[24]), load_settings());
    let app = create_router(service_with(loader.clone(), gpus(&[24]), ServeSettings::default()));

    let hold = backend.gate.lock();
    loader.start();

    let response = app
        .clone()
        .oneshot(post_json("/generate", serde_json::json!({"prompt": "x"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error_code"], "MODEL_UNAVAILABLE");
    assert_eq!(body["details"]["phase"], "loading");

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(health["status"], "loading");
    assert_eq!(health["model"], "fake/coder");
    assert_eq!(health["gpus"].as_array().unwrap().len(), 1);

    drop(hold);
    loader.acquire().await.unwrap();

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(health["status"], "ready");
    assert_eq!(health["precision"], "quantized");
    assert_eq!(health["placement"], "cuda:0");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gpu_info_lists_inventory() {
    let (service, _backend) = ready_service(FakeOptions::default()).await;
    let app = create_router(service);

    let response = app
        .oneshot(Request::builder().uri("/gpu_info").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let info: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(info["count"], 1);
    assert_eq!(info["devices"][0]["kind"], "cuda");
}
