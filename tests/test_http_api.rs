//! HTTP surface tests driven through warp's test harness


use serde_json::{json, Value};
use std::sync::Arc;
use task_router::server::routes;
use task_router::testing::{MockArchivalService, StreamStep};
use task_router::transport::{BackendReply, TransportError};
use test_helpers::{test_config, TestRouter};
use warp::http::StatusCode;

fn body_json(body: &[u8]) -> Value {
    serde_json::from_slice(body).expect("response body should be JSON")
}

async fn post_run(router: &TestRouter, body: Value) -> (StatusCode, Value) {
    let response = warp::test::request()
        .method("POST")
        .path("/v1/run")
        .json(&body)
        .reply(&routes(router.app_state()))
        .await;
    (response.status(), body_json(response.body()))
}

#[tokio::test]
async fn test_run_success() {
    let router = TestRouter::new(test_config()).preflighted().await;
    router.transport.set_reply(
        "bias_scan",
        BackendReply::json(200, json!({"outputs": {"score": 0.2}})),
    );

    let (status, body) = post_run(
        &router,
        json!({"task_type": "bias_scan", "request_id": "http-1", "inputs": {"text": "x"}}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["request_id"], "http-1");
    assert_eq!(body["outputs"]["score"], 0.2);
    assert!(body.get("error").is_none());
}

#[tokio::test]
async fn test_run_error_statuses() {
    let router = TestRouter::new(test_config()).preflighted().await;

    let (status, body) = post_run(
        &router,
        json!({"task_type": "nope", "request_id": "http-2"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["kind"], "UnknownTaskType");

    let (status, body) = post_run(&router, json!({"task_type": "bias_scan", "request_id": ""})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "ValidationError");

    let request = json!({"task_type": "bias_scan", "request_id": "http-3"});
    let (status, _) = post_run(&router, request.clone()).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = post_run(&router, request).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "DuplicateRequestId");

    router.transport.set_run_error("bias_scan", TransportError::Timeout);
    let (status, body) = post_run(
        &router,
        json!({"task_type": "bias_scan", "request_id": "http-4"}),
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"]["kind"], "UpstreamTimeout");
}

#[tokio::test]
async fn test_run_refused_before_preflight() {
    let router = TestRouter::new(test_config());

    let (status, body) = post_run(
        &router,
        json!({"task_type": "bias_scan", "request_id": "http-5"}),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["kind"], "ServiceNotReady");
    assert_eq!(router.transport.total_call_count(), 0);
}

#[tokio::test]
async fn test_unparseable_body_gets_validation_envelope() {
    let router = TestRouter::new(test_config()).preflighted().await;

    let response = warp::test::request()
        .method("POST")
        .path("/v1/run")
        .header("content-type", "application/json")
        .body("{not json")
        .reply(&routes(router.app_state()))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response.body());
    assert_eq!(body["ok"], false);
    assert_eq!(body["request_id"], "");
    assert_eq!(body["error"]["kind"], "ValidationError");

    // Structurally wrong but valid JSON keeps the caller's request id
    let (status, body) = post_run(&router, json!({"request_id": "http-6", "inputs": 3})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["request_id"], "http-6");
}

#[tokio::test]
async fn test_health_and_readiness() {
    let router = TestRouter::new(test_config());
    let filter = routes(router.app_state());

    let response = warp::test::request().path("/health").reply(&filter).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response.body())["alive"], true);

    let response = warp::test::request().path("/health/ready").reply(&filter).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response.body());
    assert_eq!(body["ready"], false);
    assert!(body["checked_at"].is_null());

    router.validator.run_preflight().await;

    let response = warp::test::request().path("/health/ready").reply(&filter).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.body());
    assert_eq!(body["ready"], true);
    assert_eq!(body["agents"].as_array().map(Vec::len), Some(2));
    assert_eq!(body["failing_mandatory"], json!([]));
}

#[tokio::test]
async fn test_readiness_lists_failing_mandatory_agents() {
    let router = TestRouter::new(test_config());
    router.transport.set_unreachable("bias_scan");
    router.validator.run_preflight().await;

    let response = warp::test::request()
        .path("/health/ready")
        .reply(&routes(router.app_state()))
        .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response.body())["failing_mandatory"], json!(["bias_scan"]));
}

#[tokio::test]
async fn test_metrics_and_index() {
    let router = TestRouter::new(test_config());
    let filter = routes(router.app_state());

    let response = warp::test::request().path("/metrics").reply(&filter).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.body());
    assert!(body.get("requests").is_some());
    assert!(body.get("streams").is_some());

    let response = warp::test::request().path("/").reply(&filter).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response.body())["endpoints"]
        .get("POST /v1/run")
        .is_some());

    let response = warp::test::request().path("/nowhere").reply(&filter).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stream_as_server_sent_events() {
    let router = TestRouter::new(test_config()).preflighted().await;
    router.transport.set_stream(
        "bias_scan",
        vec![
            StreamStep::Frame(json!({"kind": "PROGRESS", "payload": {"pct": 50}})),
            StreamStep::Frame(json!({"kind": "DONE", "payload": {"score": 1}})),
        ],
    );

    let response = warp::test::request()
        .method("POST")
        .path("/v1/run/stream")
        .json(&json!({"task_type": "bias_scan", "request_id": "sse-1"}))
        .reply(&routes(router.app_state()))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = String::from_utf8_lossy(response.body()).to_string();
    assert!(body.contains("event:PROGRESS"));
    assert!(body.contains("event:DONE"));
    assert!(body.contains("data:"));

    let progress = body.find("event:PROGRESS").unwrap_or(usize::MAX);
    let done = body.find("event:DONE").unwrap_or(0);
    assert!(progress < done);
}

#[tokio::test]
async fn test_stream_rejected_for_non_streaming_agent() {
    let router = TestRouter::new(test_config()).preflighted().await;

    let response = warp::test::request()
        .method("POST")
        .path("/v1/run/stream")
        .json(&json!({"task_type": "perf_analysis", "request_id": "sse-2"}))
        .reply(&routes(router.app_state()))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response.body());
    assert_eq!(body["request_id"], "sse-2");
    assert_eq!(body["error"]["kind"], "StreamingUnsupported");
    assert_eq!(router.transport.stream_call_count(), 0);
}

#[tokio::test]
async fn test_archive_and_restore() {
    let router = TestRouter::new(test_config());
    let archival = Arc::new(MockArchivalService::new());
    let filter = routes(router.app_state().with_archival(archival.clone()));

    let response = warp::test::request()
        .method("POST")
        .path("/v1/entities/report-7/archive")
        .json(&json!({"reason": "superseded"}))
        .reply(&filter)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response.body())["status"], "ARCHIVED");
    assert!(archival.is_archived("report-7"));

    // Empty body is accepted
    let response = warp::test::request()
        .method("POST")
        .path("/v1/entities/report-7/restore")
        .header("content-length", "0")
        .reply(&filter)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response.body())["status"], "RESTORED");
    assert!(!archival.is_archived("report-7"));

    let response = warp::test::request()
        .method("POST")
        .path("/v1/entities/report-7/restore")
        .header("content-length", "0")
        .reply(&filter)
        .await;
    assert_eq!(body_json(response.body())["status"], "NOOP");
}

#[tokio::test]
async fn test_archive_without_service_configured() {
    let router = TestRouter::new(test_config());

    let response = warp::test::request()
        .method("POST")
        .path("/v1/entities/report-7/archive")
        .header("content-length", "0")
        .reply(&routes(router.app_state()))
        .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(body_json(response.body())["error"]
        .as_str()
        .unwrap_or_default()
        .contains("not configured"));
}

#[tokio::test]
async fn test_body_without_content_length_is_refused() {
    let router = TestRouter::new(test_config());

    let response = warp::test::request()
        .method("POST")
        .path("/v1/run")
        .reply(&routes(router.app_state()))
        .await;

    assert_eq!(response.status(), StatusCode::LENGTH_REQUIRED);
}
