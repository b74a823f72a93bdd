//! Request handlers for the HTTP surface
//!
//! Handlers never reject: every outcome, including an unreadable body, is a
//! JSON reply with a status derived from the error kind.

use super::AppState;
use crate::collaborators::{ArchiveOutcome, ArchiveRequest, CollaboratorError};
use crate::dispatch::envelope;
use crate::error::RouterError;
use crate::observability::metrics;
use crate::protocol::{AgentRunResponse, PreflightReport, RawRunRequest, StreamEvent};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::reply::{Reply, Response};
use warp::sse::Event;

#[derive(Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Serialize)]
struct ReadinessResponse<'a> {
    ready: bool,
    checked_at: Option<DateTime<Utc>>,
    failing_mandatory: Vec<&'a str>,
    agents: &'a [PreflightReport],
}

#[derive(Serialize)]
struct ApiDocumentationResponse {
    endpoints: BTreeMap<&'static str, &'static str>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: u64,
}

/// Optional body of archive and restore calls
#[derive(Debug, Default, Deserialize)]
struct ArchiveBody {
    reason: Option<String>,
    requested_by: Option<String>,
}

/// POST /v1/run
pub async fn run(state: AppState, body: Bytes) -> Result<Response, Infallible> {
    let raw = match parse_run_request(&body) {
        Ok(raw) => raw,
        Err(rejected) => return Ok(envelope_reply(&rejected)),
    };

    let response = state.dispatcher.submit(raw).await;
    Ok(envelope_reply(&response))
}

/// POST /v1/run/stream
pub async fn run_stream(state: AppState, body: Bytes) -> Result<Response, Infallible> {
    let raw = match parse_run_request(&body) {
        Ok(raw) => raw,
        Err(rejected) => return Ok(envelope_reply(&rejected)),
    };
    let request_id = raw.request_id.clone().unwrap_or_default();

    match state.dispatcher.submit_stream(raw) {
        Ok(relay) => {
            let events = relay.map(|event| Ok::<_, Infallible>(sse_event(&event)));
            Ok(warp::sse::reply(warp::sse::keep_alive().stream(events)).into_response())
        }
        Err(err) => Ok(envelope_reply(&envelope::from_error(&request_id, &err))),
    }
}

/// SSE frame: `event` is the kind, `id` the sequence, `data` the frame JSON
pub fn sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.kind.as_str())
        .id(event.sequence.to_string())
        .data(serde_json::to_string(event).unwrap_or_default())
}

/// Parse a run request body, producing a failure envelope on bad input
fn parse_run_request(body: &[u8]) -> Result<RawRunRequest, AgentRunResponse> {
    let reject = |request_id: &str, err: RouterError| {
        metrics().request_received();
        metrics().request_rejected(err.kind());
        info!(request_id = %request_id, error = %err, "Request rejected");
        envelope::from_error(request_id, &err)
    };

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| reject("", RouterError::validation(format!("body is not valid JSON: {e}"))))?;

    let request_id = value
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    serde_json::from_value(value).map_err(|e| {
        reject(
            &request_id,
            RouterError::validation(format!("malformed request: {e}")),
        )
    })
}

fn envelope_reply(response: &AgentRunResponse) -> Response {
    let status = response
        .error_kind()
        .map(|kind| kind.http_status())
        .unwrap_or(200);
    json_reply(response, status)
}

fn json_reply<T: Serialize>(body: &T, status: u16) -> Response {
    warp::reply::with_status(
        warp::reply::json(body),
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    )
    .into_response()
}

fn error_reply(message: impl Into<String>, status: u16) -> Response {
    json_reply(
        &ErrorResponse {
            error: message.into(),
            timestamp: current_timestamp(),
        },
        status,
    )
}

/// GET /health
pub async fn health() -> Result<Response, Infallible> {
    Ok(json_reply(
        &LivenessResponse {
            alive: true,
            timestamp: current_timestamp(),
        },
        200,
    ))
}

/// GET /health/ready
pub async fn ready(state: AppState) -> Result<Response, Infallible> {
    let snapshot = state.readiness.snapshot();
    let ready = snapshot.is_ready();

    let response = ReadinessResponse {
        ready,
        checked_at: snapshot.completed_at(),
        failing_mandatory: snapshot.failing_mandatory(),
        agents: snapshot.reports(),
    };

    Ok(json_reply(&response, if ready { 200 } else { 503 }))
}

/// GET /metrics
pub async fn metrics_snapshot() -> Result<Response, Infallible> {
    Ok(json_reply(&metrics().get_metrics(), 200))
}

/// GET /
pub async fn index() -> Result<Response, Infallible> {
    let endpoints = BTreeMap::from([
        ("POST /v1/run", "Run a task and wait for the result envelope"),
        ("POST /v1/run/stream", "Run a task and stream events as SSE"),
        ("GET /health", "Process liveness"),
        ("GET /health/ready", "Readiness from the latest preflight run"),
        ("GET /metrics", "Router metrics snapshot"),
        ("POST /v1/entities/{id}/archive", "Archive an entity"),
        ("POST /v1/entities/{id}/restore", "Restore an archived entity"),
    ]);

    Ok(json_reply(&ApiDocumentationResponse { endpoints }, 200))
}

/// Which archival operation to forward
#[derive(Debug, Clone, Copy)]
pub enum ArchiveAction {
    Archive,
    Restore,
}

/// POST /v1/entities/{id}/archive and /restore
pub async fn archive(
    entity_id: String,
    action: ArchiveAction,
    state: AppState,
    body: Bytes,
) -> Result<Response, Infallible> {
    let Some(service) = state.archival.clone() else {
        return Ok(error_reply("archival service is not configured", 503));
    };

    let body = if body.is_empty() {
        ArchiveBody::default()
    } else {
        match serde_json::from_slice::<ArchiveBody>(&body) {
            Ok(body) => body,
            Err(e) => return Ok(error_reply(format!("malformed request: {e}"), 400)),
        }
    };

    let request = ArchiveRequest {
        entity_id,
        reason: body.reason,
        requested_by: body.requested_by,
    };
    let entity_id = request.entity_id.clone();

    let result: Result<ArchiveOutcome, CollaboratorError> = match action {
        ArchiveAction::Archive => service.archive(request).await,
        ArchiveAction::Restore => service.restore(request).await,
    };

    match result {
        Ok(outcome) => {
            info!(entity_id = %entity_id, action = ?action, status = ?outcome.status, "Archival request completed");
            Ok(json_reply(&outcome, 200))
        }
        Err(e) => {
            warn!(entity_id = %entity_id, action = ?action, error = %e, "Archival request failed");
            Ok(error_reply(format!("archival service error: {e}"), 502))
        }
    }
}

/// Turn unmatched routes and oversized bodies into JSON errors
pub async fn handle_rejection(rejection: warp::Rejection) -> Result<Response, Infallible> {
    if rejection.is_not_found() {
        return Ok(error_reply("not found", 404));
    }
    if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        return Ok(error_reply("request body too large", 413));
    }
    if rejection.find::<warp::reject::LengthRequired>().is_some() {
        return Ok(error_reply("content-length header required", 411));
    }
    if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(error_reply("method not allowed", 405));
    }

    Ok(json_reply(
        &json!({"error": format!("{rejection:?}"), "timestamp": current_timestamp()}),
        400,
    ))
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
