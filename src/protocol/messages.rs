//! Protocol message types for the task router
//!
//! This module defines the inbound request shapes, the outbound result envelope,
//! stream frames and preflight reports.

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Execution mode requested by the caller
///
/// `Demo` is the default: `Live` may trigger real external side effects
/// (audit log writes) that a demo run must never perform.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunMode {
    #[default]
    Demo,
    Live,
}

impl RunMode {
    /// Parse a mode string, accepting either case
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("demo") {
            Some(RunMode::Demo)
        } else if s.eq_ignore_ascii_case("live") {
            Some(RunMode::Live)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Demo => "DEMO",
            RunMode::Live => "LIVE",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, RunMode::Live)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request as received from a caller, before normalization
///
/// Every field is optional so that missing fields surface as
/// `ValidationError` from the normalizer instead of a body decode failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RawRunRequest {
    pub task_type: Option<String>,
    pub request_id: Option<String>,
    pub mode: Option<String>,
    pub inputs: Option<Value>,
}

impl RawRunRequest {
    /// Convenience constructor used by tests and the submit-task client
    pub fn new(task_type: impl Into<String>, request_id: impl Into<String>, inputs: Value) -> Self {
        Self {
            task_type: Some(task_type.into()),
            request_id: Some(request_id.into()),
            mode: None,
            inputs: Some(inputs),
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = Some(mode.as_str().to_string());
        self
    }
}

/// Canonical request handed to the dispatcher and forwarded to the agent
///
/// # Examples
/// ```
/// use task_router::protocol::{AgentRunRequest, RunMode};
/// use serde_json::json;
///
/// let request = AgentRunRequest {
///     task_type: "bias_scan".to_string(),
///     request_id: "req-1".to_string(),
///     mode: RunMode::Demo,
///     inputs: json!({"document": "..."}),
/// };
/// let body = serde_json::to_value(&request).unwrap();
/// assert_eq!(body["mode"], "DEMO");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRunRequest {
    pub task_type: String,
    /// Caller-supplied correlation id, unique per logical call
    pub request_id: String,
    pub mode: RunMode,
    /// Opaque structured payload, always a JSON object
    pub inputs: Value,
}

/// Error half of the result envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Uniform result envelope returned for every synchronous call
///
/// Exactly one of `outputs` and `error` is populated. The fields are private
/// and the only constructors are [`AgentRunResponse::success`] and
/// [`AgentRunResponse::failure`], so the invariant holds by construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRunResponse {
    ok: bool,
    request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDescriptor>,
}

impl AgentRunResponse {
    pub fn success(request_id: impl Into<String>, outputs: Value) -> Self {
        Self {
            ok: true,
            request_id: request_id.into(),
            outputs: Some(outputs),
            error: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: ErrorDescriptor) -> Self {
        Self {
            ok: false,
            request_id: request_id.into(),
            outputs: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn outputs(&self) -> Option<&Value> {
        self.outputs.as_ref()
    }

    pub fn error(&self) -> Option<&ErrorDescriptor> {
        self.error.as_ref()
    }

    /// Error kind, if this is a failure envelope
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Check the outputs-xor-error invariant (relevant for decoded envelopes)
    pub fn is_well_formed(&self) -> bool {
        match (&self.outputs, &self.error) {
            (Some(_), None) => self.ok,
            (None, Some(_)) => !self.ok,
            _ => false,
        }
    }
}

/// Kind of a stream frame
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamEventKind {
    Progress,
    Output,
    Error,
    Done,
}

impl StreamEventKind {
    /// Parse a frame kind, accepting either case
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PROGRESS" => Some(StreamEventKind::Progress),
            "OUTPUT" => Some(StreamEventKind::Output),
            "ERROR" => Some(StreamEventKind::Error),
            "DONE" => Some(StreamEventKind::Done),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEventKind::Progress => "PROGRESS",
            StreamEventKind::Output => "OUTPUT",
            StreamEventKind::Error => "ERROR",
            StreamEventKind::Done => "DONE",
        }
    }

    /// DONE and ERROR end a stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEventKind::Error | StreamEventKind::Done)
    }
}

/// One frame of a relayed stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamEvent {
    pub request_id: String,
    /// Contiguous per request, starting at 0
    pub sequence: u64,
    pub kind: StreamEventKind,
    pub payload: Value,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Outcome of probing one registered agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreflightReport {
    pub task_type: String,
    pub mandatory: bool,
    /// Liveness probe succeeded
    pub reachable: bool,
    /// Readiness probe succeeded and the agent reported itself ready
    #[serde(default)]
    pub ready: bool,
    pub credentials_present: bool,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PreflightReport {
    pub fn is_healthy(&self) -> bool {
        self.reachable && self.ready && self.credentials_present
    }
}
