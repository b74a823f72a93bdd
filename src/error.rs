//! Error taxonomy for the task router
//!
//! Every failure path ends in one of the [`ErrorKind`] values below and is
//! returned to the caller inside the uniform envelope. Messages are sanitized
//! before they leave the process.

use crate::protocol::messages::ErrorDescriptor;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Wire-level error kind carried in `error.kind`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnknownTaskType,
    ValidationError,
    DuplicateRequestId,
    ServiceNotReady,
    StreamingUnsupported,
    StreamCapacityExhausted,
    UpstreamTimeout,
    UpstreamError,
    MalformedUpstreamResponse,
    UpstreamStreamTruncated,
    ClientCancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownTaskType => "UnknownTaskType",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::DuplicateRequestId => "DuplicateRequestId",
            ErrorKind::ServiceNotReady => "ServiceNotReady",
            ErrorKind::StreamingUnsupported => "StreamingUnsupported",
            ErrorKind::StreamCapacityExhausted => "StreamCapacityExhausted",
            ErrorKind::UpstreamTimeout => "UpstreamTimeout",
            ErrorKind::UpstreamError => "UpstreamError",
            ErrorKind::MalformedUpstreamResponse => "MalformedUpstreamResponse",
            ErrorKind::UpstreamStreamTruncated => "UpstreamStreamTruncated",
            ErrorKind::ClientCancelled => "ClientCancelled",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Errors resolved locally from the caller's input, with no upstream call
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::UnknownTaskType
                | ErrorKind::ValidationError
                | ErrorKind::DuplicateRequestId
                | ErrorKind::StreamingUnsupported
        )
    }

    /// Failures that originate at a backend agent and are surfaced verbatim
    pub fn is_upstream_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::UpstreamTimeout
                | ErrorKind::UpstreamError
                | ErrorKind::MalformedUpstreamResponse
                | ErrorKind::UpstreamStreamTruncated
        )
    }

    /// HTTP status used when the envelope is returned over HTTP
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::UnknownTaskType => 404,
            ErrorKind::ValidationError => 400,
            ErrorKind::DuplicateRequestId => 409,
            ErrorKind::StreamingUnsupported => 400,
            ErrorKind::ServiceNotReady => 503,
            ErrorKind::StreamCapacityExhausted => 503,
            ErrorKind::UpstreamTimeout => 504,
            ErrorKind::UpstreamError
            | ErrorKind::MalformedUpstreamResponse
            | ErrorKind::UpstreamStreamTruncated => 502,
            ErrorKind::ClientCancelled => 499,
            ErrorKind::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for routing and dispatch
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RouterError {
    #[error("Unknown task type: {task_type}")]
    UnknownTaskType { task_type: String },

    #[error("Invalid request: {message}")]
    Validation { message: String },

    #[error("Duplicate request id: {request_id}")]
    DuplicateRequestId { request_id: String },

    #[error("Service not ready: {message}")]
    ServiceNotReady { message: String },

    #[error("Task type '{task_type}' does not support streaming")]
    StreamingUnsupported { task_type: String },

    #[error("Stream capacity exhausted: {max_open_streams} streams already open")]
    StreamCapacityExhausted { max_open_streams: usize },

    #[error("Agent for '{task_type}' did not respond within {timeout_ms}ms")]
    UpstreamTimeout { task_type: String, timeout_ms: u64 },

    #[error("Agent error: {message}")]
    Upstream { message: String },

    #[error("Malformed agent response: {message}")]
    MalformedUpstreamResponse { message: String },

    #[error("Agent stream ended without a terminal frame")]
    UpstreamStreamTruncated,

    #[error("Request cancelled by client")]
    ClientCancelled,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RouterError {
    pub fn unknown_task_type<S: Into<String>>(task_type: S) -> Self {
        Self::UnknownTaskType {
            task_type: task_type.into(),
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn duplicate_request_id<S: Into<String>>(request_id: S) -> Self {
        Self::DuplicateRequestId {
            request_id: request_id.into(),
        }
    }

    pub fn not_ready<S: Into<String>>(message: S) -> Self {
        Self::ServiceNotReady {
            message: message.into(),
        }
    }

    pub fn upstream<S: Into<String>>(message: S) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedUpstreamResponse {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::UnknownTaskType { .. } => ErrorKind::UnknownTaskType,
            RouterError::Validation { .. } => ErrorKind::ValidationError,
            RouterError::DuplicateRequestId { .. } => ErrorKind::DuplicateRequestId,
            RouterError::ServiceNotReady { .. } => ErrorKind::ServiceNotReady,
            RouterError::StreamingUnsupported { .. } => ErrorKind::StreamingUnsupported,
            RouterError::StreamCapacityExhausted { .. } => ErrorKind::StreamCapacityExhausted,
            RouterError::UpstreamTimeout { .. } => ErrorKind::UpstreamTimeout,
            RouterError::Upstream { .. } => ErrorKind::UpstreamError,
            RouterError::MalformedUpstreamResponse { .. } => ErrorKind::MalformedUpstreamResponse,
            RouterError::UpstreamStreamTruncated => ErrorKind::UpstreamStreamTruncated,
            RouterError::ClientCancelled => ErrorKind::ClientCancelled,
            RouterError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Convert to the wire error descriptor, sanitizing the message
    pub fn to_descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor {
            kind: self.kind(),
            message: sanitize_error_message(&self.to_string()),
        }
    }
}

static SECRET_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SECRET_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Redact credential-looking content and cap the length of an outbound message
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_ASSIGNMENT.replace_all(message, "${1}=***");
    let mut sanitized = SECRET_PATH
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(truncate_suffix);
    }

    sanitized
}

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;
