//! Clients for the external services the router reports to
//!
//! Both collaborators sit off the critical path of a dispatch: the audit sink
//! is written from a spawned task in LIVE mode only, and the archival service
//! is a thin pass-through exposed on the HTTP surface.

pub mod archival;
pub mod audit;

pub use archival::{
    ArchivalService, ArchiveOutcome, ArchiveRequest, ArchiveStatus, HttpArchivalClient,
};
pub use audit::{spawn_record, AuditEntry, AuditReference, AuditSink, HttpAuditSink, NoopAuditSink};

use thiserror::Error;

/// Failures talking to a collaborator service
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("service returned HTTP {status}")]
    Status { status: u16 },
    #[error("failed to decode reply: {0}")]
    Decode(String),
    #[error("failed to build client: {0}")]
    Client(String),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CollaboratorError::Decode(err.to_string())
        } else {
            CollaboratorError::Http(err.to_string())
        }
    }
}

/// Client with a fixed per-request timeout
pub(crate) fn build_client(timeout: std::time::Duration) -> Result<reqwest::Client, CollaboratorError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CollaboratorError::Client(e.to_string()))
}
