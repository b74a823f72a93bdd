//! Audit-log sink
//!
//! LIVE calls produce one [`AuditEntry`] each. Entries are recorded from a
//! spawned task; the caller's result never waits on or depends on the sink.

use super::{build_client, CollaboratorError};
use crate::config::CollaboratorSection;
use crate::observability::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Outcome label for a successful call
pub const OUTCOME_OK: &str = "ok";

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub task_type: String,
    pub request_id: String,
    /// `"ok"` or the error kind of a failed call
    pub outcome: String,
    pub summary: String,
}

impl AuditEntry {
    pub fn new(
        task_type: impl Into<String>,
        request_id: impl Into<String>,
        outcome: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            task_type: task_type.into(),
            request_id: request_id.into(),
            outcome: outcome.into(),
            summary: summary.into(),
        }
    }
}

/// Durable identifier returned by the sink
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct AuditReference(pub String);

impl fmt::Display for AuditReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<AuditReference, CollaboratorError>;
}

/// Sink used when no audit service is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _entry: AuditEntry) -> Result<AuditReference, CollaboratorError> {
        Ok(AuditReference("noop".to_string()))
    }
}

/// POSTs entries as JSON and reads `{"reference": "..."}` back
#[derive(Debug, Clone)]
pub struct HttpAuditSink {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct RecordReply {
    reference: String,
}

impl HttpAuditSink {
    pub fn new(section: &CollaboratorSection) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: build_client(section.timeout())?,
            url: section.url.clone(),
        })
    }
}

#[async_trait]
impl AuditSink for HttpAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<AuditReference, CollaboratorError> {
        let response = self.client.post(&self.url).json(&entry).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CollaboratorError::Status {
                status: status.as_u16(),
            });
        }

        let reply: RecordReply = response.json().await?;
        Ok(AuditReference(reply.reference))
    }
}

/// Record `entry` on a spawned task, logging and counting the outcome
pub fn spawn_record(sink: Arc<dyn AuditSink>, entry: AuditEntry) -> JoinHandle<()> {
    tokio::spawn(async move {
        let request_id = entry.request_id.clone();
        match sink.record(entry).await {
            Ok(reference) => {
                metrics().audit_written();
                info!(request_id = %request_id, reference = %reference, "Audit entry recorded");
            }
            Err(e) => {
                metrics().audit_failed();
                warn!(request_id = %request_id, error = %e, "Failed to record audit entry");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn section(url: String) -> CollaboratorSection {
        CollaboratorSection {
            url,
            timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn test_http_sink_returns_reference() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/entries"))
            .and(body_partial_json(serde_json::json!({
                "task_type": "bias_scan",
                "request_id": "r-1",
                "outcome": "ok"
            })))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({"reference": "sheet-42"})),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let sink = HttpAuditSink::new(&section(format!("{}/entries", mock_server.uri()))).unwrap();
        let reference = sink
            .record(AuditEntry::new("bias_scan", "r-1", OUTCOME_OK, "3 findings"))
            .await
            .unwrap();

        assert_eq!(reference, AuditReference("sheet-42".to_string()));
    }

    #[tokio::test]
    async fn test_http_sink_reports_status_and_decode_failures() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/garbled"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock_server)
            .await;

        let entry = AuditEntry::new("bias_scan", "r-1", OUTCOME_OK, "");

        let sink = HttpAuditSink::new(&section(format!("{}/down", mock_server.uri()))).unwrap();
        assert_eq!(
            sink.record(entry.clone()).await.unwrap_err(),
            CollaboratorError::Status { status: 500 }
        );

        let sink = HttpAuditSink::new(&section(format!("{}/garbled", mock_server.uri()))).unwrap();
        assert!(matches!(
            sink.record(entry).await.unwrap_err(),
            CollaboratorError::Decode(_)
        ));
    }

    #[tokio::test]
    async fn test_spawn_record_swallows_failures() {
        let sink: Arc<dyn AuditSink> = Arc::new(
            HttpAuditSink::new(&section("http://127.0.0.1:1/entries".to_string())).unwrap(),
        );

        let handle = spawn_record(sink, AuditEntry::new("bias_scan", "r-1", OUTCOME_OK, ""));

        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_noop_sink() {
        let reference = NoopAuditSink
            .record(AuditEntry::new("x", "r", OUTCOME_OK, ""))
            .await
            .unwrap();
        assert_eq!(reference.to_string(), "noop");
    }
}
