//! Archival service client
//!
//! The router forwards archive and restore requests verbatim and reports the
//! service's outcome; how entities are stored is the service's business.

use super::{build_client, CollaboratorError};
use crate::config::CollaboratorSection;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveRequest {
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

impl ArchiveRequest {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            reason: None,
            requested_by: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ArchiveStatus {
    Archived,
    Restored,
    /// Entity was already in the requested state
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveOutcome {
    pub status: ArchiveStatus,
}

#[async_trait]
pub trait ArchivalService: Send + Sync {
    async fn archive(&self, request: ArchiveRequest) -> Result<ArchiveOutcome, CollaboratorError>;
    async fn restore(&self, request: ArchiveRequest) -> Result<ArchiveOutcome, CollaboratorError>;
}

/// POSTs to `{url}/archive` and `{url}/restore`
#[derive(Debug, Clone)]
pub struct HttpArchivalClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpArchivalClient {
    pub fn new(section: &CollaboratorSection) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: build_client(section.timeout())?,
            base_url: section.url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(
        &self,
        action: &str,
        request: &ArchiveRequest,
    ) -> Result<ArchiveOutcome, CollaboratorError> {
        let url = format!("{}/{action}", self.base_url);
        debug!(url = %url, entity_id = %request.entity_id, "Forwarding to archival service");

        let response = self.client.post(&url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CollaboratorError::Status {
                status: status.as_u16(),
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl ArchivalService for HttpArchivalClient {
    async fn archive(&self, request: ArchiveRequest) -> Result<ArchiveOutcome, CollaboratorError> {
        self.post("archive", &request).await
    }

    async fn restore(&self, request: ArchiveRequest) -> Result<ArchiveOutcome, CollaboratorError> {
        self.post("restore", &request).await
    }
}
