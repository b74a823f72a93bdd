//! Transport layer for calls to backend agents
//!
//! [`AgentTransport`] abstracts how the router talks to an agent: liveness and
//! readiness probes, blocking runs, streamed runs and best-effort cancellation.
//! The production implementation is HTTP ([`HttpAgentTransport`]); tests inject
//! [`crate::testing::MockTransport`].

use crate::protocol::AgentRunRequest;
use crate::registry::AgentEndpoint;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

pub mod http;
pub mod ndjson;

pub use http::HttpAgentTransport;

/// Failures talking to an agent, before any envelope classification
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("agent returned HTTP {status}")]
    Status { status: u16 },
    #[error("failed to decode agent response: {0}")]
    Decode(String),
    #[error("missing credential: {0}")]
    Credential(String),
}

/// Body of a synchronous agent reply, classified by the envelope builder
#[derive(Debug, Clone, PartialEq)]
pub enum BackendBody {
    Json(Value),
    /// Non-empty body that is not valid JSON
    Unparseable(String),
    Empty,
}

/// Raw reply to a synchronous run
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReply {
    pub status: u16,
    pub body: BackendBody,
}

impl BackendReply {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: BackendBody::Json(body),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Agent's self-reported readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessProbe {
    pub ready: bool,
    pub credentials_present: bool,
}

/// Ordered frames from an agent stream; `None` means the connection closed
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Value, TransportError>> + Send>>;

/// Transport trait for agent communication
///
/// Implementations must not retry: a failed call is reported once and the
/// caller owns retry policy.
#[async_trait::async_trait]
pub trait AgentTransport: Send + Sync {
    /// Liveness probe; `Ok` means the agent process answers
    async fn probe_liveness(
        &self,
        endpoint: &AgentEndpoint,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Readiness probe including the agent's view of its own credentials
    async fn probe_readiness(
        &self,
        endpoint: &AgentEndpoint,
        timeout: Duration,
    ) -> Result<ReadinessProbe, TransportError>;

    /// Issue a blocking run; the dispatcher applies the timeout
    async fn run(
        &self,
        endpoint: &AgentEndpoint,
        request: &AgentRunRequest,
    ) -> Result<BackendReply, TransportError>;

    /// Open a streamed run
    async fn run_stream(
        &self,
        endpoint: &AgentEndpoint,
        request: &AgentRunRequest,
    ) -> Result<FrameStream, TransportError>;

    /// Ask the agent to stop work for a request; best effort
    async fn cancel(&self, endpoint: &AgentEndpoint, request_id: &str)
        -> Result<(), TransportError>;
}
