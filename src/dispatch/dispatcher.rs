//! The dispatcher
//!
//! Admission runs in a fixed order so that no upstream call is ever made for
//! a request that is going to be refused:
//!
//! 1. validate the request (task type known, request id present, mode, inputs)
//! 2. check readiness against the current preflight snapshot
//! 3. for streams, check the endpoint supports streaming
//! 4. reserve the request id in the dedupe window
//!
//! Synchronous calls are never retried. The backend call runs on its own task
//! under the endpoint timeout, so a caller that goes away does not abort an
//! already-issued request; its result is discarded.

use super::envelope;
use super::map_transport_error;
use super::relay::{CompletionHook, RelaySlot, RelayStream};
use crate::collaborators::audit::{spawn_record, AuditEntry, AuditSink, NoopAuditSink, OUTCOME_OK};
use crate::config::RouterConfig;
use crate::dispatch_span;
use crate::error::{RouterError, RouterResult};
use crate::normalizer::{RecentRequestIds, RequestNormalizer};
use crate::observability::metrics;
use crate::preflight::ReadinessState;
use crate::protocol::{AgentRunRequest, AgentRunResponse, RawRunRequest, StreamEvent, StreamEventKind};
use crate::registry::{AgentEndpoint, AgentRegistry};
use crate::transport::AgentTransport;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn, Instrument};

pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
    normalizer: RequestNormalizer,
    readiness: Arc<ReadinessState>,
    transport: Arc<dyn AgentTransport>,
    audit: Arc<dyn AuditSink>,
    default_timeout: Duration,
    streams: Arc<Semaphore>,
    max_open_streams: usize,
}

impl Dispatcher {
    pub fn new(
        config: &RouterConfig,
        registry: Arc<AgentRegistry>,
        readiness: Arc<ReadinessState>,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        let recent = RecentRequestIds::new(
            config.router.dedupe_window(),
            config.router.dedupe_capacity,
        );

        Self {
            normalizer: RequestNormalizer::new(Arc::clone(&registry), recent),
            registry,
            readiness,
            transport,
            audit: Arc::new(NoopAuditSink),
            default_timeout: config.router.default_timeout(),
            streams: Arc::new(Semaphore::new(config.router.max_open_streams)),
            max_open_streams: config.router.max_open_streams,
        }
    }

    /// Sink for LIVE-mode audit entries
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn readiness(&self) -> Arc<ReadinessState> {
        Arc::clone(&self.readiness)
    }

    /// Relays currently holding a slot
    pub fn open_streams(&self) -> usize {
        self.max_open_streams - self.streams.available_permits()
    }

    /// Admit and run a raw synchronous request; always returns an envelope
    pub async fn submit(&self, raw: RawRunRequest) -> AgentRunResponse {
        metrics().request_received();
        let request_id = raw.request_id.clone().unwrap_or_default();

        match self.admit(raw, false) {
            Ok(request) => self.run_sync(request).await,
            Err(err) => {
                Self::log_rejection(&request_id, &err);
                envelope::from_error(&request_id, &err)
            }
        }
    }

    /// Admit a raw streaming request and open its relay
    ///
    /// Errors are pre-dispatch rejections; upstream failures arrive as the
    /// relay's terminal `ERROR` event.
    pub fn submit_stream(&self, raw: RawRunRequest) -> RouterResult<RelayStream> {
        metrics().request_received();
        let request_id = raw.request_id.clone().unwrap_or_default();

        self.admit(raw, true)
            .and_then(|request| self.run_stream(request))
            .inspect_err(|err| Self::log_rejection(&request_id, err))
    }

    fn admit(&self, raw: RawRunRequest, streaming: bool) -> RouterResult<AgentRunRequest> {
        let request = self.normalizer.validate(raw)?;
        self.readiness.check_dispatch(&request.task_type)?;
        if streaming {
            self.streaming_endpoint(&request.task_type)?;
        }
        self.normalizer.reserve(&request)?;
        Ok(request)
    }

    fn streaming_endpoint(&self, task_type: &str) -> RouterResult<&AgentEndpoint> {
        let endpoint = self.registry.resolve(task_type)?;
        if !endpoint.supports_streaming {
            return Err(RouterError::StreamingUnsupported {
                task_type: task_type.to_string(),
            });
        }
        Ok(endpoint)
    }

    fn log_rejection(request_id: &str, err: &RouterError) {
        metrics().request_rejected(err.kind());
        info!(request_id = %request_id, kind = %err.kind(), error = %err, "Request rejected");
    }

    /// Run a normalized request and wait for the envelope
    pub async fn run_sync(&self, request: AgentRunRequest) -> AgentRunResponse {
        let span = dispatch_span!(
            request_id = %request.request_id,
            task_type = %request.task_type,
            mode = %request.mode
        );

        async {
            let endpoint = match self
                .readiness
                .check_dispatch(&request.task_type)
                .and_then(|_| self.registry.resolve(&request.task_type))
            {
                Ok(endpoint) => endpoint.clone(),
                Err(err) => {
                    metrics().request_rejected(err.kind());
                    return envelope::from_error(&request.request_id, &err);
                }
            };

            let timeout = endpoint.effective_timeout(self.default_timeout);
            let started = Instant::now();
            debug!(url = %endpoint.url("/run"), timeout_ms = timeout.as_millis() as u64, "Dispatching");

            let result = self.call(endpoint, &request, timeout).await;
            let elapsed = started.elapsed();

            let response = match result {
                Ok(outputs) => {
                    metrics().dispatch_succeeded(&request.task_type, elapsed);
                    info!(duration_ms = elapsed.as_millis() as u64, "Dispatch succeeded");
                    AgentRunResponse::success(&request.request_id, outputs)
                }
                Err(err) => {
                    metrics().dispatch_failed(&request.task_type, elapsed, err.kind());
                    warn!(
                        kind = %err.kind(),
                        error = %err,
                        duration_ms = elapsed.as_millis() as u64,
                        "Dispatch failed"
                    );
                    envelope::from_error(&request.request_id, &err)
                }
            };

            if request.mode.is_live() {
                self.audit_sync(&request, &response, elapsed);
            }

            response
        }
        .instrument(span)
        .await
    }

    /// Issue the backend call on its own task under `timeout`
    async fn call(
        &self,
        endpoint: AgentEndpoint,
        request: &AgentRunRequest,
        timeout: Duration,
    ) -> RouterResult<Value> {
        let transport = Arc::clone(&self.transport);
        let task_type = endpoint.task_type.clone();
        let upstream_request = request.clone();

        let call = tokio::spawn(async move {
            tokio::time::timeout(timeout, transport.run(&endpoint, &upstream_request)).await
        });

        match call.await {
            Ok(Ok(Ok(reply))) => envelope::classify(&reply),
            Ok(Ok(Err(e))) => Err(map_transport_error(e, &task_type, timeout)),
            Ok(Err(_elapsed)) => Err(RouterError::UpstreamTimeout {
                task_type,
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(join_error) => Err(RouterError::internal(format!(
                "dispatch task failed: {join_error}"
            ))),
        }
    }

    fn audit_sync(&self, request: &AgentRunRequest, response: &AgentRunResponse, elapsed: Duration) {
        let (outcome, summary) = match response.error() {
            None => (
                OUTCOME_OK.to_string(),
                format!("completed in {}ms", elapsed.as_millis()),
            ),
            Some(error) => (error.kind.as_str().to_string(), error.message.clone()),
        };

        spawn_record(
            Arc::clone(&self.audit),
            AuditEntry::new(&request.task_type, &request.request_id, outcome, summary),
        );
    }

    /// Open a relay for a normalized request
    ///
    /// Nothing is sent upstream until the returned stream is polled.
    pub fn run_stream(&self, request: AgentRunRequest) -> RouterResult<RelayStream> {
        self.readiness.check_dispatch(&request.task_type)?;
        let endpoint = self.streaming_endpoint(&request.task_type)?.clone();

        let permit = Arc::clone(&self.streams).try_acquire_owned().map_err(|_| {
            RouterError::StreamCapacityExhausted {
                max_open_streams: self.max_open_streams,
            }
        })?;

        let timeout = endpoint.effective_timeout(self.default_timeout);
        let on_complete = request
            .mode
            .is_live()
            .then(|| self.stream_audit_hook(&request));

        info!(
            request_id = %request.request_id,
            task_type = %request.task_type,
            mode = %request.mode,
            "Opening stream relay"
        );

        Ok(RelayStream::new(
            Arc::clone(&self.transport),
            endpoint,
            request,
            timeout,
            RelaySlot::new(permit),
            on_complete,
        ))
    }

    fn stream_audit_hook(&self, request: &AgentRunRequest) -> CompletionHook {
        let audit = Arc::clone(&self.audit);
        let task_type = request.task_type.clone();
        let request_id = request.request_id.clone();

        Box::new(move |event: &StreamEvent| {
            let (outcome, summary) = match event.kind {
                StreamEventKind::Done => (
                    OUTCOME_OK.to_string(),
                    format!("stream completed after {} events", event.sequence + 1),
                ),
                _ => (
                    event
                        .payload
                        .get("kind")
                        .and_then(Value::as_str)
                        .unwrap_or("UpstreamError")
                        .to_string(),
                    event
                        .payload
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                ),
            };
            spawn_record(audit, AuditEntry::new(task_type, request_id, outcome, summary));
        })
    }
}
