//! Stream relay
//!
//! A relay is a lazy, pull-based [`Stream`] of [`StreamEvent`]s. Nothing is
//! sent upstream until the caller polls it for the first time. Each backend
//! frame produces exactly one caller event; the relay numbers events itself
//! and always ends with exactly one `DONE` or `ERROR`.
//!
//! Dropping a [`RelayStream`] before it terminates, or calling
//! [`RelayStream::cancel`], closes it at once, releases its slot and sends a
//! best-effort cancel to the agent.

use super::map_transport_error;
use crate::error::{sanitize_error_message, ErrorKind, RouterError};
use crate::observability::metrics;
use crate::protocol::{AgentRunRequest, StreamEvent, StreamEventKind};
use crate::registry::AgentEndpoint;
use crate::stream_span;
use crate::transport::{AgentTransport, FrameStream, TransportError};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::{json, Map, Value};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn, Instrument, Span};

/// Called once with the terminal event of a relay that ran to completion
pub type CompletionHook = Box<dyn FnOnce(&StreamEvent) + Send>;

/// One unit of the open-stream budget; released on drop
pub struct RelaySlot {
    _permit: OwnedSemaphorePermit,
}

impl RelaySlot {
    pub fn new(permit: OwnedSemaphorePermit) -> Self {
        metrics().stream_opened();
        Self { _permit: permit }
    }
}

impl Drop for RelaySlot {
    fn drop(&mut self) {
        metrics().stream_closed();
    }
}

/// State shared between the relay state machine and its handle
struct RelayControl {
    transport: Arc<dyn AgentTransport>,
    endpoint: AgentEndpoint,
    request_id: String,
    upstream_issued: AtomicBool,
    finished: AtomicBool,
}

impl RelayControl {
    /// Close on behalf of the caller; no-op once the relay has terminated
    fn abandon(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        metrics().stream_cancelled();
        info!(
            request_id = %self.request_id,
            task_type = %self.endpoint.task_type,
            kind = "ClientCancelled",
            "Stream cancelled by client"
        );

        if !self.upstream_issued.load(Ordering::SeqCst) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(request_id = %self.request_id, "No runtime available, skipping upstream cancel");
            return;
        };

        let transport = Arc::clone(&self.transport);
        let endpoint = self.endpoint.clone();
        let request_id = self.request_id.clone();
        handle.spawn(async move {
            if let Err(e) = transport.cancel(&endpoint, &request_id).await {
                debug!(request_id = %request_id, error = %e, "Upstream cancel failed");
            }
        });
    }
}

/// Caller-facing handle of an open relay
pub struct RelayStream {
    inner: BoxStream<'static, StreamEvent>,
    control: Arc<RelayControl>,
}

impl RelayStream {
    pub(crate) fn new(
        transport: Arc<dyn AgentTransport>,
        endpoint: AgentEndpoint,
        request: AgentRunRequest,
        timeout: Duration,
        slot: RelaySlot,
        on_complete: Option<CompletionHook>,
    ) -> Self {
        let control = Arc::new(RelayControl {
            transport: Arc::clone(&transport),
            endpoint: endpoint.clone(),
            request_id: request.request_id.clone(),
            upstream_issued: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });

        let span = stream_span!(
            request_id = %request.request_id,
            task_type = %request.task_type,
            mode = %request.mode
        );

        let state = RelayState {
            phase: Phase::Pending,
            transport,
            endpoint,
            request,
            timeout,
            next_sequence: 0,
            upstream_seen: 0,
            started: Instant::now(),
            control: Arc::clone(&control),
            slot: Some(slot),
            on_complete,
            span,
        };

        let inner = stream::unfold(state, |mut state| async move {
            let span = state.span.clone();
            let event = state.next_event().instrument(span).await?;
            Some((event, state))
        })
        .boxed();

        Self { inner, control }
    }

    pub fn request_id(&self) -> &str {
        &self.control.request_id
    }

    /// Close the relay now; no further events are produced
    pub fn cancel(&mut self) {
        self.control.abandon();
        // Dropping the state machine drops the upstream connection and the slot
        self.inner = stream::empty().boxed();
    }
}

impl Stream for RelayStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        self.control.abandon();
    }
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStream")
            .field("request_id", &self.control.request_id)
            .field("task_type", &self.control.endpoint.task_type)
            .finish()
    }
}

enum Phase {
    Pending,
    Open {
        upstream: FrameStream,
        deadline: Instant,
    },
    Closed,
}

struct RelayState {
    phase: Phase,
    transport: Arc<dyn AgentTransport>,
    endpoint: AgentEndpoint,
    request: AgentRunRequest,
    timeout: Duration,
    next_sequence: u64,
    upstream_seen: u64,
    started: Instant,
    control: Arc<RelayControl>,
    slot: Option<RelaySlot>,
    on_complete: Option<CompletionHook>,
    span: Span,
}

impl RelayState {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        match std::mem::replace(&mut self.phase, Phase::Closed) {
            Phase::Closed => None,
            Phase::Pending => {
                let deadline = self.started_now();
                self.control.upstream_issued.store(true, Ordering::SeqCst);
                debug!(url = %self.endpoint.url("/run/stream"), "Opening agent stream");

                let opened = timeout_at(
                    deadline,
                    self.transport.run_stream(&self.endpoint, &self.request),
                )
                .await;

                match opened {
                    Ok(Ok(upstream)) => Some(self.pull(upstream, deadline).await),
                    Ok(Err(e)) => Some(self.fail(self.map_transport_error(e))),
                    Err(_) => Some(self.fail(self.timeout_error())),
                }
            }
            Phase::Open { upstream, deadline } => Some(self.pull(upstream, deadline).await),
        }
    }

    /// Restart the clock at first poll; the deadline covers the whole stream
    fn started_now(&mut self) -> Instant {
        self.started = Instant::now();
        self.started + self.timeout
    }

    async fn pull(&mut self, mut upstream: FrameStream, deadline: Instant) -> StreamEvent {
        let frame = match timeout_at(deadline, upstream.next()).await {
            Err(_) => return self.fail(self.timeout_error()),
            Ok(None) => return self.fail(RouterError::UpstreamStreamTruncated),
            Ok(Some(Err(TransportError::Connect(message)))) => {
                debug!(error = %message, "Agent stream interrupted");
                return self.fail(RouterError::UpstreamStreamTruncated);
            }
            Ok(Some(Err(e))) => return self.fail(self.map_transport_error(e)),
            Ok(Some(Ok(frame))) => frame,
        };

        let (kind, payload) = match self.parse_frame(frame) {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(e),
        };
        self.upstream_seen += 1;

        match kind {
            StreamEventKind::Done => self.finish(StreamEventKind::Done, payload, None),
            StreamEventKind::Error => {
                let message = payload
                    .get("message")
                    .and_then(Value::as_str)
                    .map(sanitize_error_message)
                    .unwrap_or_else(|| "agent reported an error".to_string());
                warn!(message = %message, "Agent stream reported an error");
                let payload = json!({
                    "kind": "UpstreamError",
                    "message": message,
                    "detail": payload,
                });
                self.finish(
                    StreamEventKind::Error,
                    payload,
                    Some(ErrorKind::UpstreamError),
                )
            }
            StreamEventKind::Progress | StreamEventKind::Output => {
                self.phase = Phase::Open { upstream, deadline };
                self.emit(kind, payload)
            }
        }
    }

    /// Validate one backend frame `{sequence?, kind, payload?}`
    fn parse_frame(&self, frame: Value) -> Result<(StreamEventKind, Value), RouterError> {
        let Value::Object(mut frame) = frame else {
            return Err(RouterError::malformed("stream frame is not a JSON object"));
        };

        let kind = frame
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| RouterError::malformed("stream frame has no kind"))?;
        let kind = StreamEventKind::parse(kind)
            .ok_or_else(|| RouterError::malformed(format!("unknown stream frame kind '{kind}'")))?;

        match frame.get("sequence") {
            None | Some(Value::Null) => {}
            Some(sequence) => {
                if sequence.as_u64() != Some(self.upstream_seen) {
                    return Err(RouterError::malformed(format!(
                        "stream frame out of order: expected sequence {}, got {sequence}",
                        self.upstream_seen
                    )));
                }
            }
        }

        let payload = match frame.remove("payload") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(payload) => payload,
        };

        Ok((kind, payload))
    }

    fn map_transport_error(&self, err: TransportError) -> RouterError {
        map_transport_error(err, &self.endpoint.task_type, self.timeout)
    }

    fn timeout_error(&self) -> RouterError {
        self.map_transport_error(TransportError::Timeout)
    }

    fn emit(&mut self, kind: StreamEventKind, payload: Value) -> StreamEvent {
        let event = StreamEvent {
            request_id: self.request.request_id.clone(),
            sequence: self.next_sequence,
            kind,
            payload,
        };
        self.next_sequence += 1;
        event
    }

    fn fail(&mut self, err: RouterError) -> StreamEvent {
        let descriptor = err.to_descriptor();
        let payload = json!({
            "kind": descriptor.kind,
            "message": descriptor.message,
        });
        self.finish(StreamEventKind::Error, payload, Some(descriptor.kind))
    }

    /// Emit the terminal event and release everything the relay holds
    fn finish(
        &mut self,
        kind: StreamEventKind,
        payload: Value,
        failure: Option<ErrorKind>,
    ) -> StreamEvent {
        self.phase = Phase::Closed;
        let event = self.emit(kind, payload);

        self.control.finished.store(true, Ordering::SeqCst);
        self.slot.take();

        let elapsed = self.started.elapsed();
        metrics().stream_completed();
        match failure {
            None => {
                metrics().dispatch_succeeded(&self.endpoint.task_type, elapsed);
                info!(
                    events = self.next_sequence,
                    duration_ms = elapsed.as_millis() as u64,
                    "Stream completed"
                );
            }
            Some(kind) => {
                metrics().dispatch_failed(&self.endpoint.task_type, elapsed, kind);
                warn!(
                    kind = %kind,
                    events = self.next_sequence,
                    duration_ms = elapsed.as_millis() as u64,
                    "Stream terminated with error"
                );
            }
        }

        if let Some(hook) = self.on_complete.take() {
            hook(&event);
        }

        event
    }
}
