//! Mock implementations for testing
//!
//! Provides mock AgentTransport, AuditSink and ArchivalService implementations
//! so dispatch, preflight and the HTTP surface can be tested without running
//! backend agents.

use crate::collaborators::{
    ArchivalService, ArchiveOutcome, ArchiveRequest, ArchiveStatus, AuditEntry, AuditReference,
    AuditSink, CollaboratorError,
};
use crate::protocol::AgentRunRequest;
use crate::registry::AgentEndpoint;
use crate::transport::{
    AgentTransport, BackendReply, FrameStream, ReadinessProbe, TransportError,
};
use async_trait::async_trait;
use futures::stream;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One scripted step of a mock agent stream
#[derive(Debug, Clone)]
pub enum StreamStep {
    /// Yield a decoded frame
    Frame(Value),
    /// Sleep before the next step
    Delay(Duration),
    /// Connection reset mid-stream
    Disconnect,
    /// A line that failed to decode
    Garbage(String),
    /// Never produce another frame
    Hang,
}

#[derive(Debug, Default)]
struct MockState {
    replies: HashMap<String, BackendReply>,
    run_errors: HashMap<String, TransportError>,
    run_delays: HashMap<String, Duration>,
    streams: HashMap<String, Vec<StreamStep>>,
    unreachable: HashSet<String>,
    readiness: HashMap<String, ReadinessProbe>,
    probe_delay: Option<Duration>,
    run_requests: Vec<AgentRunRequest>,
    cancelled: Vec<String>,
}

/// Scriptable in-process agent transport
///
/// Unscripted task types answer `{"outputs": {}}` to runs, report healthy to
/// probes and stream a single `DONE` frame.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    liveness_calls: AtomicUsize,
    readiness_calls: AtomicUsize,
    run_calls: AtomicUsize,
    stream_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_reply(&self, task_type: &str, reply: BackendReply) {
        self.state().replies.insert(task_type.to_string(), reply);
    }

    pub fn set_run_error(&self, task_type: &str, error: TransportError) {
        self.state().run_errors.insert(task_type.to_string(), error);
    }

    pub fn set_run_delay(&self, task_type: &str, delay: Duration) {
        self.state().run_delays.insert(task_type.to_string(), delay);
    }

    pub fn set_stream(&self, task_type: &str, steps: Vec<StreamStep>) {
        self.state().streams.insert(task_type.to_string(), steps);
    }

    pub fn set_unreachable(&self, task_type: &str) {
        self.state().unreachable.insert(task_type.to_string());
    }

    pub fn set_reachable(&self, task_type: &str) {
        self.state().unreachable.remove(task_type);
    }

    pub fn set_readiness(&self, task_type: &str, ready: bool, credentials_present: bool) {
        self.state().readiness.insert(
            task_type.to_string(),
            ReadinessProbe {
                ready,
                credentials_present,
            },
        );
    }

    /// Delay applied to every probe
    pub fn set_probe_delay(&self, delay: Duration) {
        self.state().probe_delay = Some(delay);
    }

    pub fn run_call_count(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    pub fn stream_call_count(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn readiness_probe_count(&self) -> usize {
        self.readiness_calls.load(Ordering::SeqCst)
    }

    /// Run and stream calls; probes are not counted
    pub fn total_call_count(&self) -> usize {
        self.run_call_count() + self.stream_call_count()
    }

    pub fn last_run_request(&self) -> Option<AgentRunRequest> {
        self.state().run_requests.last().cloned()
    }

    pub fn cancelled_ids(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }

    async fn probe_delay(&self) {
        let delay = self.state().probe_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn scripted_stream(steps: Vec<StreamStep>) -> FrameStream {
        Box::pin(stream::unfold(
            VecDeque::from(steps),
            |mut steps| async move {
                loop {
                    match steps.pop_front()? {
                        StreamStep::Frame(frame) => return Some((Ok(frame), steps)),
                        StreamStep::Delay(delay) => tokio::time::sleep(delay).await,
                        StreamStep::Disconnect => {
                            steps.clear();
                            return Some((
                                Err(TransportError::Connect("connection reset".to_string())),
                                steps,
                            ));
                        }
                        StreamStep::Garbage(line) => {
                            return Some((Err(TransportError::Decode(line)), steps))
                        }
                        StreamStep::Hang => futures::future::pending::<()>().await,
                    }
                }
            },
        ))
    }
}

#[async_trait]
impl AgentTransport for MockTransport {
    async fn probe_liveness(
        &self,
        endpoint: &AgentEndpoint,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        self.liveness_calls.fetch_add(1, Ordering::SeqCst);
        self.probe_delay().await;

        if self.state().unreachable.contains(&endpoint.task_type) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        Ok(())
    }

    async fn probe_readiness(
        &self,
        endpoint: &AgentEndpoint,
        _timeout: Duration,
    ) -> Result<ReadinessProbe, TransportError> {
        self.readiness_calls.fetch_add(1, Ordering::SeqCst);
        self.probe_delay().await;

        let probe = self.state().readiness.get(&endpoint.task_type).copied();
        Ok(probe.unwrap_or(ReadinessProbe {
            ready: true,
            credentials_present: true,
        }))
    }

    async fn run(
        &self,
        endpoint: &AgentEndpoint,
        request: &AgentRunRequest,
    ) -> Result<BackendReply, TransportError> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);

        let (delay, outcome) = {
            let mut state = self.state();
            state.run_requests.push(request.clone());
            let delay = state.run_delays.get(&endpoint.task_type).copied();
            let outcome = match state.run_errors.get(&endpoint.task_type) {
                Some(error) => Err(error.clone()),
                None if state.unreachable.contains(&endpoint.task_type) => {
                    Err(TransportError::Connect("connection refused".to_string()))
                }
                None => Ok(state
                    .replies
                    .get(&endpoint.task_type)
                    .cloned()
                    .unwrap_or_else(|| BackendReply::json(200, json!({"outputs": {}})))),
            };
            (delay, outcome)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }

    async fn run_stream(
        &self,
        endpoint: &AgentEndpoint,
        _request: &AgentRunRequest,
    ) -> Result<FrameStream, TransportError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);

        if self.state().unreachable.contains(&endpoint.task_type) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let steps = self
            .state()
            .streams
            .get(&endpoint.task_type)
            .cloned()
            .unwrap_or_else(|| vec![StreamStep::Frame(json!({"kind": "DONE"}))]);
        Ok(Self::scripted_stream(steps))
    }

    async fn cancel(&self, _endpoint: &AgentEndpoint, request_id: &str) -> Result<(), TransportError> {
        self.state().cancelled.push(request_id.to_string());
        Ok(())
    }
}

/// Audit sink that keeps entries in memory
#[derive(Debug, Default)]
pub struct MockAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
    should_fail: bool,
}

impl MockAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl AuditSink for MockAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<AuditReference, CollaboratorError> {
        if self.should_fail {
            return Err(CollaboratorError::Status { status: 503 });
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(entry);
        Ok(AuditReference(format!("mock-{}", entries.len())))
    }
}

/// Archival service tracking archived entity ids in memory
#[derive(Debug, Default)]
pub struct MockArchivalService {
    archived: Mutex<HashSet<String>>,
}

impl MockArchivalService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_archived(&self, entity_id: &str) -> bool {
        self.archived
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(entity_id)
    }
}

#[async_trait]
impl ArchivalService for MockArchivalService {
    async fn archive(&self, request: ArchiveRequest) -> Result<ArchiveOutcome, CollaboratorError> {
        let inserted = self
            .archived
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request.entity_id);
        Ok(ArchiveOutcome {
            status: if inserted {
                ArchiveStatus::Archived
            } else {
                ArchiveStatus::Noop
            },
        })
    }

    async fn restore(&self, request: ArchiveRequest) -> Result<ArchiveOutcome, CollaboratorError> {
        let removed = self
            .archived
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request.entity_id);
        Ok(ArchiveOutcome {
            status: if removed {
                ArchiveStatus::Restored
            } else {
                ArchiveStatus::Noop
            },
        })
    }
}
