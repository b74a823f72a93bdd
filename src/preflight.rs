//! Preflight validation of registered agents
//!
//! Every run probes all endpoints concurrently and publishes a complete
//! [`PreflightSnapshot`]. Readers on the request path load the current snapshot
//! from [`ReadinessState`] without taking a lock; a run never mutates a
//! published snapshot, it swaps in a new one.

use crate::error::{RouterError, RouterResult};
use crate::observability::metrics;
use crate::preflight_span;
use crate::protocol::PreflightReport;
use crate::registry::{AgentEndpoint, AgentRegistry};
use crate::transport::AgentTransport;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Result of one complete preflight run
#[derive(Debug, Clone, Default)]
pub struct PreflightSnapshot {
    reports: Vec<PreflightReport>,
    completed_at: Option<DateTime<Utc>>,
}

impl PreflightSnapshot {
    /// Snapshot before any run has completed; never ready
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn from_reports(reports: Vec<PreflightReport>) -> Self {
        Self {
            reports,
            completed_at: Some(Utc::now()),
        }
    }

    pub fn reports(&self) -> &[PreflightReport] {
        &self.reports
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn report_for(&self, task_type: &str) -> Option<&PreflightReport> {
        self.reports.iter().find(|r| r.task_type == task_type)
    }

    /// Task types of mandatory agents that failed this run
    pub fn failing_mandatory(&self) -> Vec<&str> {
        self.reports
            .iter()
            .filter(|r| r.mandatory && !r.is_healthy())
            .map(|r| r.task_type.as_str())
            .collect()
    }

    /// Ready once a run has completed with every mandatory agent healthy
    pub fn is_ready(&self) -> bool {
        self.completed_at.is_some() && self.failing_mandatory().is_empty()
    }

    /// Gate a dispatch for `task_type` against this snapshot
    ///
    /// Only a failing mandatory agent refuses traffic, and then for every task
    /// type. A non-mandatory agent that failed its last probe is still called,
    /// so its requests fail or succeed individually at dispatch time and
    /// pick up a recovery without waiting for the next preflight run.
    pub fn check_dispatch(&self, task_type: &str) -> RouterResult<()> {
        if self.completed_at.is_none() {
            return Err(RouterError::not_ready("preflight has not completed"));
        }

        let failing = self.failing_mandatory();
        if !failing.is_empty() {
            return Err(RouterError::not_ready(format!(
                "mandatory agents unavailable: {}",
                failing.join(", ")
            )));
        }

        if let Some(report) = self.report_for(task_type).filter(|r| !r.is_healthy()) {
            debug!(
                task_type = %task_type,
                detail = report.detail.as_deref().unwrap_or(""),
                "Dispatching to an optional agent that failed preflight"
            );
        }
        Ok(())
    }
}

/// Shared, copy-on-write readiness state
#[derive(Debug)]
pub struct ReadinessState {
    current: ArcSwap<PreflightSnapshot>,
}

impl ReadinessState {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(PreflightSnapshot::pending()),
        }
    }

    pub fn snapshot(&self) -> Arc<PreflightSnapshot> {
        self.current.load_full()
    }

    pub fn replace(&self, snapshot: PreflightSnapshot) {
        self.current.store(Arc::new(snapshot));
    }

    pub fn is_ready(&self) -> bool {
        self.current.load().is_ready()
    }

    pub fn check_dispatch(&self, task_type: &str) -> RouterResult<()> {
        self.current.load().check_dispatch(task_type)
    }
}

impl Default for ReadinessState {
    fn default() -> Self {
        Self::new()
    }
}

/// What the probes established about one agent
struct ProbeOutcome {
    reachable: bool,
    ready: bool,
    credentials_present: bool,
    detail: Option<String>,
}

impl ProbeOutcome {
    fn unreachable(detail: String) -> Self {
        Self {
            reachable: false,
            ready: false,
            credentials_present: false,
            detail: Some(detail),
        }
    }

    /// Alive, but not able to take work
    fn not_ready(credentials_present: bool, detail: impl Into<String>) -> Self {
        Self {
            reachable: true,
            ready: false,
            credentials_present,
            detail: Some(detail.into()),
        }
    }
}

/// Probes every registered agent and publishes the outcome
pub struct PreflightValidator {
    registry: Arc<AgentRegistry>,
    transport: Arc<dyn AgentTransport>,
    state: Arc<ReadinessState>,
    probe_timeout: Duration,
}

impl PreflightValidator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        transport: Arc<dyn AgentTransport>,
        state: Arc<ReadinessState>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            state,
            probe_timeout,
        }
    }

    pub fn state(&self) -> Arc<ReadinessState> {
        Arc::clone(&self.state)
    }

    /// Probe all endpoints and atomically replace the readiness snapshot
    pub async fn run_preflight(&self) -> Vec<PreflightReport> {
        let span = preflight_span!(endpoints = self.registry.len());

        async {
            let endpoints = self.registry.endpoints();
            let reports: Vec<PreflightReport> =
                join_all(endpoints.into_iter().map(|e| self.probe_endpoint(e))).await;

            let snapshot = PreflightSnapshot::from_reports(reports.clone());
            let ready = snapshot.is_ready();
            let failing = reports.iter().filter(|r| !r.is_healthy()).count();
            self.state.replace(snapshot);
            metrics().preflight_completed(ready, failing);

            if ready {
                info!(failing_optional = failing, "Preflight passed");
            } else {
                error!(
                    failing = failing,
                    "Preflight failed: mandatory agents unavailable, refusing traffic"
                );
            }

            reports
        }
        .instrument(span)
        .await
    }

    async fn probe_endpoint(&self, endpoint: &AgentEndpoint) -> PreflightReport {
        let outcome = self.probe(endpoint).await;

        let report = PreflightReport {
            task_type: endpoint.task_type.clone(),
            mandatory: endpoint.mandatory,
            reachable: outcome.reachable,
            ready: outcome.ready,
            credentials_present: outcome.credentials_present,
            checked_at: Utc::now(),
            detail: outcome.detail,
        };

        if report.is_healthy() {
            debug!(task_type = %report.task_type, "Agent healthy");
        } else {
            warn!(
                task_type = %report.task_type,
                mandatory = report.mandatory,
                reachable = report.reachable,
                ready = report.ready,
                credentials_present = report.credentials_present,
                detail = report.detail.as_deref().unwrap_or(""),
                "Agent failed preflight"
            );
        }

        report
    }

    /// Liveness, then local credential presence, then agent readiness
    ///
    /// Each network probe is bounded by the probe timeout on its own, so a
    /// hanging readiness surface still reports the agent as reachable.
    async fn probe(&self, endpoint: &AgentEndpoint) -> ProbeOutcome {
        let timeout = self.probe_timeout;
        let timed_out = || format!("timed out after {}ms", timeout.as_millis());

        match tokio::time::timeout(timeout, self.transport.probe_liveness(endpoint, timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return ProbeOutcome::unreachable(format!("liveness probe failed: {e}")),
            Err(_) => {
                return ProbeOutcome::unreachable(format!("liveness probe {}", timed_out()))
            }
        }

        if let Err(e) = endpoint.auth_token() {
            return ProbeOutcome::not_ready(false, e.to_string());
        }

        match tokio::time::timeout(timeout, self.transport.probe_readiness(endpoint, timeout)).await {
            Ok(Ok(probe)) if probe.ready => ProbeOutcome {
                reachable: true,
                ready: true,
                credentials_present: probe.credentials_present,
                detail: (!probe.credentials_present)
                    .then(|| "agent reports missing credentials".to_string()),
            },
            Ok(Ok(probe)) => {
                ProbeOutcome::not_ready(probe.credentials_present, "agent reports not ready")
            }
            Ok(Err(e)) => ProbeOutcome::not_ready(false, format!("readiness probe failed: {e}")),
            Err(_) => ProbeOutcome::not_ready(false, format!("readiness probe {}", timed_out())),
        }
    }

    /// Re-run preflight on a fixed interval; the first tick is skipped
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick completes immediately, skip it

            loop {
                ticker.tick().await;
                let reports = self.run_preflight().await;
                debug!(
                    interval_secs = interval.as_secs(),
                    endpoints = reports.len(),
                    "Periodic preflight complete"
                );
            }
        })
    }
}
