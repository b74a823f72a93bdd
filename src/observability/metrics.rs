//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! dispatch outcomes, stream relays, preflight runs and audit writes.

use crate::error::ErrorKind;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_LATENCY_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Request intake
    requests_received: AtomicU64,
    requests_rejected: AtomicU64,

    // Dispatch outcomes
    dispatch_succeeded: AtomicU64,
    dispatch_failed: AtomicU64,
    failures_by_kind: Mutex<HashMap<ErrorKind, u64>>,
    task_stats: Mutex<HashMap<String, TaskTypeStats>>,

    // Stream relays
    streams_opened: AtomicU64,
    streams_open: AtomicU64,
    streams_completed: AtomicU64,
    streams_cancelled: AtomicU64,

    // Preflight
    preflight_runs: AtomicU64,
    preflight_failures: AtomicU64,
    ready: AtomicBool,
    last_preflight: AtomicU64,

    // Audit sink
    audit_written: AtomicU64,
    audit_failed: AtomicU64,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            requests_received: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            dispatch_succeeded: AtomicU64::new(0),
            dispatch_failed: AtomicU64::new(0),
            failures_by_kind: Mutex::new(HashMap::new()),
            task_stats: Mutex::new(HashMap::new()),
            streams_opened: AtomicU64::new(0),
            streams_open: AtomicU64::new(0),
            streams_completed: AtomicU64::new(0),
            streams_cancelled: AtomicU64::new(0),
            preflight_runs: AtomicU64::new(0),
            preflight_failures: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            last_preflight: AtomicU64::new(0),
            audit_written: AtomicU64::new(0),
            audit_failed: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    pub fn request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Request refused locally (client error, not ready, capacity)
    pub fn request_rejected(&self, kind: ErrorKind) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
        self.count_failure_kind(kind);
    }

    pub fn dispatch_succeeded(&self, task_type: &str, duration: Duration) {
        self.dispatch_succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_task_call(task_type, duration, None);
    }

    pub fn dispatch_failed(&self, task_type: &str, duration: Duration, kind: ErrorKind) {
        self.dispatch_failed.fetch_add(1, Ordering::Relaxed);
        self.count_failure_kind(kind);
        self.record_task_call(task_type, duration, Some(kind));
    }

    fn count_failure_kind(&self, kind: ErrorKind) {
        if let Ok(mut counts) = self.failures_by_kind.lock() {
            *counts.entry(kind).or_insert(0) += 1;
        }
    }

    fn record_task_call(&self, task_type: &str, duration: Duration, failure: Option<ErrorKind>) {
        if let Ok(mut stats) = self.task_stats.lock() {
            let entry = stats
                .entry(task_type.to_string())
                .or_insert_with(|| TaskTypeStats {
                    calls: 0,
                    failures: 0,
                    timeouts: 0,
                    latencies: Vec::new(),
                    last_call: 0,
                });

            entry.calls += 1;
            entry.last_call = current_timestamp();
            entry.latencies.push(duration.as_millis() as u64);
            if entry.latencies.len() > MAX_LATENCY_SAMPLES {
                entry.latencies.remove(0);
            }

            match failure {
                Some(ErrorKind::UpstreamTimeout) => {
                    entry.failures += 1;
                    entry.timeouts += 1;
                }
                Some(_) => entry.failures += 1,
                None => {}
            }
        }
    }

    pub fn stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
        self.streams_open.fetch_add(1, Ordering::Relaxed);
    }

    /// Relay slot released, whatever the reason
    pub fn stream_closed(&self) {
        let _ = self
            .streams_open
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn stream_completed(&self) {
        self.streams_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_cancelled(&self) {
        self.streams_cancelled.fetch_add(1, Ordering::Relaxed);
        self.count_failure_kind(ErrorKind::ClientCancelled);
    }

    pub fn preflight_completed(&self, ready: bool, failing_endpoints: usize) {
        self.preflight_runs.fetch_add(1, Ordering::Relaxed);
        if failing_endpoints > 0 {
            self.preflight_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.store(ready, Ordering::Relaxed);
        self.last_preflight
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn audit_written(&self) {
        self.audit_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn audit_failed(&self) {
        self.audit_failed.fetch_add(1, Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.requests_received,
            &self.requests_rejected,
            &self.dispatch_succeeded,
            &self.dispatch_failed,
            &self.streams_opened,
            &self.streams_open,
            &self.streams_completed,
            &self.streams_cancelled,
            &self.preflight_runs,
            &self.preflight_failures,
            &self.last_preflight,
            &self.audit_written,
            &self.audit_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.ready.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut counts) = self.failures_by_kind.lock() {
            counts.clear();
        }
        if let Ok(mut stats) = self.task_stats.lock() {
            stats.clear();
        }
    }

    /// Build per-task-type snapshots (pure function)
    fn build_task_statistics(&self) -> HashMap<String, TaskTypeStatsSnapshot> {
        let Ok(stats) = self.task_stats.lock() else {
            return HashMap::new();
        };

        stats
            .iter()
            .map(|(task_type, stats)| {
                let mut sorted = stats.latencies.clone();
                sorted.sort_unstable();

                let avg = if sorted.is_empty() {
                    0.0
                } else {
                    sorted.iter().sum::<u64>() as f64 / sorted.len() as f64
                };
                let success_rate = if stats.calls == 0 {
                    0.0
                } else {
                    (stats.calls - stats.failures) as f64 / stats.calls as f64
                };

                (
                    task_type.clone(),
                    TaskTypeStatsSnapshot {
                        calls: stats.calls,
                        failures: stats.failures,
                        timeouts: stats.timeouts,
                        success_rate,
                        avg_latency_ms: avg,
                        latency_p50_ms: percentile(&sorted, 50.0),
                        latency_p95_ms: percentile(&sorted, 95.0),
                        latency_p99_ms: percentile(&sorted, 99.0),
                        last_call: stats.last_call,
                    },
                )
            })
            .collect()
    }

    fn failure_counts(&self) -> HashMap<String, u64> {
        self.failures_by_kind
            .lock()
            .map(|counts| {
                counts
                    .iter()
                    .map(|(kind, count)| (kind.as_str().to_string(), *count))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();

        MetricsSnapshot {
            requests: RequestMetrics {
                received: self.requests_received.load(Ordering::Relaxed),
                rejected: self.requests_rejected.load(Ordering::Relaxed),
                succeeded: self.dispatch_succeeded.load(Ordering::Relaxed),
                failed: self.dispatch_failed.load(Ordering::Relaxed),
                failures_by_kind: self.failure_counts(),
                by_task_type: self.build_task_statistics(),
            },
            streams: StreamMetrics {
                opened: self.streams_opened.load(Ordering::Relaxed),
                open: self.streams_open.load(Ordering::Relaxed),
                completed: self.streams_completed.load(Ordering::Relaxed),
                cancelled: self.streams_cancelled.load(Ordering::Relaxed),
            },
            preflight: PreflightMetrics {
                runs: self.preflight_runs.load(Ordering::Relaxed),
                runs_with_failures: self.preflight_failures.load(Ordering::Relaxed),
                ready: self.ready.load(Ordering::Relaxed),
                last_run: self.last_preflight.load(Ordering::Relaxed),
            },
            audit: AuditMetrics {
                written: self.audit_written.load(Ordering::Relaxed),
                failed: self.audit_failed.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Internal per-task-type statistics (with timing data)
#[derive(Debug)]
struct TaskTypeStats {
    calls: u64,
    failures: u64,
    timeouts: u64,
    latencies: Vec<u64>, // milliseconds
    last_call: u64,
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub requests: RequestMetrics,
    pub streams: StreamMetrics,
    pub preflight: PreflightMetrics,
    pub audit: AuditMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct RequestMetrics {
    pub received: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub failures_by_kind: HashMap<String, u64>,
    pub by_task_type: HashMap<String, TaskTypeStatsSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct TaskTypeStatsSnapshot {
    pub calls: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub last_call: u64,
}

#[derive(Debug, Serialize)]
pub struct StreamMetrics {
    pub opened: u64,
    pub open: u64,
    pub completed: u64,
    pub cancelled: u64,
}

#[derive(Debug, Serialize)]
pub struct PreflightMetrics {
    pub runs: u64,
    pub runs_with_failures: u64,
    pub ready: bool,
    pub last_run: u64,
}

#[derive(Debug, Serialize)]
pub struct AuditMetrics {
    pub written: u64,
    pub failed: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
