//! Request normalization
//!
//! Turns a loosely typed [`RawRunRequest`] into the internal
//! [`AgentRunRequest`] contract. Validation and request-id reservation are
//! separate steps so the dispatcher can gate on readiness in between without
//! burning the caller's request id on a rejected call.

use crate::error::{RouterError, RouterResult};
use crate::protocol::{AgentRunRequest, RawRunRequest, RunMode};
use crate::registry::AgentRegistry;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Upper bound on request id length
pub const MAX_REQUEST_ID_LEN: usize = 256;

/// Bounded recent-history of request ids
///
/// An id is remembered for `window`; at most `capacity` ids are kept and the
/// oldest is evicted first when the cap is reached.
#[derive(Debug)]
pub struct RecentRequestIds {
    window: Duration,
    capacity: usize,
    inner: Mutex<RecentInner>,
}

#[derive(Debug, Default)]
struct RecentInner {
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl RecentInner {
    fn evict_expired(&mut self, now: Instant, window: Duration) {
        while let Some((id, at)) = self.order.front() {
            if now.duration_since(*at) < window {
                break;
            }
            // Only drop the map entry if it still belongs to this queue slot
            if self.seen.get(id) == Some(at) {
                self.seen.remove(id);
            }
            self.order.pop_front();
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((id, at)) = self.order.pop_front() {
            if self.seen.get(&id) == Some(&at) {
                self.seen.remove(&id);
            }
        }
    }
}

impl RecentRequestIds {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            inner: Mutex::new(RecentInner::default()),
        }
    }

    /// Record `request_id`, failing if it was seen within the window
    pub fn check_and_record(&self, request_id: &str) -> RouterResult<()> {
        self.check_and_record_at(request_id, Instant::now())
    }

    fn check_and_record_at(&self, request_id: &str, now: Instant) -> RouterResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.evict_expired(now, self.window);

        if inner.seen.contains_key(request_id) {
            return Err(RouterError::duplicate_request_id(request_id));
        }

        while inner.seen.len() >= self.capacity {
            inner.evict_oldest();
        }

        inner.seen.insert(request_id.to_string(), now);
        inner.order.push_back((request_id.to_string(), now));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .seen
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Validates inbound requests and guards against duplicate request ids
pub struct RequestNormalizer {
    registry: Arc<AgentRegistry>,
    recent: RecentRequestIds,
}

impl RequestNormalizer {
    pub fn new(registry: Arc<AgentRegistry>, recent: RecentRequestIds) -> Self {
        Self { registry, recent }
    }

    /// Pure validation and canonicalization; records nothing
    pub fn validate(&self, raw: RawRunRequest) -> RouterResult<AgentRunRequest> {
        let task_type = raw
            .task_type
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RouterError::validation("task_type is required"))?;

        if !self.registry.contains(&task_type) {
            return Err(RouterError::unknown_task_type(task_type));
        }

        let request_id = raw
            .request_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| RouterError::validation("request_id is required"))?;
        if request_id.len() > MAX_REQUEST_ID_LEN {
            return Err(RouterError::validation(format!(
                "request_id exceeds {MAX_REQUEST_ID_LEN} characters"
            )));
        }

        let mode = match raw.mode.as_deref() {
            None => RunMode::default(),
            Some(mode) => RunMode::parse(mode).ok_or_else(|| {
                RouterError::validation(format!(
                    "mode must be DEMO or LIVE, got '{mode}'"
                ))
            })?,
        };

        let inputs = match raw.inputs {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(Value::Object(map)) => Value::Object(map),
            Some(_) => return Err(RouterError::validation("inputs must be a JSON object")),
        };

        Ok(AgentRunRequest {
            task_type,
            request_id,
            mode,
            inputs,
        })
    }

    /// Claim the request id for this call
    pub fn reserve(&self, request: &AgentRunRequest) -> RouterResult<()> {
        self.recent.check_and_record(&request.request_id)
    }

    /// Validate then reserve
    pub fn normalize(&self, raw: RawRunRequest) -> RouterResult<AgentRunRequest> {
        let request = self.validate(raw)?;
        self.reserve(&request)?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentEndpoint;
    use serde_json::json;

    fn normalizer() -> RequestNormalizer {
        let registry = Arc::new(AgentRegistry::from_endpoints([AgentEndpoint::new(
            "bias_scan",
            "http://bias:8000",
        )]));
        RequestNormalizer::new(
            registry,
            RecentRequestIds::new(Duration::from_secs(60), 100),
        )
    }

    fn raw(value: Value) -> RawRunRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_normalize_defaults_mode_and_inputs() {
        let request = normalizer()
            .normalize(raw(json!({"task_type": "bias_scan", "request_id": "r-1"})))
            .unwrap();

        assert_eq!(request.mode, RunMode::Demo);
        assert_eq!(request.inputs, json!({}));
    }

    #[test]
    fn test_mode_is_case_insensitive() {
        let request = normalizer()
            .validate(raw(json!({
                "task_type": "bias_scan",
                "request_id": "r-1",
                "mode": "live",
                "inputs": {"doc": "x"}
            })))
            .unwrap();

        assert_eq!(request.mode, RunMode::Live);
        assert_eq!(request.inputs["doc"], "x");
    }

    #[test]
    fn test_rejects_missing_and_unknown_task_type() {
        let n = normalizer();

        let err = n.validate(raw(json!({"request_id": "r-1"}))).unwrap_err();
        assert!(matches!(err, RouterError::Validation { .. }));

        let err = n
            .validate(raw(json!({"task_type": "  ", "request_id": "r-1"})))
            .unwrap_err();
        assert!(matches!(err, RouterError::Validation { .. }));

        let err = n
            .validate(raw(json!({"task_type": "nope", "request_id": "r-1"})))
            .unwrap_err();
        assert!(matches!(err, RouterError::UnknownTaskType { .. }));
    }

    #[test]
    fn test_rejects_bad_request_id_mode_and_inputs() {
        let n = normalizer();

        let cases = vec![
            json!({"task_type": "bias_scan"}),
            json!({"task_type": "bias_scan", "request_id": ""}),
            json!({"task_type": "bias_scan", "request_id": "x".repeat(300)}),
            json!({"task_type": "bias_scan", "request_id": "r", "mode": "PROD"}),
            json!({"task_type": "bias_scan", "request_id": "r", "inputs": [1, 2]}),
            json!({"task_type": "bias_scan", "request_id": "r", "inputs": "text"}),
        ];

        for case in cases {
            let err = n.validate(raw(case.clone())).unwrap_err();
            assert!(
                matches!(err, RouterError::Validation { .. }),
                "expected validation error for {case}"
            );
        }
    }

    #[test]
    fn test_validate_does_not_reserve() {
        let n = normalizer();
        let body = json!({"task_type": "bias_scan", "request_id": "r-1"});

        n.validate(raw(body.clone())).unwrap();
        n.validate(raw(body.clone())).unwrap();
        n.normalize(raw(body.clone())).unwrap();

        let err = n.normalize(raw(body)).unwrap_err();
        assert!(matches!(err, RouterError::DuplicateRequestId { .. }));
    }

    #[test]
    fn test_dedupe_window_expiry() {
        let ids = RecentRequestIds::new(Duration::from_secs(10), 100);
        let start = Instant::now();

        ids.check_and_record_at("r-1", start).unwrap();
        assert!(ids
            .check_and_record_at("r-1", start + Duration::from_secs(9))
            .is_err());
        assert!(ids
            .check_and_record_at("r-1", start + Duration::from_secs(10))
            .is_ok());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let ids = RecentRequestIds::new(Duration::from_secs(600), 2);

        ids.check_and_record("a").unwrap();
        ids.check_and_record("b").unwrap();
        ids.check_and_record("c").unwrap();

        assert_eq!(ids.len(), 2);
        // "a" was evicted and is accepted again
        assert!(ids.check_and_record("a").is_ok());
        assert!(ids.check_and_record("c").is_err());
    }
}
