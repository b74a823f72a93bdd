//! Dispatch of normalized requests to backend agents
//!
//! - [`dispatcher`] gates on readiness, resolves the endpoint and issues the call
//! - [`envelope`] turns backend replies into the uniform result envelope
//! - [`relay`] re-emits a backend stream with ordering and termination guarantees

pub mod dispatcher;
pub mod envelope;
pub mod relay;

pub use dispatcher::Dispatcher;
pub use relay::{CompletionHook, RelayStream};

use crate::error::RouterError;
use crate::transport::TransportError;
use std::time::Duration;

/// Map a transport failure to the caller-facing taxonomy
pub(crate) fn map_transport_error(
    err: TransportError,
    task_type: &str,
    timeout: Duration,
) -> RouterError {
    match err {
        TransportError::Timeout => RouterError::UpstreamTimeout {
            task_type: task_type.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        },
        TransportError::Decode(message) => RouterError::malformed(message),
        other => RouterError::upstream(other.to_string()),
    }
}
