//! Task Router
//!
//! Routes typed work requests to backend agent services and returns one
//! uniform result contract no matter which agent did the work.
//!
//! # Overview
//!
//! - [`registry`]: static task type to agent endpoint mapping
//! - [`preflight`]: liveness and readiness probing with a fail-closed policy
//! - [`normalizer`]: request validation and request-id dedupe
//! - [`dispatch`]: synchronous dispatch, the result envelope and the stream relay
//! - [`server`]: the warp HTTP surface
//!
//! # Quick Start
//!
//! ```rust
//! use task_router::protocol::{AgentRunResponse, ErrorDescriptor, RawRunRequest, RunMode};
//! use task_router::error::ErrorKind;
//! use serde_json::json;
//!
//! let raw = RawRunRequest::new("bias_scan", "req-42", json!({"document": "..."}))
//!     .with_mode(RunMode::Live);
//! let body = serde_json::to_value(&raw).unwrap();
//! assert_eq!(body["mode"], "LIVE");
//!
//! // Every failure carries a kind and a message, never outputs
//! let failure = AgentRunResponse::failure(
//!     "req-42",
//!     ErrorDescriptor::new(ErrorKind::UnknownTaskType, "Unknown task type: nope"),
//! );
//! assert!(failure.is_well_formed());
//! assert!(failure.outputs().is_none());
//! ```

pub mod collaborators;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod normalizer;
pub mod observability;
pub mod preflight;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, RouterConfig};
pub use dispatch::{Dispatcher, RelayStream};
pub use error::{ErrorKind, RouterError, RouterResult};
pub use preflight::{PreflightValidator, ReadinessState};
pub use protocol::*;
pub use registry::{AgentEndpoint, AgentRegistry};
