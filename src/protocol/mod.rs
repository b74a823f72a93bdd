//! Wire types for the task router
//!
//! Requests accepted from callers, the uniform result envelope returned to them,
//! stream frames relayed from agents, and preflight reports exposed on the
//! readiness endpoint.

pub mod messages;

pub use messages::*;
