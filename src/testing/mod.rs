//! Testing utilities and mock implementations
//!
//! Mock transport and collaborator implementations for exercising the router
//! without backend agents, an audit service or an archival service.

pub mod mocks;

pub use mocks::*;
