//! Agent Registry
//!
//! Static mapping from task type to the one agent endpoint that serves it.
//! Built once from [`RouterConfig`] at startup and never mutated, so lookups
//! need no locking.

use crate::config::{resolve_secret, AgentSection, ConfigError, RouterConfig};
use crate::error::{RouterError, RouterResult};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

/// Endpoint descriptor for one backend agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentEndpoint {
    pub task_type: String,
    /// Base URL without trailing slash
    pub base_url: String,
    pub mandatory: bool,
    /// Per-agent timeout; the router default applies when unset
    pub timeout: Option<Duration>,
    pub supports_streaming: bool,
    /// Name of the environment variable holding this agent's bearer token
    pub auth_token_env: Option<String>,
}

impl AgentEndpoint {
    pub fn new(task_type: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            task_type: task_type.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            mandatory: true,
            timeout: None,
            supports_streaming: false,
            auth_token_env: None,
        }
    }

    pub fn with_mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_streaming(mut self, supports_streaming: bool) -> Self {
        self.supports_streaming = supports_streaming;
        self
    }

    pub fn with_auth_token_env(mut self, env_var: impl Into<String>) -> Self {
        self.auth_token_env = Some(env_var.into());
        self
    }

    /// Timeout for calls to this agent, falling back to the router default
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }

    /// Resolve the bearer token, if this agent has one configured
    pub fn auth_token(&self) -> Result<Option<String>, ConfigError> {
        self.auth_token_env
            .as_deref()
            .map(resolve_secret)
            .transpose()
    }

    /// Join a path onto the base URL
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

impl From<&AgentSection> for AgentEndpoint {
    fn from(section: &AgentSection) -> Self {
        let mut endpoint = AgentEndpoint::new(&section.task_type, &section.base_url)
            .with_mandatory(section.mandatory)
            .with_streaming(section.supports_streaming);
        endpoint.timeout = section.timeout_ms.map(Duration::from_millis);
        endpoint.auth_token_env = section.auth_token_env.clone();
        endpoint
    }
}

/// Immutable task type -> endpoint map
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    endpoints: HashMap<String, AgentEndpoint>,
}

impl AgentRegistry {
    /// Build the registry from validated configuration
    pub fn from_config(config: &RouterConfig) -> Self {
        let registry = Self::from_endpoints(config.agents.iter().map(AgentEndpoint::from));
        info!(
            agents = registry.len(),
            mandatory = registry.mandatory_count(),
            "Agent registry loaded"
        );
        registry
    }

    /// Build the registry from endpoint descriptors; a later duplicate replaces an earlier one
    pub fn from_endpoints(endpoints: impl IntoIterator<Item = AgentEndpoint>) -> Self {
        Self {
            endpoints: endpoints
                .into_iter()
                .map(|e| (e.task_type.clone(), e))
                .collect(),
        }
    }

    /// Resolve the endpoint for a task type
    pub fn resolve(&self, task_type: &str) -> RouterResult<&AgentEndpoint> {
        self.endpoints
            .get(task_type)
            .ok_or_else(|| RouterError::unknown_task_type(task_type))
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.endpoints.contains_key(task_type)
    }

    /// All endpoints, ordered by task type
    pub fn endpoints(&self) -> Vec<&AgentEndpoint> {
        let mut all: Vec<&AgentEndpoint> = self.endpoints.values().collect();
        all.sort_by(|a, b| a.task_type.cmp(&b.task_type));
        all
    }

    pub fn task_types(&self) -> Vec<String> {
        self.endpoints()
            .into_iter()
            .map(|e| e.task_type.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn mandatory_count(&self) -> usize {
        self.endpoints.values().filter(|e| e.mandatory).count()
    }
}
