//! Configuration for the task router
//!
//! The router is configured once at startup from a TOML file. The resulting
//! [`RouterConfig`] is passed explicitly to the registry, preflight validator
//! and dispatcher; nothing reads configuration through a global.
//!
//! Secrets never live in the file: agents name the environment variable that
//! holds their bearer token, and the value is resolved at call time.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level router configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub router: RouterSection,
    /// Audit-log sink used for LIVE runs (optional)
    pub audit: Option<CollaboratorSection>,
    /// Archival service (optional)
    pub archival: Option<CollaboratorSection>,
    #[serde(default)]
    pub agents: Vec<AgentSection>,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// Dispatch, dedupe and preflight policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterSection {
    /// Timeout applied when an agent does not set its own
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// How long a request id is remembered for duplicate rejection
    #[serde(default = "default_dedupe_window_secs")]
    pub dedupe_window_secs: u64,
    /// Upper bound on remembered request ids
    #[serde(default = "default_dedupe_capacity")]
    pub dedupe_capacity: usize,
    /// Timeout for each liveness/readiness probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Re-run preflight on this interval; startup only when absent
    pub preflight_interval_secs: Option<u64>,
    /// Bound on concurrently open stream relays
    #[serde(default = "default_max_open_streams")]
    pub max_open_streams: usize,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            dedupe_window_secs: default_dedupe_window_secs(),
            dedupe_capacity: default_dedupe_capacity(),
            probe_timeout_ms: default_probe_timeout_ms(),
            preflight_interval_secs: None,
            max_open_streams: default_max_open_streams(),
        }
    }
}

impl RouterSection {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn dedupe_window(&self) -> Duration {
        Duration::from_secs(self.dedupe_window_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn preflight_interval(&self) -> Option<Duration> {
        self.preflight_interval_secs.map(Duration::from_secs)
    }
}

/// External collaborator endpoint (audit sink, archival service)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollaboratorSection {
    pub url: String,
    #[serde(default = "default_collaborator_timeout_ms")]
    pub timeout_ms: u64,
}

impl CollaboratorSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One backend agent, keyed by the task type it serves
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    /// Routing key (must match [a-zA-Z0-9._-]+)
    pub task_type: String,
    /// Base URL of the agent service
    pub base_url: String,
    /// Unavailability of a mandatory agent blocks all traffic
    #[serde(default = "default_mandatory")]
    pub mandatory: bool,
    /// Per-agent timeout override
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub supports_streaming: bool,
    /// Environment variable containing the agent's bearer token
    pub auth_token_env: Option<String>,
}

fn default_port() -> u16 {
    8080
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_dedupe_window_secs() -> u64 {
    300
}

fn default_dedupe_capacity() -> usize {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_max_open_streams() -> usize {
    64
}

fn default_collaborator_timeout_ms() -> u64 {
    5_000
}

fn default_mandatory() -> bool {
    true
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid task type: {0}")]
    InvalidTaskType(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RouterConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RouterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check structural consistency of the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one [[agents]] entry is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            validate_task_type(&agent.task_type)?;
            if !seen.insert(agent.task_type.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "task type '{}' is registered more than once",
                    agent.task_type
                )));
            }
            validate_http_url(&agent.base_url, &agent.task_type)?;
            if agent.timeout_ms == Some(0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "agent '{}' timeout_ms must be greater than zero",
                    agent.task_type
                )));
            }
        }

        let router = &self.router;
        let positive = [
            ("router.default_timeout_ms", router.default_timeout_ms as usize),
            ("router.probe_timeout_ms", router.probe_timeout_ms as usize),
            ("router.dedupe_capacity", router.dedupe_capacity),
            ("router.max_open_streams", router.max_open_streams),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if router.preflight_interval_secs == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "router.preflight_interval_secs must be greater than zero".to_string(),
            ));
        }

        if let Some(audit) = &self.audit {
            validate_http_url(&audit.url, "audit")?;
        }
        if let Some(archival) = &self.archival {
            validate_http_url(&archival.url, "archival")?;
        }

        Ok(())
    }

    /// Look up the agent section for a task type
    pub fn agent(&self, task_type: &str) -> Option<&AgentSection> {
        self.agents.iter().find(|a| a.task_type == task_type)
    }

    /// Resolve an agent's bearer token from its environment variable
    pub fn agent_auth_token(agent: &AgentSection) -> Result<Option<String>, ConfigError> {
        match &agent.auth_token_env {
            Some(name) => resolve_secret(name).map(Some),
            None => Ok(None),
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[router]
default_timeout_ms = 1000
dedupe_window_secs = 60

[[agents]]
task_type = "bias_scan"
base_url = "http://localhost:9001"
supports_streaming = true

[[agents]]
task_type = "perf_analysis"
base_url = "http://localhost:9002"
mandatory = false
timeout_ms = 250
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

/// Read a secret from the named environment variable
pub fn resolve_secret(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

/// Validate task type format
fn validate_task_type(task_type: &str) -> Result<(), ConfigError> {
    let valid_chars = task_type
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if task_type.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidTaskType(format!(
            "Task type '{task_type}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

fn validate_http_url(raw: &str, owner: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw).map_err(|e| {
        ConfigError::InvalidConfig(format!("'{owner}' has an invalid URL '{raw}': {e}"))
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidConfig(format!(
            "'{owner}' URL must use http or https, got '{other}'"
        ))),
    }
}
