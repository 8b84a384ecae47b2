//! Engine configuration
//!
//! Every section deserializes with defaults, so a TOML file only needs the
//! keys it wants to change:
//!
//! ```toml
//! [command]
//! timeout_ms = 5000
//! retries = 2
//!
//! [event_bus]
//! max_history_size = 500
//!
//! [crew]
//! process = "parallel"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Backoff schedule between command attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

/// Per-command execution options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandOptions {
    pub timeout_ms: u64,
    pub retries: u32,
    pub validate_input: bool,
    pub validate_output: bool,
    pub log_execution: bool,
    pub retry: RetryPolicy,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retries: 0,
            validate_input: true,
            validate_output: false,
            log_execution: true,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Soft per-event limit; exceeding it only warns
    pub max_listeners: usize,
    pub max_history_size: usize,
    /// Fan-out duration above which `performance:slow` is emitted
    pub slow_threshold_ms: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_listeners: 100,
            max_history_size: 100,
            slow_threshold_ms: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub role: String,
    pub goal: String,
    pub backstory: String,
    pub allow_delegation: bool,
    pub max_history: usize,
    pub max_patterns: usize,
}

impl AgentConfig {
    pub fn new(role: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            goal: goal.into(),
            ..Default::default()
        }
    }

    pub fn with_backstory(mut self, backstory: impl Into<String>) -> Self {
        self.backstory = backstory.into();
        self
    }

    pub fn with_delegation(mut self, allow: bool) -> Self {
        self.allow_delegation = allow;
        self
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            role: "assistant".to_string(),
            goal: String::new(),
            backstory: String::new(),
            allow_delegation: true,
            max_history: 100,
            max_patterns: 20,
        }
    }
}

/// Crew scheduling discipline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    #[default]
    Sequential,
    Parallel,
    Hierarchical,
}

impl ProcessKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessKind::Sequential => "sequential",
            ProcessKind::Parallel => "parallel",
            ProcessKind::Hierarchical => "hierarchical",
        }
    }
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrewConfig {
    pub name: String,
    pub process: ProcessKind,
    pub share_crew_state: bool,
    pub max_history: usize,
}

impl CrewConfig {
    pub fn new(name: impl Into<String>, process: ProcessKind) -> Self {
        Self {
            name: name.into(),
            process,
            ..Default::default()
        }
    }

    pub fn with_shared_state(mut self, share: bool) -> Self {
        self.share_crew_state = share;
        self
    }
}

impl Default for CrewConfig {
    fn default() -> Self {
        Self {
            name: "crew".to_string(),
            process: ProcessKind::Sequential,
            share_crew_state: false,
            max_history: 50,
        }
    }
}

/// Top-level configuration for an engine instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub command: CommandOptions,
    pub event_bus: EventBusConfig,
    pub agent: AgentConfig,
    pub crew: CrewConfig,
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("invalid engine configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("failed to serialize engine configuration")
    }
}
