//! Engine error types

use serde_json::Value;
use thiserror::Error;

/// Default code attached to failures that carry no code of their own
pub const COMMAND_ERROR: &str = "COMMAND_ERROR";
/// Code for input schema failures
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
/// Code for output schema failures
pub const OUTPUT_VALIDATION_ERROR: &str = "OUTPUT_VALIDATION_ERROR";

/// Errors that can occur in the engine
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Input did not satisfy the command's schema
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Handler output did not satisfy the command's schema
    #[error("Output validation failed: {0}")]
    OutputValidation(String),

    /// Handler did not settle before the timer fired
    #[error("Command '{command}' timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// Async listener fan-out did not settle before the timer fired
    #[error("Event '{event}' listeners timed out after {timeout_ms}ms")]
    EmitTimeout { event: String, timeout_ms: u64 },

    /// Command name or alias is not registered
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    /// Alias points at a command that is not registered
    #[error("Cannot alias '{alias}': target '{target}' is not registered")]
    AliasTarget { alias: String, target: String },

    /// Agent refused to delegate
    #[error("Agent '{0}' is not allowed to delegate")]
    DelegationDisabled(String),

    /// Tool invocation failed
    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    /// Generator failed to produce output
    #[error("Generator error: {0}")]
    Generator(String),

    /// Crew not found
    #[error("Crew not found: {0}")]
    CrewNotFound(String),

    /// Crew has no agents to schedule
    #[error("Crew '{0}' has no agents")]
    NoAgents(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel error
    #[error("Channel error: {0}")]
    Channel(String),

    /// Failure raised by caller-supplied code
    #[error("{message}")]
    Handler {
        message: String,
        code: Option<String>,
        details: Option<Value>,
    },
}

impl EngineError {
    /// Plain handler failure with the default code
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            code: None,
            details: None,
        }
    }

    /// Handler failure carrying its own code
    pub fn coded(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            code: Some(code.into()),
            details: None,
        }
    }

    /// Attach structured details (only kept on handler failures)
    pub fn with_details(self, details: Value) -> Self {
        match self {
            Self::Handler { message, code, .. } => Self::Handler {
                message,
                code,
                details: Some(details),
            },
            other => other,
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &str {
        match self {
            Self::Validation(_) => VALIDATION_ERROR,
            Self::OutputValidation(_) => OUTPUT_VALIDATION_ERROR,
            Self::CommandNotFound(_) => "NOT_FOUND",
            Self::Handler { code: Some(code), .. } => code.as_str(),
            _ => COMMAND_ERROR,
        }
    }

    /// Error class name, mirrored into failure envelopes
    pub fn name(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::OutputValidation(_) => "ValidationError",
            Self::Timeout { .. } | Self::EmitTimeout { .. } => "TimeoutError",
            Self::CommandNotFound(_) | Self::CrewNotFound(_) => "NotFoundError",
            Self::Tool { .. } => "ToolError",
            Self::Generator(_) => "GeneratorError",
            Self::DelegationDisabled(_) => "DelegationError",
            Self::AliasTarget { .. } | Self::NoAgents(_) | Self::Config(_) => "ConfigError",
            Self::Channel(_) => "ChannelError",
            Self::Handler { .. } => "Error",
        }
    }

    pub fn details(&self) -> Option<&Value> {
        match self {
            Self::Handler { details, .. } => details.as_ref(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::EmitTimeout { .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::handler(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
