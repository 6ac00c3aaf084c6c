//! Error taxonomy for the runtime.
//!
//! Every fallible public operation returns [`AgentError`]. Tool-level
//! failures are usually caught at the call site and fed back to the model as
//! error results; the variants here are what escapes to callers.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("context length exceeded: {used} tokens used of {total} available")]
    ContextLengthExceeded { used: usize, total: usize },

    #[error("unknown tool '{0}'")]
    ToolNotFound(String),

    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("tool '{tool}' timed out after {timeout_ms}ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    #[error("invalid arguments for tool '{tool}': {message}")]
    InvalidToolArguments { tool: String, message: String },

    #[error("circuit open for '{0}'")]
    CircuitOpen(String),

    #[error("hook '{hook}' timed out after {timeout_ms}ms")]
    HookTimeout { hook: String, timeout_ms: u64 },

    #[error("hook '{hook}' failed: {message}")]
    HookFailed { hook: String, message: String },

    #[error("no compactor found for component '{0}'")]
    NoCompactorFound(String),

    #[error("provider error: {message}")]
    Provider { message: String, transient: bool },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("state error: {0}")]
    State(String),
}

impl AgentError {
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            transient: true,
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Whether a retry has a chance of succeeding.
    ///
    /// Authentication, context-length and circuit-open errors are never
    /// transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::RateLimited { .. } | AgentError::Provider { transient: true, .. }
        )
    }

    /// Server-suggested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            AgentError::RateLimited {
                retry_after_ms: Some(ms),
                ..
            } => Some(std::time::Duration::from_millis(*ms)),
            _ => None,
        }
    }

    /// Short stable label for events and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Authentication(_) => "authentication",
            AgentError::RateLimited { .. } => "rate_limited",
            AgentError::ContextLengthExceeded { .. } => "context_length_exceeded",
            AgentError::ToolNotFound(_) => "tool_not_found",
            AgentError::ToolExecution { .. } => "tool_execution",
            AgentError::ToolTimeout { .. } => "tool_timeout",
            AgentError::InvalidToolArguments { .. } => "invalid_tool_arguments",
            AgentError::CircuitOpen(_) => "circuit_open",
            AgentError::HookTimeout { .. } => "hook_timeout",
            AgentError::HookFailed { .. } => "hook_failed",
            AgentError::NoCompactorFound(_) => "no_compactor_found",
            AgentError::Provider { .. } => "provider",
            AgentError::Cancelled => "cancelled",
            AgentError::InvalidTransition { .. } => "invalid_transition",
            AgentError::Config(_) => "config",
            AgentError::State(_) => "state",
        }
    }
}
