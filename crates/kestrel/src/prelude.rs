//! Convenience re-exports for common `kestrel` types.
//!
//! Meant to be glob-imported when building agents:
//!
//! ```ignore
//! use kestrel::prelude::*;
//! ```
//!
//! This pulls in what most agent programs need: [`Message`] and tool
//! types, the [`Harness`] and its config, hooks and event handlers, the
//! [`ContextManager`] with the built-in plugins and strategies, and the
//! [`Tool`] trait with [`ToolRegistry`]. Specialized types (strategy
//! internals, pipeline plugins, circuit breaker state) are left out; import
//! those from their modules directly.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::error::AgentError;
pub use crate::{Message, ToolCall, ToolDef, ToolResult, json_schema_for};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    AgentEvent, CompositeEventHandler, EventHandler, ExecutionState, FnEventHandler, FnHook,
    Harness, HarnessConfig, HookManager, HookOutcome, HookPoint, LoggingHandler, NoopHandler,
    RunControl, RunError, RunResult,
};
pub use crate::api::client::{LlmClient, LlmFuture, ModelRequest, ModelResponse};
pub use crate::api::retry::{BackoffConfig, RetryConfig};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{
    ContextBudget, ContextComponent, ContextConfig, ContextManager, ConversationCompactor,
    ConversationHistory, ConversationPlugin, InstructionsPlugin, MemoryPlugin,
    ProactiveStrategy, StrategyKind, TruncatingCompactor,
};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{FnTool, Tool, ToolFuture, ToolRegistry, parse_tool_args};

// ── External dependencies ───────────────────────────────────────────
pub use crate::dependency::{ExternalDependency, ExternalDependencyHandler, PollConfig};
