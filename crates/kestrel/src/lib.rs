//! Agent execution runtime with token budgeting and context compaction.
//!
//! `kestrel` drives a bounded, multi-turn loop that alternates between an LLM
//! backend and tool execution while keeping the accumulated conversation
//! inside a fixed token budget. The two load-bearing pieces are the
//! [`ContextManager`](context::manager::ContextManager), which decides every
//! turn what to keep, shrink, or drop, and the
//! [`Harness`](agent::harness::Harness), which sequences model calls and tool
//! invocations behind hooks, circuit breakers, and cancellable waits.
//!
//! The runtime is backend-agnostic: bring an [`LlmClient`](api::client::LlmClient)
//! implementation and a set of [`Tool`](tools::core::Tool)s.
//!
//! # Getting started
//!
//! ```ignore
//! use kestrel::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AgentError> {
//!     let history = ConversationHistory::new();
//!     let context = ContextManager::new(ContextConfig::default())
//!         .with_plugin(InstructionsPlugin::new("You are a careful assistant."))
//!         .with_plugin(ConversationPlugin::new(history.clone()))
//!         .with_compactor(ConversationCompactor::default())
//!         .with_strategy(ProactiveStrategy::default());
//!
//!     let tools = ToolRegistry::new();
//!     tools.register(my_tool());
//!
//!     let harness = Harness::new(&client, &tools, &context, history, HarnessConfig::default())
//!         .with_event_handler(&LoggingHandler);
//!
//!     match harness.run("Summarize the open issues.").await {
//!         Ok(result) => println!("{}", result.text()),
//!         Err(failure) => eprintln!("run failed: {}", failure.error),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Budget and compaction:** [`context::estimator`] prices content,
//!   [`context::plugin`] supplies it, [`context::compactor`] shrinks it,
//!   [`context::strategy`] decides when and how hard, and
//!   [`context::manager`] puts it together once per turn.
//!
//! - **Run the agent loop:** [`Harness`](agent::harness::Harness) with
//!   [`HarnessConfig`](agent::config::HarnessConfig). Lifecycle events are in
//!   [`agent::events`], hooks in [`agent::hooks`], and the per-run record in
//!   [`agent::execution`].
//!
//! - **Resilience:** [`api::retry`] for backoff schedules and retries,
//!   [`api::circuit`] for per-dependency circuit breakers.
//!
//! - **Tools:** the [`Tool`](tools::core::Tool) trait, the concurrent
//!   [`ToolRegistry`](tools::registry::ToolRegistry), and the plugin chain in
//!   [`tools::pipeline`].
//!
//! - **Waiting on the outside world:** [`dependency`] suspends a unit of work
//!   until a webhook, poll, timer, or manual signal resolves it.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`agent`] | Harness loop, config, events, hooks, execution context |
//! | [`api`] | LLM client contract, backoff and retry, circuit breakers |
//! | [`context`] | Token estimation, components, plugins, compactors, strategies, manager |
//! | [`tools`] | Tool trait, registry, execution pipeline |
//! | [`dependency`] | External dependency waits (webhook, poll, scheduled, manual) |
//! | [`config`] | File-backed runtime configuration |
//! | [`error`] | Error taxonomy |

pub mod agent;
pub mod api;
pub mod cancel;
pub mod config;
pub mod context;
pub mod dependency;
pub mod error;
pub mod prelude;
pub mod tools;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use error::AgentError;

// Re-export schemars for downstream crates.
pub use schemars;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
///
/// # Example
///
/// ```
/// use kestrel::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct LookupArgs {
///     key: String,
///     #[serde(default)]
///     namespace: Option<String>,
/// }
///
/// let schema = json_schema_for::<LookupArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"key".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, content)
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, content)
    }

    /// An assistant turn requesting tool calls, with optional accompanying text.
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    fn with_role(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Tool calls requested by this message (empty for non-assistant turns).
    pub fn calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or_default()
    }

    /// Whether this is an assistant message carrying at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        !self.calls().is_empty()
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition advertised to the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    /// Create a function-calling tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A tool call returned by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    pub fn arguments(&self) -> &str {
        &self.function.arguments
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}

/// Outcome of one tool invocation, paired with its originating call by id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub outcome: ToolOutcome,
}

/// Successful content or an error payload. Both are fed back to the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Content(String),
    Error(String),
}

impl ToolResult {
    pub fn content(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call_id.into(),
            outcome: ToolOutcome::Content(content.into()),
        }
    }

    pub fn error(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool_call_id: call_id.into(),
            outcome: ToolOutcome::Error(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }

    /// Render as the history message the model sees. Errors keep an
    /// `Error:` prefix so the model can tell them apart.
    pub fn to_message(&self) -> Message {
        let body = match &self.outcome {
            ToolOutcome::Content(c) => c.clone(),
            ToolOutcome::Error(e) => format!("Error: {e}"),
        };
        Message::tool_result(&self.tool_call_id, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let sys = Message::system("hello");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(sys.content.as_deref(), Some("hello"));

        let call = ToolCall::new("call-1", "lookup", "{}");
        let assist = Message::assistant_tool_calls(None, vec![call]);
        assert!(assist.has_tool_calls());
        assert_eq!(assist.calls()[0].name(), "lookup");

        let tool = Message::tool_result("call-1", "result");
        assert_eq!(tool.role, MessageRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call-1"));
        assert!(!tool.has_tool_calls());
    }

    #[test]
    fn error_results_render_with_prefix() {
        let ok = ToolResult::content("c1", "42");
        assert_eq!(ok.to_message().content.as_deref(), Some("42"));

        let err = ToolResult::error("c2", "disk full");
        assert!(err.is_error());
        let msg = err.to_message();
        assert_eq!(msg.content.as_deref(), Some("Error: disk full"));
        assert_eq!(msg.tool_call_id.as_deref(), Some("c2"));
    }

    #[test]
    fn message_serialization_skips_empty_fields() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());
        assert_eq!(json["role"], "user");
    }
}
