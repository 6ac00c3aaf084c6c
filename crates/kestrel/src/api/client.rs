//! The contract between the harness and a model backend.
//!
//! The runtime ships no HTTP client. A backend implements [`LlmClient`] and
//! classifies its own failures into [`AgentError`] so retry and circuit
//! breaking can tell transient errors from permanent ones.

use crate::error::AgentError;
use crate::{Message, ToolCall, ToolDef};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`LlmClient::generate`].
pub type LlmFuture<'a> = Pin<Box<dyn Future<Output = Result<ModelResponse, AgentError>> + Send + 'a>>;

/// One request to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDef>,
    /// 1-based loop iteration that issued the request.
    pub iteration: u32,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl UsageInfo {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// What the model said back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            finish_reason: Some("stop".into()),
            ..Default::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            finish_reason: Some("tool_calls".into()),
            ..Default::default()
        }
    }

    /// Text accompanying tool calls.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.usage = Some(UsageInfo {
            prompt_tokens,
            completion_tokens,
        });
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// The assistant message to append to the conversation.
    pub fn to_message(&self) -> Message {
        if self.tool_calls.is_empty() {
            Message::assistant_text(self.content.clone().unwrap_or_default())
        } else {
            Message::assistant_tool_calls(self.content.clone(), self.tool_calls.clone())
        }
    }
}

/// A model backend.
pub trait LlmClient: Send + Sync {
    /// Short identifier used as the circuit breaker key.
    fn name(&self) -> &str {
        "llm"
    }

    fn generate<'a>(&'a self, request: &'a ModelRequest) -> LlmFuture<'a>;
}
