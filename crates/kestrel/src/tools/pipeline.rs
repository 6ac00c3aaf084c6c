//! Plugin chain around a single tool invocation.
//!
//! ```text
//! before_execute (each plugin, in order; may rewrite args or reject)
//!   -> Tool::execute (timeout + cancellation)
//!   -> after_execute (each plugin, in order; may rewrite output)
//! on any error: on_error (each plugin, in order)
//! ```
//!
//! Errors come back as [`AgentError`]; the harness turns them into error
//! results for the model.

use super::core::{DEFAULT_MAX_RESULT_BYTES, Tool, log_tool_call, truncate_result, validate_tool_arguments};
use super::registry::ToolRegistry;
use crate::cancel::{CancelAware, CancellationToken, await_or_cancel};
use crate::error::AgentError;
use crate::{ToolCall, ToolDef};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// One call travelling through the pipeline.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub call_id: String,
    pub tool: String,
    pub arguments: String,
    pub definition: ToolDef,
}

pub trait ToolPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Runs before the tool. May rewrite `invocation.arguments`; an error
    /// stops the call.
    fn before_execute(&self, _invocation: &mut ToolInvocation) -> Result<(), AgentError> {
        Ok(())
    }

    /// Runs after a successful call and may rewrite its output.
    fn after_execute(&self, _invocation: &ToolInvocation, output: String) -> String {
        output
    }

    fn on_error(&self, _invocation: &ToolInvocation, _error: &AgentError) {}
}

// ── Built-in plugins ───────────────────────────────────────────────

/// Logs every call, its output size and failures.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingToolPlugin;

impl ToolPlugin for LoggingToolPlugin {
    fn name(&self) -> &str {
        "logging"
    }

    fn before_execute(&self, invocation: &mut ToolInvocation) -> Result<(), AgentError> {
        log_tool_call(&invocation.tool, &invocation.arguments);
        Ok(())
    }

    fn after_execute(&self, invocation: &ToolInvocation, output: String) -> String {
        debug!("[tool] {} returned {} bytes", invocation.tool, output.len());
        trace!(
            "[tool] {} result preview: {}",
            invocation.tool,
            output.chars().take(300).collect::<String>()
        );
        output
    }

    fn on_error(&self, invocation: &ToolInvocation, error: &AgentError) {
        warn!("[tool] {} ({}) failed: {error}", invocation.tool, invocation.call_id);
    }
}

/// Rejects arguments that do not match the tool's JSON Schema.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArgumentValidationPlugin;

impl ToolPlugin for ArgumentValidationPlugin {
    fn name(&self) -> &str {
        "validate_args"
    }

    fn before_execute(&self, invocation: &mut ToolInvocation) -> Result<(), AgentError> {
        validate_tool_arguments(&invocation.definition, &invocation.arguments).map_err(|message| {
            AgentError::InvalidToolArguments {
                tool: invocation.tool.clone(),
                message,
            }
        })
    }
}

/// Caps output size.
#[derive(Debug, Clone, Copy)]
pub struct TruncationPlugin {
    max_bytes: usize,
}

impl TruncationPlugin {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl Default for TruncationPlugin {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RESULT_BYTES)
    }
}

impl ToolPlugin for TruncationPlugin {
    fn name(&self) -> &str {
        "truncate"
    }

    fn after_execute(&self, _invocation: &ToolInvocation, output: String) -> String {
        truncate_result(output, self.max_bytes)
    }
}

// ── ToolPipeline ───────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct ToolPipeline {
    plugins: Vec<Arc<dyn ToolPlugin>>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for ToolPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.plugins.iter().map(|p| p.name()).collect();
        f.debug_struct("ToolPipeline")
            .field("plugins", &names)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ToolPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logging, schema validation and truncation, in that order.
    pub fn standard(max_result_bytes: usize) -> Self {
        Self::new()
            .with_plugin(LoggingToolPlugin)
            .with_plugin(ArgumentValidationPlugin)
            .with_plugin(TruncationPlugin::new(max_result_bytes))
    }

    pub fn with_plugin(mut self, plugin: impl ToolPlugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Look the tool up in `registry` and run it.
    pub async fn execute_call(
        &self,
        registry: &ToolRegistry,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let tool = registry
            .get(call.name())
            .ok_or_else(|| AgentError::ToolNotFound(call.name().to_string()))?;
        self.execute(tool.as_ref(), call, cancel).await
    }

    pub async fn execute(
        &self,
        tool: &dyn Tool,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let mut invocation = ToolInvocation {
            call_id: call.id.clone(),
            tool: call.name().to_string(),
            arguments: call.arguments().to_string(),
            definition: tool.definition(),
        };

        match self.run(tool, &mut invocation, cancel).await {
            Ok(output) => Ok(self
                .plugins
                .iter()
                .fold(output, |out, p| p.after_execute(&invocation, out))),
            Err(e) => {
                for plugin in &self.plugins {
                    plugin.on_error(&invocation, &e);
                }
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        tool: &dyn Tool,
        invocation: &mut ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        for plugin in &self.plugins {
            plugin.before_execute(invocation)?;
        }

        let start = Instant::now();
        let fut = tool.execute(&invocation.arguments);
        let outcome = match self.timeout {
            Some(limit) => match await_or_cancel(cancel, tokio::time::timeout(limit, fut)).await {
                CancelAware::Cancelled => return Err(AgentError::Cancelled),
                CancelAware::Value(Err(_)) => {
                    return Err(AgentError::ToolTimeout {
                        tool: invocation.tool.clone(),
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    });
                }
                CancelAware::Value(Ok(r)) => r,
            },
            None => match await_or_cancel(cancel, fut).await {
                CancelAware::Cancelled => return Err(AgentError::Cancelled),
                CancelAware::Value(r) => r,
            },
        };
        debug!(
            "[tool] {} completed in {:.0}ms",
            invocation.tool,
            start.elapsed().as_secs_f64() * 1000.0
        );
        outcome.map_err(|message| AgentError::tool(&invocation.tool, message))
    }
}
