//! Configuration for the [`Harness`](super::harness::Harness).
//!
//! Everything has a default. Override fields directly or through the
//! builder methods:
//!
//! ```ignore
//! let config = HarnessConfig::default()
//!     .with_max_iterations(30)
//!     .with_hook_timeout(Duration::from_secs(2))
//!     .with_retries(3)
//!     .with_concurrent_tools(true);
//! ```
//!
//! Durations are written in milliseconds when the config is loaded from a
//! file (`hook_timeout_ms`, `tool_timeout_ms`).

use crate::api::circuit::CircuitBreakerConfig;
use crate::api::retry::RetryConfig;
use crate::config::serde_millis;
use crate::tools::core::DEFAULT_MAX_RESULT_BYTES;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default per-hook timeout.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default timeout for tool execution.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Upper bound on loop iterations. Reaching it with tool calls still
    /// pending ends the run as incomplete.
    pub max_iterations: u32,
    /// Consecutive tool errors tolerated before the run fails.
    pub max_consecutive_errors: u32,
    #[serde(rename = "hook_timeout_ms", with = "serde_millis")]
    pub hook_timeout: Duration,
    /// Run hooks at one point concurrently. Results still merge in
    /// registration order.
    pub parallel_hooks: bool,
    /// `None` disables tool timeouts.
    #[serde(rename = "tool_timeout_ms", with = "serde_millis::option")]
    pub tool_timeout: Option<Duration>,
    pub max_result_bytes: usize,
    /// Validate tool arguments against their JSON Schema before execution.
    pub validate_args: bool,
    /// Execute the tool calls of one turn concurrently.
    pub concurrent_tools: bool,
    /// Fail the run when the context cannot be brought under budget.
    /// When `false` the turn proceeds and an overflow event is emitted.
    pub fail_on_overflow: bool,
    pub retry: RetryConfig,
    pub circuit: CircuitBreakerConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            max_consecutive_errors: 3,
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
            parallel_hooks: false,
            tool_timeout: Some(DEFAULT_TOOL_TIMEOUT),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            validate_args: true,
            concurrent_tools: false,
            fail_on_overflow: true,
            retry: RetryConfig::default(),
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

impl HarnessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_max_consecutive_errors(mut self, n: u32) -> Self {
        self.max_consecutive_errors = n;
        self
    }

    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }

    pub fn with_parallel_hooks(mut self, parallel: bool) -> Self {
        self.parallel_hooks = parallel;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    pub fn with_validate_args(mut self, validate: bool) -> Self {
        self.validate_args = validate;
        self
    }

    pub fn with_concurrent_tools(mut self, concurrent: bool) -> Self {
        self.concurrent_tools = concurrent;
        self
    }

    pub fn with_fail_on_overflow(mut self, fail: bool) -> Self {
        self.fail_on_overflow = fail;
        self
    }

    /// Set the number of model-call retries, keeping the backoff schedule.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retry.max_retries = retries;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit(mut self, circuit: CircuitBreakerConfig) -> Self {
        self.circuit = circuit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.hook_timeout, Duration::from_millis(5000));
        assert!(!config.parallel_hooks);
        assert!(!config.concurrent_tools);
        assert_eq!(config.circuit.failure_threshold, 5);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: HarnessConfig = serde_json::from_str(
            r#"{"max_iterations": 10, "hook_timeout_ms": 250, "tool_timeout_ms": null}"#,
        )
        .unwrap();
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.hook_timeout, Duration::from_millis(250));
        assert_eq!(config.tool_timeout, None);
        assert_eq!(config.max_consecutive_errors, 3);
    }

    #[test]
    fn builder_chain() {
        let config = HarnessConfig::new()
            .with_max_iterations(3)
            .with_retries(0)
            .with_tool_timeout(None);
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.retry.max_retries, 0);
        assert!(config.tool_timeout.is_none());
    }
}
