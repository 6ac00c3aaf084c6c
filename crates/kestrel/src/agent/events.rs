//! Lifecycle events for the [`Harness`](super::harness::Harness).
//!
//! Every run emits [`AgentEvent`]s from start to finish. Callers observe them
//! two ways: synchronously through an [`EventHandler`] passed to the harness,
//! or asynchronously through a channel returned by
//! [`Harness::subscribe`](super::harness::Harness::subscribe). The run never
//! depends on anyone listening.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |
//! | Custom `impl EventHandler` | Full control (metrics, UI) |

use super::execution::ExecutionState;
use super::hooks::HookPoint;
use crate::api::circuit::{CircuitState, Transition};
use crate::api::client::UsageInfo;
use crate::context::ContextBudget;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    ExecutionStarted {
        run_id: String,
    },
    StateChanged {
        from: ExecutionState,
        to: ExecutionState,
    },
    IterationStarted {
        iteration: u32,
        max_iterations: u32,
        budget: ContextBudget,
    },
    IterationCompleted {
        iteration: u32,
        tool_calls: usize,
    },
    /// Compaction ran during context preparation.
    ContextCompacted {
        iteration: u32,
        tokens_freed: usize,
        tokens_to_free: usize,
        actions: usize,
    },
    /// The context could not be brought under budget.
    ContextOverflow {
        used: usize,
        total: usize,
    },
    LlmRequest {
        iteration: u32,
        attempt: u32,
        messages: usize,
        tools: usize,
    },
    LlmResponse {
        iteration: u32,
        tool_calls: usize,
        usage: Option<UsageInfo>,
    },
    LlmError {
        iteration: u32,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    ToolDetected {
        call_id: String,
        name: String,
        arguments: String,
    },
    ToolStarted {
        call_id: String,
        name: String,
    },
    ToolCompleted {
        call_id: String,
        name: String,
        bytes: usize,
        duration_ms: u64,
    },
    ToolFailed {
        call_id: String,
        name: String,
        error: String,
    },
    ToolTimedOut {
        call_id: String,
        name: String,
        timeout_ms: u64,
    },
    /// An approval hook denied the call.
    ToolDenied {
        call_id: String,
        name: String,
        reason: String,
    },
    /// A `before:tool` hook skipped the call with a mock result.
    ToolSkipped {
        call_id: String,
        name: String,
    },
    HookFailed {
        point: HookPoint,
        hook: String,
        error: String,
    },
    CircuitOpened {
        dependency: String,
    },
    CircuitHalfOpen {
        dependency: String,
    },
    CircuitClosed {
        dependency: String,
    },
    IterationLimitReached {
        max_iterations: u32,
    },
    ExecutionPaused {
        iteration: u32,
    },
    ExecutionResumed {
        iteration: u32,
    },
    ExecutionCancelled {
        iteration: u32,
    },
    ExecutionCompleted {
        iterations: u32,
        incomplete: bool,
    },
    ExecutionFailed {
        iterations: u32,
        error: String,
    },
}

impl AgentEvent {
    /// The event for a circuit breaker transition.
    pub fn from_transition(t: &Transition) -> Self {
        let dependency = t.dependency.clone();
        match t.to {
            CircuitState::Open => Self::CircuitOpened { dependency },
            CircuitState::HalfOpen => Self::CircuitHalfOpen { dependency },
            CircuitState::Closed => Self::CircuitClosed { dependency },
        }
    }

    /// Snake-case name of the variant, as used in the serialized tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution_started",
            Self::StateChanged { .. } => "state_changed",
            Self::IterationStarted { .. } => "iteration_started",
            Self::IterationCompleted { .. } => "iteration_completed",
            Self::ContextCompacted { .. } => "context_compacted",
            Self::ContextOverflow { .. } => "context_overflow",
            Self::LlmRequest { .. } => "llm_request",
            Self::LlmResponse { .. } => "llm_response",
            Self::LlmError { .. } => "llm_error",
            Self::ToolDetected { .. } => "tool_detected",
            Self::ToolStarted { .. } => "tool_started",
            Self::ToolCompleted { .. } => "tool_completed",
            Self::ToolFailed { .. } => "tool_failed",
            Self::ToolTimedOut { .. } => "tool_timed_out",
            Self::ToolDenied { .. } => "tool_denied",
            Self::ToolSkipped { .. } => "tool_skipped",
            Self::HookFailed { .. } => "hook_failed",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::CircuitHalfOpen { .. } => "circuit_half_open",
            Self::CircuitClosed { .. } => "circuit_closed",
            Self::IterationLimitReached { .. } => "iteration_limit_reached",
            Self::ExecutionPaused { .. } => "execution_paused",
            Self::ExecutionResumed { .. } => "execution_resumed",
            Self::ExecutionCancelled { .. } => "execution_cancelled",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionFailed { .. } => "execution_failed",
        }
    }
}

// ── Handlers ───────────────────────────────────────────────────────

/// Handler for harness events.
///
/// Called inline on the run's task, so implementations should return
/// quickly. Use [`EventBus::subscribe`] for slow consumers.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &AgentEvent) {
        let _ = event;
    }
}

/// A no-op event handler.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let AgentEvent::ToolDetected { name, .. } = event {
///         println!("calling {name}");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&AgentEvent) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&AgentEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&AgentEvent) + Send + Sync,
{
    fn on_event(&self, event: &AgentEvent) {
        (self.0)(event)
    }
}

/// Delegates to multiple inner handlers in registration order.
#[derive(Default)]
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler without breaking the builder chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &AgentEvent) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &AgentEvent) {
        match event {
            AgentEvent::ExecutionStarted { run_id } => info!("Run {run_id} started"),
            AgentEvent::StateChanged { from, to } => debug!("State {from} -> {to}"),
            AgentEvent::IterationStarted {
                iteration,
                max_iterations,
                budget,
            } => {
                info!(
                    "[iteration {iteration}/{max_iterations}] {}",
                    budget.to_log_string()
                );
            }
            AgentEvent::IterationCompleted {
                iteration,
                tool_calls,
            } => debug!("Iteration {iteration} done ({tool_calls} tool call(s))"),
            AgentEvent::ContextCompacted {
                iteration,
                tokens_freed,
                tokens_to_free,
                actions,
            } => {
                info!(
                    "Iteration {iteration}: compaction freed {tokens_freed}/{tokens_to_free} \
                     tokens in {actions} action(s)"
                );
            }
            AgentEvent::ContextOverflow { used, total } => {
                warn!("Context overflow: {used} tokens used of {total}");
            }
            AgentEvent::LlmRequest {
                iteration,
                attempt,
                messages,
                tools,
            } => {
                debug!(
                    "LLM request (iteration {iteration}, attempt {attempt}): \
                     {messages} message(s), {tools} tool(s)"
                );
            }
            AgentEvent::LlmResponse {
                iteration,
                tool_calls,
                usage,
            } => {
                let tokens = usage.map(|u| u.total()).unwrap_or(0);
                debug!("LLM response (iteration {iteration}): {tool_calls} tool call(s), {tokens} tokens");
            }
            AgentEvent::LlmError {
                iteration,
                attempt,
                error,
                will_retry,
            } => {
                warn!(
                    "LLM error (iteration {iteration}, attempt {attempt}): {error}{}",
                    if *will_retry { ", retrying" } else { "" }
                );
            }
            AgentEvent::ToolDetected {
                name, arguments, ..
            } => {
                let preview: String = arguments.chars().take(120).collect();
                debug!("Tool call detected: {name}({preview})");
            }
            AgentEvent::ToolStarted { name, .. } => trace!("Executing tool: {name}"),
            AgentEvent::ToolCompleted {
                name,
                bytes,
                duration_ms,
                ..
            } => debug!("Tool {name} returned {bytes} bytes in {duration_ms}ms"),
            AgentEvent::ToolFailed { name, error, .. } => warn!("Tool {name} failed: {error}"),
            AgentEvent::ToolTimedOut {
                name, timeout_ms, ..
            } => warn!("Tool {name} timed out after {timeout_ms}ms"),
            AgentEvent::ToolDenied { name, reason, .. } => info!("Tool {name} denied: {reason}"),
            AgentEvent::ToolSkipped { name, .. } => info!("Tool {name} skipped by hook"),
            AgentEvent::HookFailed { point, hook, error } => {
                warn!("Hook {hook} at {point} failed: {error}");
            }
            AgentEvent::CircuitOpened { dependency } => warn!("Circuit opened for {dependency}"),
            AgentEvent::CircuitHalfOpen { dependency } => {
                info!("Circuit half-open for {dependency}")
            }
            AgentEvent::CircuitClosed { dependency } => info!("Circuit closed for {dependency}"),
            AgentEvent::IterationLimitReached { max_iterations } => {
                info!("Agent hit iteration limit ({max_iterations})");
            }
            AgentEvent::ExecutionPaused { iteration } => info!("Paused at iteration {iteration}"),
            AgentEvent::ExecutionResumed { iteration } => {
                info!("Resumed at iteration {iteration}")
            }
            AgentEvent::ExecutionCancelled { iteration } => {
                info!("Cancelled at iteration {iteration}")
            }
            AgentEvent::ExecutionCompleted {
                iterations,
                incomplete,
            } => {
                info!(
                    "Run completed after {iterations} iteration(s){}",
                    if *incomplete { " (incomplete)" } else { "" }
                );
            }
            AgentEvent::ExecutionFailed { iterations, error } => {
                warn!("Run failed after {iterations} iteration(s): {error}");
            }
        }
    }
}

// ── EventBus ───────────────────────────────────────────────────────

/// Fan-out of events to channel subscribers. Closed receivers are dropped
/// on the next publish.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AgentEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: &AgentEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<AgentEvent>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn composite_calls_every_handler() {
        let count = Arc::new(AtomicUsize::new(0));
        let (a, b) = (count.clone(), count.clone());
        let handler = CompositeEventHandler::new()
            .with(FnEventHandler::new(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            }))
            .with_if(false, NoopHandler)
            .with(FnEventHandler::new(move |_| {
                b.fetch_add(10, Ordering::SeqCst);
            }));
        handler.on_event(&AgentEvent::ExecutionResumed { iteration: 1 });
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn transition_maps_to_circuit_event() {
        let t = Transition {
            dependency: "llm".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        };
        assert_eq!(
            AgentEvent::from_transition(&t),
            AgentEvent::CircuitOpened {
                dependency: "llm".into()
            }
        );
    }

    #[test]
    fn serialized_tag_matches_name() {
        let event = AgentEvent::ToolSkipped {
            call_id: "c1".into(),
            name: "echo".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
    }

    #[tokio::test]
    async fn bus_drops_closed_subscribers() {
        let bus = EventBus::new();
        let mut live = bus.subscribe();
        drop(bus.subscribe());
        bus.publish(&AgentEvent::ExecutionCancelled { iteration: 2 });
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(
            live.recv().await,
            Some(AgentEvent::ExecutionCancelled { iteration: 2 })
        );
    }
}
