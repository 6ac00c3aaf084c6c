//! The agentic loop.
//!
//! [`Harness`] drives one run: assemble context, ask the model, execute the
//! tool calls it returns, feed the results back, and repeat until the model
//! answers in plain text or the iteration limit is hit.
//!
//! # One iteration
//!
//! | Step | Hook point | Notes |
//! |------|------------|-------|
//! | Pause check | `check:pause` | Also honours [`RunControl::pause`] |
//! | Context | | Prepare and compact; overflow fails the run unless disabled |
//! | Model call | `before:llm`, `after:llm` | Retries with backoff, circuit breaker |
//! | Each tool call | `approve:tool`, `before:tool`, `after:tool` | Pipeline, timeout, audit |
//! | Commit | | Assistant message and its results are appended together |
//!
//! Messages produced during an iteration reach the history only when the
//! iteration finishes. A cancelled iteration leaves nothing behind, so the
//! history never holds a tool call without its result.

use super::config::HarnessConfig;
use super::events::{AgentEvent, EventBus, EventHandler, NoopHandler};
use super::execution::{
    AuditEntry, AuditOutcome, ExecutionContext, ExecutionMetrics, ExecutionState,
};
use super::hooks::{HookContext, HookManager, HookOutcome, HookPoint};
use crate::api::circuit::{CircuitBreaker, CircuitBreakerRegistry, Permit};
use crate::api::client::{LlmClient, ModelRequest, ModelResponse};
use crate::api::retry::retry_with_backoff;
use crate::cancel::{CancelAware, CancellationToken, await_or_cancel};
use crate::context::{ContextManager, ConversationHistory, ManagerState};
use crate::error::AgentError;
use crate::tools::core::Tool;
use crate::tools::pipeline::{
    ArgumentValidationPlugin, LoggingToolPlugin, ToolPipeline, TruncationPlugin,
};
use crate::tools::registry::ToolRegistry;
use crate::{Message, ToolCall, ToolOutcome, ToolResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

// ── Run control ────────────────────────────────────────────────────

/// Pause, resume and cancel a run from outside the loop.
///
/// Cheap to clone; every clone controls the same run.
#[derive(Debug, Clone)]
pub struct RunControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Use an existing token, e.g. a child of an application-wide one.
    pub fn with_token(cancel: CancellationToken) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel,
            paused: Arc::new(paused),
        }
    }

    /// Request a pause. Takes effect before the next iteration starts.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Block until resumed. Returns `true` if cancelled first.
    async fn wait_resumed(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return false;
            }
            match await_or_cancel(&self.cancel, rx.changed()).await {
                CancelAware::Cancelled => return true,
                CancelAware::Value(Ok(())) => {}
                CancelAware::Value(Err(_)) => return false,
            }
        }
    }
}

// ── Results ────────────────────────────────────────────────────────

/// Final state of a run that did not fail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub state: ExecutionState,
    /// Text of the last model response that carried any.
    pub response: Option<String>,
    /// The iteration limit stopped the loop while tool calls were pending.
    pub incomplete: bool,
    pub iterations: u32,
    pub metrics: ExecutionMetrics,
    pub audit: Vec<AuditEntry>,
    /// Full conversation history at the end of the run.
    pub messages: Vec<Message>,
}

impl RunResult {
    pub fn text(&self) -> &str {
        self.response.as_deref().unwrap_or_default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == ExecutionState::Cancelled
    }
}

/// A failed run, with everything recorded up to the failure.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RunError {
    pub error: AgentError,
    pub partial: Box<RunResult>,
}

/// Serializable state for pausing a run in one process and resuming it in
/// another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub execution: ExecutionContext,
    pub context: ManagerState,
}

enum Step {
    Continue,
    Done,
}

// ── Harness ────────────────────────────────────────────────────────

/// The agentic tool-use loop.
///
/// ```ignore
/// let history = ConversationHistory::new();
/// let context = ContextManager::new(ContextConfig::default())
///     .with_plugin(InstructionsPlugin::new("You are a careful assistant."))
///     .with_plugin(ConversationPlugin::new(history.clone()))
///     .with_compactor(ConversationCompactor::default());
/// let tools = ToolRegistry::new().with(MyTool);
///
/// let harness = Harness::new(&client, &tools, &context, history, HarnessConfig::default())
///     .with_event_handler(&LoggingHandler);
/// let result = harness.run("Summarize the repository").await?;
/// println!("{}", result.text());
/// ```
///
/// # Lifetimes
///
/// `Harness<'a>` borrows the client, tools, context manager and event
/// handler. Bind them to `let` bindings before building the harness so
/// they outlive `.run()`.
///
/// The `history` handle must be the same one the context manager's
/// [`ConversationPlugin`](crate::context::ConversationPlugin) reads,
/// otherwise the model never sees the conversation.
pub struct Harness<'a> {
    client: &'a dyn LlmClient,
    tools: &'a ToolRegistry,
    context: &'a ContextManager,
    history: ConversationHistory,
    config: HarnessConfig,
    hooks: HookManager,
    pipeline: ToolPipeline,
    breakers: Arc<CircuitBreakerRegistry>,
    event_handler: &'a dyn EventHandler,
    bus: EventBus,
    control: RunControl,
    exec: Mutex<ExecutionContext>,
}

impl<'a> Harness<'a> {
    pub fn new(
        client: &'a dyn LlmClient,
        tools: &'a ToolRegistry,
        context: &'a ContextManager,
        history: ConversationHistory,
        config: HarnessConfig,
    ) -> Self {
        let hooks = HookManager::new()
            .with_timeout(config.hook_timeout)
            .with_parallel(config.parallel_hooks);
        let pipeline = pipeline_for(&config);
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit.clone()));
        Self {
            client,
            tools,
            context,
            history,
            config,
            hooks,
            pipeline,
            breakers,
            event_handler: &NoopHandler,
            bus: EventBus::default(),
            control: RunControl::new(),
            exec: Mutex::new(ExecutionContext::default()),
        }
    }

    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.event_handler = handler;
        self
    }

    /// Replace the hook manager. Its own timeout and parallelism apply.
    pub fn with_hooks(mut self, hooks: HookManager) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replace the tool pipeline built from the config.
    pub fn with_pipeline(mut self, pipeline: ToolPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Share circuit breakers with other harnesses calling the same
    /// dependencies.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_control(mut self, control: RunControl) -> Self {
        self.control = control;
        self
    }

    pub fn with_run_id(self, run_id: impl Into<String>) -> Self {
        self.lock_exec().run_id = run_id.into();
        self
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Receive every event of this harness on a channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentEvent> {
        self.bus.subscribe()
    }

    /// A copy of the current execution record.
    pub fn execution(&self) -> ExecutionContext {
        self.lock_exec().clone()
    }

    pub fn state(&self) -> ExecutionState {
        self.lock_exec().state()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            execution: self.execution(),
            context: self.context.get_state(),
        }
    }

    /// Load a snapshot taken by [`snapshot`](Self::snapshot). A snapshot
    /// captured while running comes back suspended; continue it with
    /// [`resume_run`](Self::resume_run).
    pub fn restore(&self, snapshot: RunSnapshot) -> Result<(), AgentError> {
        self.context.restore_state(&snapshot.context)?;
        let mut execution = snapshot.execution;
        execution.suspend_if_running();
        info!(
            "Restored run {} at iteration {} ({})",
            execution.run_id,
            execution.iteration,
            execution.state()
        );
        *self.lock_exec() = execution;
        Ok(())
    }

    /// Append `input` as a user message and run the loop.
    pub async fn run(&self, input: impl Into<String>) -> Result<RunResult, RunError> {
        self.start()?;
        self.history.push(Message::user(input));
        self.drive().await
    }

    /// Continue a restored or suspended run without new input.
    pub async fn resume_run(&self) -> Result<RunResult, RunError> {
        self.start()?;
        self.drive().await
    }

    // ── Loop ───────────────────────────────────────────────────────

    fn start(&self) -> Result<(), RunError> {
        let started = {
            let mut exec = self.lock_exec();
            exec.transition(ExecutionState::Running)
                .map(|from| (from, exec.run_id.clone(), exec.iteration))
        };
        let (from, run_id, iteration) = started.map_err(|e| self.reject(e))?;
        if from == ExecutionState::Idle {
            info!(
                "Run {run_id} started (max {} iterations)",
                self.config.max_iterations
            );
            self.emit(AgentEvent::ExecutionStarted { run_id });
        }
        self.emit(AgentEvent::StateChanged {
            from,
            to: ExecutionState::Running,
        });
        if from == ExecutionState::Suspended {
            self.emit(AgentEvent::ExecutionResumed { iteration });
        }
        Ok(())
    }

    async fn drive(&self) -> Result<RunResult, RunError> {
        let cancel = self.control.token().clone();
        let mut last_response = None;
        loop {
            if cancel.is_cancelled() {
                return Ok(self.finish_cancelled(last_response));
            }

            let iteration = self.lock_exec().iteration;
            if iteration >= self.config.max_iterations {
                warn!(
                    "Iteration limit ({}) reached with tool calls pending",
                    self.config.max_iterations
                );
                self.emit(AgentEvent::IterationLimitReached {
                    max_iterations: self.config.max_iterations,
                });
                return Ok(self.finish(last_response, true));
            }

            if let Err(e) = self.pause_point(&cancel).await {
                return match e {
                    AgentError::Cancelled => Ok(self.finish_cancelled(last_response)),
                    e => Err(self.fail(e, last_response)),
                };
            }

            match self.iterate(&cancel, &mut last_response).await {
                Ok(Step::Continue) => {}
                Ok(Step::Done) => return Ok(self.finish(last_response, false)),
                Err(AgentError::Cancelled) => return Ok(self.finish_cancelled(last_response)),
                Err(e) => return Err(self.fail(e, last_response)),
            }
        }
    }

    async fn pause_point(&self, cancel: &CancellationToken) -> Result<(), AgentError> {
        let iteration = self.lock_exec().iteration;
        if self.hooks.has_hooks(HookPoint::CheckPause) {
            let ctx = HookContext::new(HookPoint::CheckPause, iteration + 1)
                .with_message_count(self.history.len());
            if self.run_hooks(ctx, cancel).await?.pause {
                self.control.pause();
            }
        }
        if !self.control.is_paused() {
            return Ok(());
        }

        self.enter(ExecutionState::Suspended)?;
        info!("Run paused after iteration {iteration}");
        self.emit(AgentEvent::ExecutionPaused { iteration });
        if self.control.wait_resumed().await {
            return Err(AgentError::Cancelled);
        }
        self.enter(ExecutionState::Running)?;
        info!("Run resumed");
        self.emit(AgentEvent::ExecutionResumed { iteration });
        Ok(())
    }

    async fn iterate(
        &self,
        cancel: &CancellationToken,
        last_response: &mut Option<String>,
    ) -> Result<Step, AgentError> {
        let iteration = {
            let mut exec = self.lock_exec();
            exec.iteration += 1;
            exec.iteration
        };

        let prepared = self.context.prepare();
        self.emit(AgentEvent::IterationStarted {
            iteration,
            max_iterations: self.config.max_iterations,
            budget: prepared.budget,
        });
        if let Some(compaction) = &prepared.compaction {
            {
                let mut exec = self.lock_exec();
                exec.metrics.compactions += 1;
                exec.metrics.tokens_freed += compaction.tokens_freed as u64;
            }
            self.emit(AgentEvent::ContextCompacted {
                iteration,
                tokens_freed: compaction.tokens_freed,
                tokens_to_free: compaction.tokens_to_free,
                actions: compaction.log.len(),
            });
        }
        if let Some(overflow) = prepared.overflow {
            self.emit(AgentEvent::ContextOverflow {
                used: overflow.used,
                total: overflow.total,
            });
            if self.config.fail_on_overflow {
                return Err(AgentError::ContextLengthExceeded {
                    used: overflow.used,
                    total: overflow.total,
                });
            }
            warn!(
                "Context over budget ({} of {} tokens), continuing",
                overflow.used, overflow.total
            );
        }

        let mut pending = Vec::new();
        let before = self
            .run_hooks(
                HookContext::new(HookPoint::BeforeLlm, iteration)
                    .with_message_count(self.history.len()),
                cancel,
            )
            .await?;
        if let Some(message) = before.inject_message {
            pending.push(Message::user(message));
        }

        let mut messages = prepared.to_messages();
        messages.extend(pending.iter().cloned());
        let request = ModelRequest {
            messages,
            tools: self.tools.definitions(),
            iteration,
        };
        let response = self.call_model(&request, cancel).await?;
        if response.content.is_some() {
            last_response.clone_from(&response.content);
        }

        let after = self
            .run_hooks(
                HookContext::new(HookPoint::AfterLlm, iteration)
                    .with_response(response.content.as_deref())
                    .with_message_count(self.history.len()),
                cancel,
            )
            .await?;

        if !response.has_tool_calls() {
            pending.push(response.to_message());
            let injected = after.inject_message.map(Message::user);
            let step = if injected.is_some() {
                Step::Continue
            } else {
                Step::Done
            };
            pending.extend(injected);
            self.commit(pending);
            self.emit(AgentEvent::IterationCompleted {
                iteration,
                tool_calls: 0,
            });
            return Ok(step);
        }

        let calls = &response.tool_calls;
        let results = self.execute_tools(calls, iteration, cancel).await?;
        pending.push(response.to_message());
        pending.extend(results.iter().map(ToolResult::to_message));
        pending.extend(after.inject_message.map(Message::user));
        self.commit(pending);
        self.emit(AgentEvent::IterationCompleted {
            iteration,
            tool_calls: calls.len(),
        });

        let consecutive = self.lock_exec().consecutive_errors;
        if consecutive > self.config.max_consecutive_errors {
            let (tool, last) = calls
                .iter()
                .zip(&results)
                .rev()
                .find_map(|(call, result)| match &result.outcome {
                    ToolOutcome::Error(e) => Some((call.name().to_string(), e.clone())),
                    ToolOutcome::Content(_) => None,
                })
                .unwrap_or_default();
            return Err(AgentError::ToolExecution {
                tool,
                message: format!("{consecutive} consecutive tool errors, last: {last}"),
            });
        }
        Ok(Step::Continue)
    }

    fn commit(&self, messages: Vec<Message>) {
        debug!("Committing {} message(s) to history", messages.len());
        self.history.extend(messages);
    }

    // ── Model ──────────────────────────────────────────────────────

    async fn call_model(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, AgentError> {
        let breaker = self.breakers.get(self.client.name());
        let iteration = request.iteration;
        let attempts = AtomicU32::new(0);
        // Trial permit of an attempt still in flight.
        let trial: Mutex<Option<Permit>> = Mutex::new(None);
        let (this, breaker_ref, attempts_ref, trial_ref) =
            (self, breaker.as_ref(), &attempts, &trial);

        let outcome = retry_with_backoff(
            &self.config.retry,
            cancel,
            move |attempt| {
                attempts_ref.store(attempt, Ordering::Relaxed);
                this.attempt_model(breaker_ref, trial_ref, request, attempt)
            },
            move |attempt, error, _delay| {
                this.lock_exec().metrics.llm_retries += 1;
                this.emit(AgentEvent::LlmError {
                    iteration,
                    attempt,
                    error: error.to_string(),
                    will_retry: true,
                });
            },
        )
        .await;

        match outcome {
            Ok(response) => {
                if let Some(usage) = response.usage {
                    let mut exec = self.lock_exec();
                    exec.metrics.prompt_tokens += u64::from(usage.prompt_tokens);
                    exec.metrics.completion_tokens += u64::from(usage.completion_tokens);
                }
                self.emit(AgentEvent::LlmResponse {
                    iteration,
                    tool_calls: response.tool_calls.len(),
                    usage: response.usage,
                });
                Ok(response)
            }
            Err(AgentError::Cancelled) => {
                let held = trial.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(permit) = held {
                    breaker.release(&permit);
                }
                Err(AgentError::Cancelled)
            }
            Err(e) => {
                self.emit(AgentEvent::LlmError {
                    iteration,
                    attempt: attempts.load(Ordering::Relaxed),
                    error: e.to_string(),
                    will_retry: false,
                });
                Err(e)
            }
        }
    }

    async fn attempt_model(
        &self,
        breaker: &CircuitBreaker,
        trial: &Mutex<Option<Permit>>,
        request: &ModelRequest,
        attempt: u32,
    ) -> Result<ModelResponse, AgentError> {
        let permit = breaker.try_acquire()?;
        if let Some(transition) = &permit.transition {
            self.emit(AgentEvent::from_transition(transition));
        }
        if permit.is_trial() {
            *trial.lock().unwrap_or_else(PoisonError::into_inner) = Some(permit.clone());
        }
        self.lock_exec().metrics.llm_calls += 1;
        self.emit(AgentEvent::LlmRequest {
            iteration: request.iteration,
            attempt,
            messages: request.messages.len(),
            tools: request.tools.len(),
        });
        let outcome = self.client.generate(request).await;
        trial.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.record_outcome(breaker, &permit, &outcome);
        outcome
    }

    // ── Tools ──────────────────────────────────────────────────────

    async fn execute_tools(
        &self,
        calls: &[ToolCall],
        iteration: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolResult>, AgentError> {
        for call in calls {
            self.emit(AgentEvent::ToolDetected {
                call_id: call.id.clone(),
                name: call.name().to_string(),
                arguments: call.arguments().to_string(),
            });
        }

        if self.config.concurrent_tools && calls.len() > 1 {
            let all = calls
                .iter()
                .map(|call| self.execute_one(call, iteration, cancel));
            return futures::future::join_all(all).await.into_iter().collect();
        }

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.execute_one(call, iteration, cancel).await?);
        }
        Ok(results)
    }

    /// Run one call through approval, hooks, breaker and pipeline.
    ///
    /// Every failure except cancellation becomes an error result for the
    /// model.
    async fn execute_one(
        &self,
        call: &ToolCall,
        iteration: u32,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, AgentError> {
        let started = Instant::now();
        let name = call.name().to_string();
        let tool = self.tools.get(&name);
        let description = tool.as_ref().and_then(|t| t.describe_call(call.arguments()));

        let approval = self
            .run_hooks(
                HookContext::new(HookPoint::ApproveTool, iteration).with_call(call),
                cancel,
            )
            .await?;
        if approval.is_denied() {
            let reason = approval
                .deny_reason
                .unwrap_or_else(|| "denied by approval hook".into());
            info!("[tool] {name} denied: {reason}");
            self.emit(AgentEvent::ToolDenied {
                call_id: call.id.clone(),
                name: name.clone(),
                reason: reason.clone(),
            });
            let result = ToolResult::error(&call.id, format!("tool call denied: {reason}"));
            let mut exec = self.lock_exec();
            exec.metrics.tools_denied += 1;
            exec.record_audit(audit_entry(
                iteration,
                call,
                description,
                AuditOutcome::Denied(reason),
                started,
            ));
            return Ok(result);
        }

        let before = self
            .run_hooks(
                HookContext::new(HookPoint::BeforeTool, iteration).with_call(call),
                cancel,
            )
            .await?;
        if before.skip {
            self.emit(AgentEvent::ToolSkipped {
                call_id: call.id.clone(),
                name: name.clone(),
            });
            let result = ToolResult::content(&call.id, before.mock_result.unwrap_or_default());
            let mut exec = self.lock_exec();
            exec.metrics.tools_skipped += 1;
            exec.record_audit(audit_entry(
                iteration,
                call,
                description,
                AuditOutcome::Skipped,
                started,
            ));
            return Ok(result);
        }
        let call = match before.arguments {
            Some(arguments) => ToolCall::new(&call.id, &name, arguments),
            None => call.clone(),
        };

        self.emit(AgentEvent::ToolStarted {
            call_id: call.id.clone(),
            name: name.clone(),
        });
        let result = match self.invoke_tool(tool.as_deref(), &call, cancel).await {
            Ok(output) => ToolResult::content(&call.id, output),
            Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => {
                match &e {
                    AgentError::ToolTimeout { timeout_ms, .. } => {
                        self.emit(AgentEvent::ToolTimedOut {
                            call_id: call.id.clone(),
                            name: name.clone(),
                            timeout_ms: *timeout_ms,
                        });
                    }
                    other => self.emit(AgentEvent::ToolFailed {
                        call_id: call.id.clone(),
                        name: name.clone(),
                        error: other.to_string(),
                    }),
                }
                ToolResult::error(&call.id, e.to_string())
            }
        };

        let after = self
            .run_hooks(
                HookContext::new(HookPoint::AfterTool, iteration)
                    .with_call(&call)
                    .with_result(&result),
                cancel,
            )
            .await?;
        let result = match after.result {
            Some(replacement) => ToolResult {
                outcome: match result.outcome {
                    ToolOutcome::Content(_) => ToolOutcome::Content(replacement),
                    ToolOutcome::Error(_) => ToolOutcome::Error(replacement),
                },
                ..result
            },
            None => result,
        };

        let outcome = match &result.outcome {
            ToolOutcome::Content(content) => {
                self.emit(AgentEvent::ToolCompleted {
                    call_id: call.id.clone(),
                    name: name.clone(),
                    bytes: content.len(),
                    duration_ms: millis(started),
                });
                AuditOutcome::Success
            }
            ToolOutcome::Error(e) => AuditOutcome::Error(e.clone()),
        };
        let mut exec = self.lock_exec();
        exec.record_tool_outcome(result.is_error());
        exec.record_audit(audit_entry(iteration, &call, description, outcome, started));
        Ok(result)
    }

    async fn invoke_tool(
        &self,
        tool: Option<&dyn Tool>,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let tool = tool.ok_or_else(|| AgentError::ToolNotFound(call.name().to_string()))?;
        let breaker = self.breakers.get(&format!("tool:{}", call.name()));
        let permit = breaker.try_acquire()?;
        if let Some(transition) = &permit.transition {
            self.emit(AgentEvent::from_transition(transition));
        }
        let outcome = self.pipeline.execute(tool, call, cancel).await;
        self.record_outcome(&breaker, &permit, &outcome);
        outcome
    }

    // ── Helpers ────────────────────────────────────────────────────

    /// Feed an outcome to a breaker. Cancellations and caller mistakes
    /// (bad arguments, auth) do not count against the dependency.
    fn record_outcome<T>(
        &self,
        breaker: &CircuitBreaker,
        permit: &Permit,
        outcome: &Result<T, AgentError>,
    ) {
        let transition = match outcome {
            Ok(_) => breaker.record_success(),
            Err(e) if counts_against_dependency(e) => breaker.record_failure(),
            Err(_) => {
                breaker.release(permit);
                None
            }
        };
        if let Some(transition) = transition {
            self.emit(AgentEvent::from_transition(&transition));
        }
    }

    async fn run_hooks(
        &self,
        ctx: HookContext,
        cancel: &CancellationToken,
    ) -> Result<HookOutcome, AgentError> {
        if !self.hooks.has_hooks(ctx.point) {
            return Ok(HookOutcome::default());
        }
        let run = self.hooks.run(&ctx, cancel).await?;
        if !run.failures.is_empty() {
            self.lock_exec().metrics.hook_failures += run.failures.len() as u32;
        }
        for failure in run.failures {
            self.emit(AgentEvent::HookFailed {
                point: failure.point,
                hook: failure.hook,
                error: failure.error.to_string(),
            });
        }
        Ok(run.outcome)
    }

    fn emit(&self, event: AgentEvent) {
        self.event_handler.on_event(&event);
        self.bus.publish(&event);
    }

    fn enter(&self, to: ExecutionState) -> Result<(), AgentError> {
        let from = self.lock_exec().transition(to)?;
        self.emit(AgentEvent::StateChanged { from, to });
        Ok(())
    }

    fn finish(&self, response: Option<String>, incomplete: bool) -> RunResult {
        if let Err(e) = self.enter(ExecutionState::Completed) {
            warn!("Could not complete run: {e}");
        }
        let iterations = self.lock_exec().iteration;
        info!(
            "Run finished after {iterations} iteration(s){}",
            if incomplete { " (incomplete)" } else { "" }
        );
        self.emit(AgentEvent::ExecutionCompleted {
            iterations,
            incomplete,
        });
        self.result(response, incomplete)
    }

    fn finish_cancelled(&self, response: Option<String>) -> RunResult {
        if let Err(e) = self.enter(ExecutionState::Cancelled) {
            warn!("Could not cancel run: {e}");
        }
        let iteration = self.lock_exec().iteration;
        info!("Run cancelled during iteration {iteration}");
        self.emit(AgentEvent::ExecutionCancelled { iteration });
        self.result(response, false)
    }

    fn fail(&self, error: AgentError, response: Option<String>) -> RunError {
        self.lock_exec().last_error = Some(error.to_string());
        if let Err(e) = self.enter(ExecutionState::Failed) {
            warn!("Could not mark run failed: {e}");
        }
        let iterations = self.lock_exec().iteration;
        warn!("Run failed after {iterations} iteration(s): {error}");
        self.emit(AgentEvent::ExecutionFailed {
            iterations,
            error: error.to_string(),
        });
        RunError {
            error,
            partial: Box::new(self.result(response, false)),
        }
    }

    /// A run that could not start. State is left untouched.
    fn reject(&self, error: AgentError) -> RunError {
        RunError {
            error,
            partial: Box::new(self.result(None, false)),
        }
    }

    fn result(&self, response: Option<String>, incomplete: bool) -> RunResult {
        let exec = self.lock_exec();
        RunResult {
            run_id: exec.run_id.clone(),
            state: exec.state(),
            response,
            incomplete,
            iterations: exec.iteration,
            metrics: exec.metrics.clone(),
            audit: exec.audit().to_vec(),
            messages: self.history.snapshot(),
        }
    }

    fn lock_exec(&self) -> MutexGuard<'_, ExecutionContext> {
        self.exec.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The pipeline described by `config`: logging, optional schema
/// validation, truncation and the tool timeout.
pub fn pipeline_for(config: &HarnessConfig) -> ToolPipeline {
    let mut pipeline = ToolPipeline::new().with_plugin(LoggingToolPlugin);
    if config.validate_args {
        pipeline = pipeline.with_plugin(ArgumentValidationPlugin);
    }
    pipeline
        .with_plugin(TruncationPlugin::new(config.max_result_bytes))
        .with_timeout(config.tool_timeout)
}

fn counts_against_dependency(e: &AgentError) -> bool {
    matches!(
        e,
        AgentError::Provider { .. }
            | AgentError::RateLimited { .. }
            | AgentError::ToolExecution { .. }
            | AgentError::ToolTimeout { .. }
    )
}

fn audit_entry(
    iteration: u32,
    call: &ToolCall,
    description: Option<String>,
    outcome: AuditOutcome,
    started: Instant,
) -> AuditEntry {
    AuditEntry {
        at: Utc::now(),
        iteration,
        call_id: call.id.clone(),
        tool: call.name().to_string(),
        description,
        outcome,
        duration_ms: millis(started),
    }
}

fn millis(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
