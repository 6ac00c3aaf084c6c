//! Suspending a unit of work until something outside the run resolves it.
//!
//! | Dependency | Resolved by |
//! |------------|-------------|
//! | [`Webhook`](ExternalDependency::Webhook) | [`trigger`](ExternalDependencyHandler::trigger) from the webhook receiver |
//! | [`Manual`](ExternalDependency::Manual) | [`trigger`](ExternalDependencyHandler::trigger) from an operator |
//! | [`Poll`](ExternalDependency::Poll) | A registered tool returning `Ok` within `max_attempts` checks |
//! | [`Scheduled`](ExternalDependency::Scheduled) | The clock reaching `at` |
//!
//! Poll and scheduled waits run as tokio tasks owned by their wait entry,
//! each with a child of the handler's cancellation token. Stopping a wait
//! cancels the token and aborts the task;
//! [`shutdown`](ExternalDependencyHandler::shutdown) also waits for every
//! task to exit. Outcomes are published under the same lock that
//! [`stop_waiting`](ExternalDependencyHandler::stop_waiting) takes, so a
//! stopped wait never reports success or timeout afterwards.

use crate::api::retry::BackoffConfig;
use crate::config::serde_millis;
use crate::cancel::{CancelAware, CancellationToken, await_or_cancel, sleep_or_cancel};
use crate::error::AgentError;
use crate::tools::registry::ToolRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ── Dependencies ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExternalDependency {
    Webhook,
    Manual,
    Poll(PollConfig),
    Scheduled { at: DateTime<Utc> },
}

impl ExternalDependency {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Manual => "manual",
            Self::Poll(_) => "poll",
            Self::Scheduled { .. } => "scheduled",
        }
    }
}

/// Re-invoke `tool` until it succeeds. An `Err` from the tool means
/// "not ready yet".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    pub tool: String,
    #[serde(default = "default_poll_arguments")]
    pub arguments: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Limit on a single check; a check that runs over counts as not ready.
    #[serde(
        rename = "attempt_timeout_ms",
        default = "default_attempt_timeout",
        with = "serde_millis::option"
    )]
    pub attempt_timeout: Option<Duration>,
}

fn default_poll_arguments() -> String {
    "{}".into()
}

fn default_max_attempts() -> u32 {
    10
}

fn default_attempt_timeout() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

impl PollConfig {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            arguments: default_poll_arguments(),
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
            attempt_timeout: default_attempt_timeout(),
        }
    }

    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = arguments.into();
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// `None` lets a single check run until the wait is stopped.
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }
}

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DependencyEvent {
    Waiting {
        unit: String,
        kind: &'static str,
    },
    PollSucceeded {
        unit: String,
        attempts: u32,
        output: String,
    },
    PollTimedOut {
        unit: String,
        attempts: u32,
    },
    ScheduledFired {
        unit: String,
    },
    /// A webhook or manual trigger resolved the wait.
    Resolved {
        unit: String,
        payload: serde_json::Value,
    },
    Cancelled {
        unit: String,
    },
}

impl DependencyEvent {
    pub fn unit(&self) -> &str {
        match self {
            Self::Waiting { unit, .. }
            | Self::PollSucceeded { unit, .. }
            | Self::PollTimedOut { unit, .. }
            | Self::ScheduledFired { unit }
            | Self::Resolved { unit, .. }
            | Self::Cancelled { unit } => unit,
        }
    }
}

// ── Handler ────────────────────────────────────────────────────────

struct Wait {
    id: u64,
    dependency: ExternalDependency,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Wait {
    /// Cancel the wait and abort its task. Returns the task handle so the
    /// caller can wait for it to exit.
    fn stop(self) -> Option<JoinHandle<()>> {
        self.token.cancel();
        let task = self.task?;
        task.abort();
        Some(task)
    }
}

#[derive(Default)]
struct Shared {
    waits: Mutex<HashMap<String, Wait>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DependencyEvent>>>,
}

impl Shared {
    fn waits(&self) -> MutexGuard<'_, HashMap<String, Wait>> {
        self.waits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: DependencyEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Resolve wait `id` of `unit` with `event`, unless it was stopped or
    /// replaced in the meantime.
    fn finish(&self, unit: &str, id: u64, event: DependencyEvent) -> bool {
        let mut waits = self.waits();
        let current = waits
            .get(unit)
            .is_some_and(|w| w.id == id && !w.token.is_cancelled());
        if !current {
            debug!("[dependency] dropping stale outcome for '{unit}'");
            return false;
        }
        waits.remove(unit);
        self.publish(event);
        true
    }

    /// Hand the spawned task to wait `id`. A wait that already finished
    /// drops the handle.
    fn attach(&self, unit: &str, id: u64, task: JoinHandle<()>) {
        if let Some(wait) = self.waits().get_mut(unit).filter(|w| w.id == id) {
            wait.task = Some(task);
        }
    }

    /// Remove every wait in unit order, announcing each as cancelled.
    fn stop_all(&self) -> (Vec<String>, Vec<JoinHandle<()>>) {
        let mut waits = self.waits();
        let mut units: Vec<String> = waits.keys().cloned().collect();
        units.sort();
        let mut tasks = Vec::new();
        for unit in &units {
            if let Some(task) = waits.remove(unit).and_then(Wait::stop) {
                tasks.push(task);
            }
            self.publish(DependencyEvent::Cancelled { unit: unit.clone() });
        }
        (units, tasks)
    }
}

/// Tracks every outstanding wait of one scope.
///
/// ```ignore
/// let handler = ExternalDependencyHandler::new(Arc::clone(&tools));
/// let mut events = handler.subscribe();
/// handler.start_waiting("deploy-42", ExternalDependency::Poll(
///     PollConfig::new("check_deploy").with_max_attempts(20),
/// ))?;
/// while let Some(event) = events.recv().await { /* ... */ }
/// ```
///
/// Dropping the handler cancels every outstanding wait.
pub struct ExternalDependencyHandler {
    tools: Arc<ToolRegistry>,
    root: CancellationToken,
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl ExternalDependencyHandler {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self::with_token(tools, CancellationToken::new())
    }

    /// Tie every wait to `parent`; cancelling it cancels them all.
    pub fn with_token(tools: Arc<ToolRegistry>, parent: CancellationToken) -> Self {
        Self {
            tools,
            root: parent.child_token(),
            shared: Arc::new(Shared::default()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DependencyEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Suspend `unit` until `dependency` resolves.
    ///
    /// Poll and scheduled waits spawn a task and so must be started inside
    /// a tokio runtime.
    pub fn start_waiting(
        &self,
        unit: impl Into<String>,
        dependency: ExternalDependency,
    ) -> Result<(), AgentError> {
        let unit = unit.into();
        if let ExternalDependency::Poll(config) = &dependency {
            if !self.tools.contains(&config.tool) {
                return Err(AgentError::ToolNotFound(config.tool.clone()));
            }
            if config.max_attempts == 0 {
                return Err(AgentError::Config(format!(
                    "poll for '{unit}' needs at least one attempt"
                )));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.root.child_token();
        {
            let mut waits = self.shared.waits();
            if waits.contains_key(&unit) {
                return Err(AgentError::State(format!("'{unit}' is already waiting")));
            }
            waits.insert(
                unit.clone(),
                Wait {
                    id,
                    dependency: dependency.clone(),
                    token: token.clone(),
                    task: None,
                },
            );
            self.shared.publish(DependencyEvent::Waiting {
                unit: unit.clone(),
                kind: dependency.kind(),
            });
        }
        info!("[dependency] '{unit}' waiting on {}", dependency.kind());

        let shared = Arc::clone(&self.shared);
        let task = match dependency {
            ExternalDependency::Webhook | ExternalDependency::Manual => return Ok(()),
            ExternalDependency::Poll(config) => {
                let tools = Arc::clone(&self.tools);
                tokio::spawn(poll(shared, tools, unit.clone(), id, config, token))
            }
            ExternalDependency::Scheduled { at } => {
                tokio::spawn(scheduled(shared, unit.clone(), id, at, token))
            }
        };
        self.shared.attach(&unit, id, task);
        Ok(())
    }

    /// Resolve a wait from outside, typically a webhook or an operator.
    /// Any wait type can be resolved early this way.
    pub fn trigger(&self, unit: &str, payload: serde_json::Value) -> Result<(), AgentError> {
        let mut waits = self.shared.waits();
        let wait = waits
            .remove(unit)
            .ok_or_else(|| AgentError::State(format!("'{unit}' is not waiting")))?;
        wait.stop();
        info!("[dependency] '{unit}' resolved by trigger");
        self.shared.publish(DependencyEvent::Resolved {
            unit: unit.to_string(),
            payload,
        });
        Ok(())
    }

    /// Cancel the wait for `unit`. Returns `false` if it was not waiting.
    pub fn stop_waiting(&self, unit: &str) -> bool {
        let mut waits = self.shared.waits();
        let Some(wait) = waits.remove(unit) else {
            return false;
        };
        wait.stop();
        info!("[dependency] '{unit}' stopped waiting");
        self.shared.publish(DependencyEvent::Cancelled {
            unit: unit.to_string(),
        });
        true
    }

    /// Cancel every outstanding wait and abort its task. Returns how many
    /// were cancelled.
    pub fn cleanup(&self) -> usize {
        let (units, _) = self.shared.stop_all();
        if !units.is_empty() {
            info!("[dependency] cancelled {} outstanding wait(s)", units.len());
        }
        units.len()
    }

    /// Like [`cleanup`](Self::cleanup), then wait until every aborted task
    /// has exited.
    pub async fn shutdown(&self) -> usize {
        let (units, tasks) = self.shared.stop_all();
        for task in tasks {
            match task.await {
                Err(e) if !e.is_cancelled() => warn!("[dependency] wait task failed: {e}"),
                _ => {}
            }
        }
        if !units.is_empty() {
            info!("[dependency] shut down {} outstanding wait(s)", units.len());
        }
        units.len()
    }

    /// Waits whose task is still running.
    pub fn running_tasks(&self) -> usize {
        self.shared
            .waits()
            .values()
            .filter(|w| w.task.as_ref().is_some_and(|t| !t.is_finished()))
            .count()
    }

    pub fn is_waiting(&self, unit: &str) -> bool {
        self.shared.waits().contains_key(unit)
    }

    pub fn dependency(&self, unit: &str) -> Option<ExternalDependency> {
        self.shared.waits().get(unit).map(|w| w.dependency.clone())
    }

    /// Units currently waiting, sorted.
    pub fn waiting(&self) -> Vec<String> {
        let mut units: Vec<String> = self.shared.waits().keys().cloned().collect();
        units.sort();
        units
    }
}

impl Drop for ExternalDependencyHandler {
    fn drop(&mut self) {
        self.root.cancel();
        for (_, wait) in self.shared.waits().drain() {
            wait.stop();
        }
    }
}

async fn poll(
    shared: Arc<Shared>,
    tools: Arc<ToolRegistry>,
    unit: String,
    id: u64,
    config: PollConfig,
    token: CancellationToken,
) {
    for attempt in 1..=config.max_attempts {
        if token.is_cancelled() {
            return;
        }
        let outcome = match tools.get(&config.tool) {
            Some(tool) => {
                let check = tool.execute(&config.arguments);
                let bounded = async {
                    match config.attempt_timeout {
                        Some(limit) => tokio::time::timeout(limit, check).await.unwrap_or_else(
                            |_| Err(format!("check timed out after {}ms", limit.as_millis())),
                        ),
                        None => check.await,
                    }
                };
                match await_or_cancel(&token, bounded).await {
                    CancelAware::Cancelled => return,
                    CancelAware::Value(outcome) => outcome,
                }
            }
            None => Err(format!("unknown tool '{}'", config.tool)),
        };
        match outcome {
            Ok(output) => {
                let event = DependencyEvent::PollSucceeded {
                    unit: unit.clone(),
                    attempts: attempt,
                    output,
                };
                if shared.finish(&unit, id, event) {
                    info!("[dependency] '{unit}' poll succeeded on attempt {attempt}");
                }
                return;
            }
            Err(e) => debug!(
                "[dependency] '{unit}' poll {attempt}/{} not ready: {e}",
                config.max_attempts
            ),
        }
        if attempt < config.max_attempts
            && sleep_or_cancel(&token, config.backoff.delay(attempt)).await
        {
            return;
        }
    }

    let event = DependencyEvent::PollTimedOut {
        unit: unit.clone(),
        attempts: config.max_attempts,
    };
    if shared.finish(&unit, id, event) {
        warn!(
            "[dependency] '{unit}' poll gave up after {} attempt(s)",
            config.max_attempts
        );
    }
}

async fn scheduled(
    shared: Arc<Shared>,
    unit: String,
    id: u64,
    at: DateTime<Utc>,
    token: CancellationToken,
) {
    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    if sleep_or_cancel(&token, delay).await {
        return;
    }
    let event = DependencyEvent::ScheduledFired { unit: unit.clone() };
    if shared.finish(&unit, id, event) {
        info!("[dependency] '{unit}' scheduled time reached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolDef;
    use crate::tools::core::FnTool;
    use std::sync::atomic::AtomicU32;

    /// A check that fails `failures` times, then reports "ready".
    fn flaky_check(failures: u32, calls: Arc<AtomicU32>) -> FnTool {
        FnTool::new(
            ToolDef::new("check", "Is it ready?", serde_json::json!({"type": "object"})),
            move |_: serde_json::Value| {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n > failures {
                        Ok("ready".to_string())
                    } else {
                        Err(format!("not yet ({n})"))
                    }
                }
            },
        )
    }

    fn handler_with(tool: FnTool) -> ExternalDependencyHandler {
        ExternalDependencyHandler::new(Arc::new(ToolRegistry::new().with(tool)))
    }

    fn fixed_backoff(ms: u64) -> BackoffConfig {
        BackoffConfig::new(Duration::from_millis(ms), Duration::from_millis(ms)).with_jitter(false)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DependencyEvent>) -> Vec<DependencyEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn manual_wait_resolves_on_trigger() {
        let handler = handler_with(flaky_check(0, Arc::default()));
        let mut rx = handler.subscribe();
        handler.start_waiting("approval", ExternalDependency::Manual).unwrap();
        assert!(handler.is_waiting("approval"));
        assert_eq!(handler.dependency("approval"), Some(ExternalDependency::Manual));

        handler
            .trigger("approval", serde_json::json!({"approved_by": "ops"}))
            .unwrap();
        assert!(!handler.is_waiting("approval"));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            DependencyEvent::Resolved { unit, payload } if unit == "approval" && payload["approved_by"] == "ops"
        ));
        assert!(matches!(
            handler.trigger("approval", serde_json::Value::Null),
            Err(AgentError::State(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_and_invalid_waits_are_rejected() {
        let handler = handler_with(flaky_check(0, Arc::default()));
        handler.start_waiting("u", ExternalDependency::Webhook).unwrap();
        assert!(matches!(
            handler.start_waiting("u", ExternalDependency::Manual),
            Err(AgentError::State(_))
        ));
        assert_eq!(
            handler.start_waiting("p", ExternalDependency::Poll(PollConfig::new("nope"))),
            Err(AgentError::ToolNotFound("nope".into()))
        );
        assert!(!handler.is_waiting("p"));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_succeeds_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = handler_with(flaky_check(2, Arc::clone(&calls)));
        let mut rx = handler.subscribe();
        let config = PollConfig::new("check")
            .with_max_attempts(5)
            .with_backoff(fixed_backoff(1_000));
        handler.start_waiting("deploy", ExternalDependency::Poll(config)).unwrap();

        let _waiting = rx.recv().await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            DependencyEvent::PollSucceeded {
                unit: "deploy".into(),
                attempts: 3,
                output: "ready".into(),
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!handler.is_waiting("deploy"));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = handler_with(flaky_check(u32::MAX, Arc::clone(&calls)));
        let mut rx = handler.subscribe();
        let config = PollConfig::new("check")
            .with_max_attempts(3)
            .with_backoff(fixed_backoff(500));
        handler.start_waiting("deploy", ExternalDependency::Poll(config)).unwrap();

        let _waiting = rx.recv().await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            DependencyEvent::PollTimedOut {
                unit: "deploy".into(),
                attempts: 3,
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_poll_never_reports_an_outcome() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = handler_with(flaky_check(u32::MAX, Arc::clone(&calls)));
        let mut rx = handler.subscribe();
        let config = PollConfig::new("check")
            .with_max_attempts(4)
            .with_backoff(fixed_backoff(1_000));
        handler.start_waiting("deploy", ExternalDependency::Poll(config)).unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let before = calls.load(Ordering::SeqCst);
        assert!(before >= 1);
        assert!(handler.stop_waiting("deploy"));
        assert!(!handler.stop_waiting("deploy"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), before);
        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(DependencyEvent::Cancelled { .. })));
        assert!(!events.iter().any(|e| matches!(
            e,
            DependencyEvent::PollSucceeded { .. } | DependencyEvent::PollTimedOut { .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn past_schedule_fires_immediately() {
        let handler = handler_with(flaky_check(0, Arc::default()));
        let mut rx = handler.subscribe();
        let at = Utc::now() - chrono::Duration::minutes(5);
        handler
            .start_waiting("report", ExternalDependency::Scheduled { at })
            .unwrap();

        let _waiting = rx.recv().await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            DependencyEvent::ScheduledFired {
                unit: "report".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_cancels_every_wait() {
        let handler = handler_with(flaky_check(0, Arc::default()));
        let mut rx = handler.subscribe();
        let later = Utc::now() + chrono::Duration::hours(1);
        handler
            .start_waiting("a", ExternalDependency::Scheduled { at: later })
            .unwrap();
        handler.start_waiting("b", ExternalDependency::Webhook).unwrap();
        assert_eq!(handler.waiting(), vec!["a", "b"]);

        assert_eq!(handler.cleanup(), 2);
        assert!(handler.waiting().is_empty());

        tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
        let events = drain(&mut rx);
        let cancelled: Vec<&str> = events
            .iter()
            .filter(|e| matches!(e, DependencyEvent::Cancelled { .. }))
            .map(DependencyEvent::unit)
            .collect();
        assert_eq!(cancelled, vec!["a", "b"]);
        assert!(!events.iter().any(|e| matches!(e, DependencyEvent::ScheduledFired { .. })));
    }

    /// A check that never answers. Each in-flight call holds a clone of
    /// `alive`.
    fn hanging_check(alive: Arc<()>) -> FnTool {
        FnTool::new(
            ToolDef::new("hang", "Never answers", serde_json::json!({"type": "object"})),
            move |_: serde_json::Value| {
                let alive = Arc::clone(&alive);
                async move {
                    let _alive = alive;
                    std::future::pending::<()>().await;
                    Ok::<String, String>("unreachable".into())
                }
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_every_task_to_exit() {
        let alive = Arc::new(());
        let handler = handler_with(hanging_check(Arc::clone(&alive)));
        let later = Utc::now() + chrono::Duration::hours(1);
        handler
            .start_waiting("timer", ExternalDependency::Scheduled { at: later })
            .unwrap();
        let poll = PollConfig::new("hang").with_attempt_timeout(None);
        handler
            .start_waiting("check", ExternalDependency::Poll(poll))
            .unwrap();
        handler.start_waiting("hook", ExternalDependency::Webhook).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handler.running_tasks(), 2);
        assert_eq!(Arc::strong_count(&alive), 3, "check in flight");

        assert_eq!(handler.shutdown().await, 3);
        assert_eq!(Arc::strong_count(&alive), 2, "check dropped");
        assert_eq!(handler.running_tasks(), 0);
        assert!(handler.waiting().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_a_wait_drops_its_task() {
        let alive = Arc::new(());
        let handler = handler_with(hanging_check(Arc::clone(&alive)));
        let poll = PollConfig::new("hang").with_attempt_timeout(None);
        handler
            .start_waiting("check", ExternalDependency::Poll(poll))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(Arc::strong_count(&alive), 3);

        assert!(handler.stop_waiting("check"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(Arc::strong_count(&alive), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_check_counts_as_not_ready() {
        let handler = handler_with(hanging_check(Arc::default()));
        let mut rx = handler.subscribe();
        let config = PollConfig::new("hang")
            .with_max_attempts(2)
            .with_backoff(fixed_backoff(100))
            .with_attempt_timeout(Some(Duration::from_secs(5)));
        let started = tokio::time::Instant::now();
        handler
            .start_waiting("deploy", ExternalDependency::Poll(config))
            .unwrap();

        let _waiting = rx.recv().await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            DependencyEvent::PollTimedOut {
                unit: "deploy".into(),
                attempts: 2,
            }
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(10_100), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(11), "{elapsed:?}");
    }

    #[test]
    fn dependency_config_deserializes() {
        let dep: ExternalDependency = serde_json::from_str(
            r#"{"type": "poll", "tool": "check", "max_attempts": 3,
                "backoff": {"initial_delay_ms": 250}}"#,
        )
        .unwrap();
        let ExternalDependency::Poll(config) = dep else {
            panic!("expected poll");
        };
        assert_eq!(config.arguments, "{}");
        assert_eq!(config.backoff.initial_delay, Duration::from_millis(250));
        assert_eq!(config.attempt_timeout, Some(Duration::from_secs(30)));
    }
}
