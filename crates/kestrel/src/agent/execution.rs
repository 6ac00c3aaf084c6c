//! Per-run execution record: state machine, counters and audit trail.
//!
//! ```text
//! idle -> running -> completed | failed | cancelled
//!            ^  |
//!            |  v
//!          suspended -> failed | cancelled
//! ```
//!
//! Entry timestamps are recorded once per state; re-entering `running`
//! after a resume keeps the first timestamp.

use crate::error::AgentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Generate a unique run ID.
pub fn generate_run_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("run-{ts:x}-{count:04x}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, to: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, to),
            (Idle, Running)
                | (Running, Suspended | Completed | Failed | Cancelled)
                | (Suspended, Running | Failed | Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionMetrics {
    pub llm_calls: u32,
    pub llm_retries: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub tool_calls: u32,
    pub tool_errors: u32,
    pub tools_denied: u32,
    pub tools_skipped: u32,
    pub hook_failures: u32,
    pub compactions: u32,
    pub tokens_freed: u64,
}

impl ExecutionMetrics {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Error(String),
    Denied(String),
    Skipped,
}

/// One tool invocation as it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub iteration: u32,
    pub call_id: String,
    pub tool: String,
    /// From [`Tool::describe_call`](crate::tools::core::Tool::describe_call).
    pub description: Option<String>,
    pub outcome: AuditOutcome,
    pub duration_ms: u64,
}

/// Mutable record of one run. Serializable for snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: String,
    state: ExecutionState,
    pub iteration: u32,
    pub consecutive_errors: u32,
    entered: BTreeMap<ExecutionState, DateTime<Utc>>,
    pub metrics: ExecutionMetrics,
    audit: Vec<AuditEntry>,
    pub last_error: Option<String>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(generate_run_id())
    }
}

impl ExecutionContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        let mut entered = BTreeMap::new();
        entered.insert(ExecutionState::Idle, Utc::now());
        Self {
            run_id: run_id.into(),
            state: ExecutionState::Idle,
            iteration: 0,
            consecutive_errors: 0,
            entered,
            metrics: ExecutionMetrics::default(),
            audit: Vec::new(),
            last_error: None,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(&mut self, to: ExecutionState) -> Result<ExecutionState, AgentError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(AgentError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        self.entered.entry(to).or_insert_with(Utc::now);
        Ok(from)
    }

    /// Treat a record captured mid-run as suspended so it can be resumed.
    pub fn suspend_if_running(&mut self) {
        if self.state == ExecutionState::Running {
            self.state = ExecutionState::Suspended;
            self.entered
                .entry(ExecutionState::Suspended)
                .or_insert_with(Utc::now);
        }
    }

    /// When the run first entered `state`.
    pub fn entered_at(&self, state: ExecutionState) -> Option<DateTime<Utc>> {
        self.entered.get(&state).copied()
    }

    /// Record a tool outcome and return the consecutive error count.
    pub fn record_tool_outcome(&mut self, is_error: bool) -> u32 {
        self.metrics.tool_calls += 1;
        if is_error {
            self.metrics.tool_errors += 1;
            self.consecutive_errors += 1;
        } else {
            self.consecutive_errors = 0;
        }
        self.consecutive_errors
    }

    pub fn record_audit(&mut self, entry: AuditEntry) {
        self.audit.push(entry);
    }

    pub fn audit(&self) -> &[AuditEntry] {
        &self.audit
    }

    /// Wall-clock time from `running` to a terminal state (or now).
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let start = self.entered_at(ExecutionState::Running)?;
        let end = [
            ExecutionState::Completed,
            ExecutionState::Failed,
            ExecutionState::Cancelled,
        ]
        .iter()
        .find_map(|s| self.entered_at(*s))
        .unwrap_or_else(Utc::now);
        Some(end - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionState::*;

    #[test]
    fn happy_path_transitions() {
        let mut ctx = ExecutionContext::new("r1");
        assert_eq!(ctx.transition(Running), Ok(Idle));
        assert_eq!(ctx.transition(Suspended), Ok(Running));
        assert_eq!(ctx.transition(Running), Ok(Suspended));
        assert_eq!(ctx.transition(Completed), Ok(Running));
        assert!(ctx.state().is_terminal());
    }

    #[test]
    fn terminal_states_reject_transitions() {
        for terminal in [Completed, Failed, Cancelled] {
            for to in [Idle, Running, Suspended, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(to), "{terminal} -> {to}");
            }
        }
        let mut ctx = ExecutionContext::new("r1");
        assert!(matches!(
            ctx.transition(Completed),
            Err(AgentError::InvalidTransition { .. })
        ));
        assert_eq!(ctx.state(), Idle);
    }

    #[test]
    fn first_entry_timestamp_wins() {
        let mut ctx = ExecutionContext::new("r1");
        ctx.transition(Running).unwrap();
        let first = ctx.entered_at(Running).unwrap();
        ctx.transition(Suspended).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        ctx.transition(Running).unwrap();
        assert_eq!(ctx.entered_at(Running), Some(first));
    }

    #[test]
    fn consecutive_errors_reset_on_success() {
        let mut ctx = ExecutionContext::new("r1");
        assert_eq!(ctx.record_tool_outcome(true), 1);
        assert_eq!(ctx.record_tool_outcome(true), 2);
        assert_eq!(ctx.record_tool_outcome(false), 0);
        assert_eq!(ctx.metrics.tool_calls, 3);
        assert_eq!(ctx.metrics.tool_errors, 2);
    }

    #[test]
    fn snapshot_serializes() {
        let mut ctx = ExecutionContext::new("r1");
        ctx.transition(Running).unwrap();
        ctx.record_audit(AuditEntry {
            at: Utc::now(),
            iteration: 1,
            call_id: "c1".into(),
            tool: "echo".into(),
            description: Some("echo hi".into()),
            outcome: AuditOutcome::Denied("policy".into()),
            duration_ms: 0,
        });
        let json = serde_json::to_string(&ctx).unwrap();
        let back: ExecutionContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn running_snapshot_restores_as_suspended() {
        let mut ctx = ExecutionContext::new("r1");
        ctx.transition(Running).unwrap();
        ctx.suspend_if_running();
        assert_eq!(ctx.state(), Suspended);
        assert_eq!(ctx.transition(Running), Ok(Suspended));
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(generate_run_id(), generate_run_id());
    }
}
