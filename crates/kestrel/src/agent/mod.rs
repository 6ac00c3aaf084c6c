//! Agent runtime: the [`Harness`] agentic loop and its supporting modules.
//!
//! - [`harness::Harness`]: the core tool-use loop. Start here.
//! - [`config::HarnessConfig`]: iteration limits, timeouts, retry and
//!   circuit breaker settings.
//! - [`events`]: the [`EventHandler`] trait and [`AgentEvent`] enum for
//!   observing a run. Includes [`LoggingHandler`], [`CompositeEventHandler`]
//!   and [`FnEventHandler`].
//! - [`hooks`]: interception points around model and tool calls, with
//!   in-process [`FnHook`]s and shell [`CommandHook`]s.
//! - [`execution`]: the per-run state machine, metrics and audit trail.

pub mod config;
pub mod events;
pub mod execution;
pub mod harness;
pub mod hooks;

pub use config::HarnessConfig;
pub use events::{
    AgentEvent, CompositeEventHandler, EventBus, EventHandler, FnEventHandler, LoggingHandler,
    NoopHandler,
};
pub use execution::{
    AuditEntry, AuditOutcome, ExecutionContext, ExecutionMetrics, ExecutionState,
    generate_run_id,
};
pub use harness::{Harness, RunControl, RunError, RunResult, RunSnapshot, pipeline_for};
pub use hooks::{
    CommandHook, FnHook, Hook, HookConfig, HookContext, HookEntry, HookManager, HookOutcome,
    HookPoint,
};
