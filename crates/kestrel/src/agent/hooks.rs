//! Lifecycle hooks: user callbacks at fixed points of the agent loop.
//!
//! | Point          | Fires                          | Outcome fields it may set          |
//! |----------------|--------------------------------|------------------------------------|
//! | `before:llm`   | before each model call         | `inject_message`                   |
//! | `after:llm`    | after each model response      | `inject_message`                   |
//! | `approve:tool` | before each tool call          | `approved`, `deny_reason`          |
//! | `before:tool`  | after approval                 | `arguments`, `skip`, `mock_result` |
//! | `after:tool`   | after each tool result         | `result`                           |
//! | `check:pause`  | at the top of every iteration  | `pause`                            |
//!
//! Every invocation runs under a timeout. A hook that times out or errors
//! contributes nothing and is reported back as a [`HookFailure`]; the run
//! carries on.
//!
//! Two implementations ship here: [`FnHook`] wraps a closure and
//! [`CommandHook`] runs a shell command configured through [`HookConfig`].

use crate::cancel::{CancelAware, CancellationToken, await_or_cancel};
use crate::error::AgentError;
use crate::{ToolCall, ToolResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum bytes of tool result passed to command hooks.
const MAX_TOOL_RESULT_ENV_BYTES: usize = 10_240;

// ── Hook points ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HookPoint {
    #[serde(rename = "before:llm")]
    BeforeLlm,
    #[serde(rename = "after:llm")]
    AfterLlm,
    #[serde(rename = "before:tool")]
    BeforeTool,
    #[serde(rename = "after:tool")]
    AfterTool,
    #[serde(rename = "approve:tool")]
    ApproveTool,
    #[serde(rename = "check:pause")]
    CheckPause,
}

impl HookPoint {
    pub const ALL: [HookPoint; 6] = [
        HookPoint::BeforeLlm,
        HookPoint::AfterLlm,
        HookPoint::BeforeTool,
        HookPoint::AfterTool,
        HookPoint::ApproveTool,
        HookPoint::CheckPause,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::BeforeLlm => "before:llm",
            HookPoint::AfterLlm => "after:llm",
            HookPoint::BeforeTool => "before:tool",
            HookPoint::AfterTool => "after:tool",
            HookPoint::ApproveTool => "approve:tool",
            HookPoint::CheckPause => "check:pause",
        }
    }

    fn is_tool_point(&self) -> bool {
        matches!(
            self,
            HookPoint::BeforeTool | HookPoint::AfterTool | HookPoint::ApproveTool
        )
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookPoint {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookPoint::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| AgentError::Config(format!("unknown hook point '{s}'")))
    }
}

// ── Context and outcome ────────────────────────────────────────────

/// What a hook gets to see.
#[derive(Debug, Clone, Serialize)]
pub struct HookContext {
    pub point: HookPoint,
    pub iteration: u32,
    /// The call under consideration (tool points only).
    pub call: Option<ToolCall>,
    /// The produced result (`after:tool` only).
    pub result: Option<ToolResult>,
    /// Text of the latest model response (`after:llm` only).
    pub response: Option<String>,
    pub message_count: usize,
}

impl HookContext {
    pub fn new(point: HookPoint, iteration: u32) -> Self {
        Self {
            point,
            iteration,
            call: None,
            result: None,
            response: None,
            message_count: 0,
        }
    }

    pub fn with_call(mut self, call: &ToolCall) -> Self {
        self.call = Some(call.clone());
        self
    }

    pub fn with_result(mut self, result: &ToolResult) -> Self {
        self.result = Some(result.clone());
        self
    }

    pub fn with_response(mut self, response: Option<&str>) -> Self {
        self.response = response.map(str::to_string);
        self
    }

    pub fn with_message_count(mut self, count: usize) -> Self {
        self.message_count = count;
        self
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.call.as_ref().map(|c| c.name())
    }
}

/// Modifications requested by a hook. Unset fields mean "no change".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookOutcome {
    /// Replacement tool arguments (`before:tool`).
    pub arguments: Option<String>,
    /// Skip execution and use `mock_result` (`before:tool`).
    pub skip: bool,
    pub mock_result: Option<String>,
    /// Replacement result content (`after:tool`).
    pub result: Option<String>,
    /// User message to add to the conversation (`before:llm`, `after:llm`).
    pub inject_message: Option<String>,
    /// Approval decision (`approve:tool`). `None` abstains.
    pub approved: Option<bool>,
    pub deny_reason: Option<String>,
    /// Request a pause (`check:pause`).
    pub pause: bool,
}

impl HookOutcome {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: Some(false),
            deny_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn approve() -> Self {
        Self {
            approved: Some(true),
            ..Default::default()
        }
    }

    pub fn inject(message: impl Into<String>) -> Self {
        Self {
            inject_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn skip_with(mock_result: impl Into<String>) -> Self {
        Self {
            skip: true,
            mock_result: Some(mock_result.into()),
            ..Default::default()
        }
    }

    pub fn replace_arguments(arguments: impl Into<String>) -> Self {
        Self {
            arguments: Some(arguments.into()),
            ..Default::default()
        }
    }

    pub fn replace_result(result: impl Into<String>) -> Self {
        Self {
            result: Some(result.into()),
            ..Default::default()
        }
    }

    pub fn pause() -> Self {
        Self {
            pause: true,
            ..Default::default()
        }
    }

    /// Fold a later hook's outcome into this one.
    ///
    /// Fields already set are kept. Flags are OR-ed. A denial from any hook
    /// overrides approvals.
    pub fn merge(&mut self, later: HookOutcome) {
        fn first<T>(slot: &mut Option<T>, later: Option<T>) {
            if slot.is_none() {
                *slot = later;
            }
        }
        first(&mut self.arguments, later.arguments);
        first(&mut self.mock_result, later.mock_result);
        first(&mut self.result, later.result);
        first(&mut self.inject_message, later.inject_message);
        first(&mut self.deny_reason, later.deny_reason);
        self.skip |= later.skip;
        self.pause |= later.pause;
        self.approved = match (self.approved, later.approved) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), _) | (_, Some(true)) => Some(true),
            (None, None) => None,
        };
    }

    pub fn is_denied(&self) -> bool {
        self.approved == Some(false)
    }
}

// ── Hook trait ─────────────────────────────────────────────────────

pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<HookOutcome, AgentError>> + Send + 'a>>;

pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    fn point(&self) -> HookPoint;

    fn call<'a>(&'a self, ctx: &'a HookContext) -> HookFuture<'a>;
}

/// A hook backed by an async closure.
///
/// ```ignore
/// let guard = FnHook::new("no-shell", HookPoint::ApproveTool, |ctx| async move {
///     Ok(match ctx.tool_name() {
///         Some("shell") => HookOutcome::deny("shell is disabled"),
///         _ => HookOutcome::default(),
///     })
/// });
/// ```
pub struct FnHook {
    name: String,
    point: HookPoint,
    handler: Box<dyn Fn(HookContext) -> HookFuture<'static> + Send + Sync>,
}

impl FnHook {
    pub fn new<F, Fut>(name: impl Into<String>, point: HookPoint, f: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookOutcome, AgentError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            point,
            handler: Box::new(move |ctx| -> HookFuture<'static> { Box::pin(f(ctx)) }),
        }
    }

    /// A hook whose decision needs no awaiting.
    pub fn sync<F>(name: impl Into<String>, point: HookPoint, f: F) -> Self
    where
        F: Fn(&HookContext) -> HookOutcome + Send + Sync + 'static,
    {
        Self::new(name, point, move |ctx| {
            let outcome = f(&ctx);
            async move { Ok(outcome) }
        })
    }
}

impl Hook for FnHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn point(&self) -> HookPoint {
        self.point
    }

    fn call<'a>(&'a self, ctx: &'a HookContext) -> HookFuture<'a> {
        (self.handler)(ctx.clone())
    }
}

impl fmt::Debug for FnHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHook")
            .field("name", &self.name)
            .field("point", &self.point)
            .finish()
    }
}

// ── HookConfig ─────────────────────────────────────────────────────

/// Shell command hooks keyed by hook point, loadable from JSON.
///
/// ```json
/// {
///   "approve:tool": [{ "command": "./policy.sh", "matcher": "delete" }],
///   "before:llm": [{ "command": "cat NOTES.md", "name": "notes" }]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HookConfig(pub BTreeMap<HookPoint, Vec<HookEntry>>);

/// A single command hook: a shell command with an optional tool name matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEntry {
    pub command: String,
    /// Only fire for tools whose name contains this string.
    #[serde(default)]
    pub matcher: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl HookConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&contents)
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Build one [`CommandHook`] per entry.
    pub fn to_hooks(&self, workdir: Option<&Path>) -> Vec<CommandHook> {
        self.0
            .iter()
            .flat_map(|(point, entries)| {
                entries.iter().enumerate().map(move |(i, entry)| {
                    let name = entry
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("{point}#{i}"));
                    CommandHook {
                        name,
                        point: *point,
                        command: entry.command.clone(),
                        matcher: entry.matcher.clone(),
                        workdir: workdir.map(Path::to_path_buf),
                    }
                })
            })
            .collect()
    }
}

// ── CommandHook ────────────────────────────────────────────────────

/// Runs `sh -c <command>` at a hook point.
///
/// Commands receive context via environment variables:
/// - `KESTREL_HOOK_POINT`: e.g. `approve:tool`
/// - `KESTREL_ITERATION`
/// - `KESTREL_TOOL_NAME`, `KESTREL_TOOL_ARGS` (tool points)
/// - `KESTREL_TOOL_RESULT` (`after:tool`, truncated to 10KB)
/// - `KESTREL_RESPONSE` (`after:llm`)
///
/// Stdout that parses as a JSON [`HookOutcome`] is used as-is. Otherwise a
/// non-zero exit at `approve:tool` denies with stdout as the reason, plain
/// stdout at the LLM points is injected as a message, and a non-zero exit
/// anywhere else is a hook failure. The child is killed if the hook times
/// out.
#[derive(Debug, Clone)]
pub struct CommandHook {
    name: String,
    point: HookPoint,
    command: String,
    matcher: Option<String>,
    workdir: Option<PathBuf>,
}

impl CommandHook {
    pub fn new(name: impl Into<String>, point: HookPoint, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            point,
            command: command.into(),
            matcher: None,
            workdir: None,
        }
    }

    pub fn with_matcher(mut self, matcher: impl Into<String>) -> Self {
        self.matcher = Some(matcher.into());
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    fn matches(&self, ctx: &HookContext) -> bool {
        match (&self.matcher, ctx.tool_name()) {
            (Some(m), Some(tool)) => tool.contains(m.as_str()),
            (Some(_), None) => !self.point.is_tool_point(),
            (None, _) => true,
        }
    }

    async fn run(&self, ctx: &HookContext) -> Result<HookOutcome, AgentError> {
        if !self.matches(ctx) {
            return Ok(HookOutcome::default());
        }

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .kill_on_drop(true)
            .env("KESTREL_HOOK_POINT", self.point.as_str())
            .env("KESTREL_ITERATION", ctx.iteration.to_string());
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        if let Some(call) = &ctx.call {
            cmd.env("KESTREL_TOOL_NAME", call.name())
                .env("KESTREL_TOOL_ARGS", call.arguments());
        }
        if let Some(result) = &ctx.result {
            let body = result.to_message().content.unwrap_or_default();
            let truncated: String = body.chars().take(MAX_TOOL_RESULT_ENV_BYTES).collect();
            cmd.env("KESTREL_TOOL_RESULT", truncated);
        }
        if let Some(response) = &ctx.response {
            cmd.env("KESTREL_RESPONSE", response);
        }

        let output = cmd.output().await.map_err(|e| AgentError::HookFailed {
            hook: self.name.clone(),
            message: format!("failed to execute hook command: {e}"),
        })?;
        let exit_code = output.status.code().unwrap_or(1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("[hook] {} exited {exit_code} ({} bytes stdout)", self.name, stdout.len());

        if let Ok(outcome) = serde_json::from_str::<HookOutcome>(&stdout) {
            return Ok(outcome);
        }
        match (self.point, exit_code) {
            (HookPoint::ApproveTool, 0) => Ok(HookOutcome::default()),
            (HookPoint::ApproveTool, _) => Ok(HookOutcome::deny(if stdout.is_empty() {
                format!("hook '{}' denied the call", self.name)
            } else {
                stdout
            })),
            (_, 0) if stdout.is_empty() => Ok(HookOutcome::default()),
            (HookPoint::BeforeLlm | HookPoint::AfterLlm, 0) => Ok(HookOutcome::inject(stdout)),
            (_, 0) => Ok(HookOutcome::default()),
            (_, code) => Err(AgentError::HookFailed {
                hook: self.name.clone(),
                message: format!("exited with status {code}"),
            }),
        }
    }
}

impl Hook for CommandHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn point(&self) -> HookPoint {
        self.point
    }

    fn call<'a>(&'a self, ctx: &'a HookContext) -> HookFuture<'a> {
        Box::pin(self.run(ctx))
    }
}

// ── HookManager ────────────────────────────────────────────────────

/// A hook that produced nothing because it timed out or errored.
#[derive(Debug, Clone, PartialEq)]
pub struct HookFailure {
    pub hook: String,
    pub point: HookPoint,
    pub error: AgentError,
}

/// Merged outcome of every hook at one point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookRun {
    pub outcome: HookOutcome,
    pub failures: Vec<HookFailure>,
}

#[derive(Clone)]
pub struct HookManager {
    hooks: Vec<Arc<dyn Hook>>,
    timeout: Duration,
    parallel: bool,
}

impl Default for HookManager {
    fn default() -> Self {
        Self {
            hooks: Vec::new(),
            timeout: super::config::DEFAULT_HOOK_TIMEOUT,
            parallel: false,
        }
    }
}

impl fmt::Debug for HookManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks: Vec<String> = self
            .hooks
            .iter()
            .map(|h| format!("{}@{}", h.name(), h.point()))
            .collect();
        f.debug_struct("HookManager")
            .field("hooks", &hooks)
            .field("timeout", &self.timeout)
            .field("parallel", &self.parallel)
            .finish()
    }
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a manager running every command hook from `config`.
    pub fn from_config(config: &HookConfig, workdir: Option<&Path>) -> Self {
        config
            .to_hooks(workdir)
            .into_iter()
            .fold(Self::new(), |m, h| m.with_hook(h))
    }

    pub fn with_hook(mut self, hook: impl Hook + 'static) -> Self {
        self.register(Arc::new(hook));
        self
    }

    pub fn register(&mut self, hook: Arc<dyn Hook>) {
        debug!("[hooks] registered {} at {}", hook.name(), hook.point());
        self.hooks.push(hook);
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn has_hooks(&self, point: HookPoint) -> bool {
        self.hooks.iter().any(|h| h.point() == point)
    }

    /// Run every hook registered at `ctx.point` and merge their outcomes in
    /// registration order.
    pub async fn run(
        &self,
        ctx: &HookContext,
        cancel: &CancellationToken,
    ) -> Result<HookRun, AgentError> {
        let hooks: Vec<Arc<dyn Hook>> = self
            .hooks
            .iter()
            .filter(|h| h.point() == ctx.point)
            .cloned()
            .collect();
        if hooks.is_empty() {
            return Ok(HookRun::default());
        }

        let results: Vec<Result<HookOutcome, AgentError>> = if self.parallel {
            let all = futures::future::join_all(hooks.iter().map(|h| self.invoke(h.as_ref(), ctx)));
            match await_or_cancel(cancel, all).await {
                CancelAware::Cancelled => return Err(AgentError::Cancelled),
                CancelAware::Value(results) => results,
            }
        } else {
            let mut results = Vec::with_capacity(hooks.len());
            for hook in &hooks {
                match await_or_cancel(cancel, self.invoke(hook.as_ref(), ctx)).await {
                    CancelAware::Cancelled => return Err(AgentError::Cancelled),
                    CancelAware::Value(r) => results.push(r),
                }
            }
            results
        };

        let mut run = HookRun::default();
        for (hook, result) in hooks.iter().zip(results) {
            match result {
                Ok(outcome) => run.outcome.merge(outcome),
                Err(error) => {
                    warn!("[hooks] {} at {} failed: {error}", hook.name(), ctx.point);
                    run.failures.push(HookFailure {
                        hook: hook.name().to_string(),
                        point: ctx.point,
                        error,
                    });
                }
            }
        }
        Ok(run)
    }

    async fn invoke(&self, hook: &dyn Hook, ctx: &HookContext) -> Result<HookOutcome, AgentError> {
        match tokio::time::timeout(self.timeout, hook.call(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::HookTimeout {
                hook: hook.name().to_string(),
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn tool_ctx(point: HookPoint, tool: &str) -> HookContext {
        HookContext::new(point, 1).with_call(&ToolCall::new("c1", tool, r#"{"x":1}"#))
    }

    #[test]
    fn hook_point_names_round_trip() {
        for point in HookPoint::ALL {
            assert_eq!(point.as_str().parse::<HookPoint>().unwrap(), point);
        }
        assert!("during:lunch".parse::<HookPoint>().is_err());
    }

    #[test]
    fn merge_is_first_set_wins() {
        let mut outcome = HookOutcome::replace_arguments(r#"{"a":1}"#);
        outcome.merge(HookOutcome {
            arguments: Some(r#"{"a":2}"#.into()),
            skip: true,
            mock_result: Some("mock".into()),
            ..Default::default()
        });
        assert_eq!(outcome.arguments.as_deref(), Some(r#"{"a":1}"#));
        assert!(outcome.skip);
        assert_eq!(outcome.mock_result.as_deref(), Some("mock"));
    }

    #[test]
    fn denial_beats_approval_in_any_order() {
        let mut a = HookOutcome::approve();
        a.merge(HookOutcome::deny("no"));
        assert!(a.is_denied());
        assert_eq!(a.deny_reason.as_deref(), Some("no"));

        let mut b = HookOutcome::deny("first");
        b.merge(HookOutcome::approve());
        assert!(b.is_denied());
    }

    #[test]
    fn config_parses_hook_points() {
        let config: HookConfig = serde_json::from_str(
            r#"{"approve:tool": [{"command": "true", "matcher": "rm"}], "before:llm": []}"#,
        )
        .unwrap();
        let hooks = config.to_hooks(None);
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].point(), HookPoint::ApproveTool);
        assert_eq!(hooks[0].name(), "approve:tool#0");
    }

    #[tokio::test]
    async fn sequential_hooks_merge_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        let manager = HookManager::new()
            .with_hook(FnHook::sync("first", HookPoint::BeforeTool, move |_| {
                o1.lock().unwrap().push("first");
                HookOutcome::replace_arguments("{}")
            }))
            .with_hook(FnHook::sync("second", HookPoint::BeforeTool, move |_| {
                o2.lock().unwrap().push("second");
                HookOutcome::replace_arguments(r#"{"ignored":true}"#)
            }))
            .with_hook(FnHook::sync("other", HookPoint::AfterTool, |_| {
                HookOutcome::replace_result("unused")
            }));

        let run = manager
            .run(&tool_ctx(HookPoint::BeforeTool, "echo"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.outcome.arguments.as_deref(), Some("{}"));
        assert!(run.outcome.result.is_none());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_hook_times_out_without_blocking_others() {
        let manager = HookManager::new()
            .with_timeout(Duration::from_millis(100))
            .with_parallel(true)
            .with_hook(FnHook::new("slow", HookPoint::BeforeLlm, |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(HookOutcome::inject("too late"))
            }))
            .with_hook(FnHook::sync("fast", HookPoint::BeforeLlm, |_| {
                HookOutcome::inject("on time")
            }));

        let run = manager
            .run(&HookContext::new(HookPoint::BeforeLlm, 1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.outcome.inject_message.as_deref(), Some("on time"));
        assert_eq!(run.failures.len(), 1);
        assert_eq!(
            run.failures[0].error,
            AgentError::HookTimeout {
                hook: "slow".into(),
                timeout_ms: 100
            }
        );
    }

    #[tokio::test]
    async fn erroring_hook_is_reported_not_fatal() {
        let manager = HookManager::new().with_hook(FnHook::new(
            "broken",
            HookPoint::CheckPause,
            |_| async {
                Err(AgentError::HookFailed {
                    hook: "broken".into(),
                    message: "bad".into(),
                })
            },
        ));
        let run = manager
            .run(&HookContext::new(HookPoint::CheckPause, 1), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!run.outcome.pause);
        assert_eq!(run.failures[0].hook, "broken");
    }

    #[tokio::test]
    async fn cancelled_token_stops_hooks() {
        let token = CancellationToken::new();
        token.cancel();
        let manager = HookManager::new()
            .with_hook(FnHook::sync("any", HookPoint::BeforeLlm, |_| HookOutcome::default()));
        let result = manager.run(&HookContext::new(HookPoint::BeforeLlm, 1), &token).await;
        assert_eq!(result, Err(AgentError::Cancelled));
    }

    #[tokio::test]
    async fn command_hook_denies_on_nonzero_exit() {
        let hook = CommandHook::new("policy", HookPoint::ApproveTool, "echo 'too risky'; exit 1")
            .with_matcher("delete");
        let denied = hook.call(&tool_ctx(HookPoint::ApproveTool, "delete_rows")).await.unwrap();
        assert!(denied.is_denied());
        assert_eq!(denied.deny_reason.as_deref(), Some("too risky"));

        let unmatched = hook.call(&tool_ctx(HookPoint::ApproveTool, "read")).await.unwrap();
        assert_eq!(unmatched, HookOutcome::default());
    }

    #[tokio::test]
    async fn command_hook_reads_json_outcome_and_env() {
        let hook = CommandHook::new(
            "mock",
            HookPoint::BeforeTool,
            r#"printf '{"skip": true, "mock_result": "%s"}' "$KESTREL_TOOL_NAME""#,
        );
        let outcome = hook.call(&tool_ctx(HookPoint::BeforeTool, "fetch")).await.unwrap();
        assert!(outcome.skip);
        assert_eq!(outcome.mock_result.as_deref(), Some("fetch"));
    }

    #[tokio::test]
    async fn command_hook_text_injects_at_llm_points() {
        let hook = CommandHook::new("notes", HookPoint::BeforeLlm, "echo remember the tests");
        let outcome = hook.call(&HookContext::new(HookPoint::BeforeLlm, 2)).await.unwrap();
        assert_eq!(outcome.inject_message.as_deref(), Some("remember the tests"));
    }

    #[tokio::test]
    async fn command_hook_failure_elsewhere_is_error() {
        let hook = CommandHook::new("bad", HookPoint::AfterTool, "exit 3");
        let err = hook.call(&tool_ctx(HookPoint::AfterTool, "x")).await.unwrap_err();
        assert!(matches!(err, AgentError::HookFailed { .. }));
    }
}
