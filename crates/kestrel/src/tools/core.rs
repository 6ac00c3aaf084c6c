//! Tool abstraction for LLM function-calling agents.
//!
//! The [`Tool`] trait defines the interface every tool implements: a static
//! API definition (name, description, JSON schema) and an async `execute`
//! method. Tools are registered in a
//! [`ToolRegistry`](super::registry::ToolRegistry) and invoked through the
//! [`ToolPipeline`](super::pipeline::ToolPipeline).

use crate::ToolDef;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info, trace};

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Boxed future returned by [`Tool::execute`]. `Err` carries a message
/// for the model, not a panic.
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

// ── Tool trait ─────────────────────────────────────────────────────

/// A tool that an LLM agent can invoke via function-calling.
///
/// # Example
///
/// ```ignore
/// struct Lookup { table: Arc<HashMap<String, String>> }
///
/// impl Tool for Lookup {
///     fn definition(&self) -> ToolDef { /* ... */ }
///
///     fn execute(&self, arguments: &str) -> ToolFuture<'_> {
///         let parsed = parse_tool_args::<LookupArgs>(arguments);
///         Box::pin(async move {
///             let args = parsed?;
///             self.table.get(&args.key).cloned().ok_or_else(|| "not found".into())
///         })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    /// The tool definition sent to the model.
    fn definition(&self) -> ToolDef;

    /// Execute with the raw JSON arguments string.
    fn execute(&self, arguments: &str) -> ToolFuture<'_>;

    /// The tool's name (delegates to the definition).
    fn name(&self) -> String {
        self.definition().function.name
    }

    /// Human-readable description of one invocation, recorded in the
    /// audit trail (e.g. `"delete 3 rows from users"`).
    fn describe_call(&self, _arguments: &str) -> Option<String> {
        None
    }
}

// ── FnTool ────────────────────────────────────────────────────────

/// Type-erased async handler for [`FnTool`].
type ErasedToolHandler =
    Box<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>> + Send + Sync>;

type Describer = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A closure-based tool that parses arguments into `A` and delegates to a
/// handler.
///
/// Use it for stateless tools. Tools that hold shared state should be a
/// struct implementing [`Tool`] directly.
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct EchoArgs { text: String }
///
/// let echo = FnTool::new(
///     ToolDef::new("echo", "Echo text back", json_schema_for::<EchoArgs>()),
///     |args: EchoArgs| async move { Ok(args.text) },
/// );
/// ```
pub struct FnTool {
    def: ToolDef,
    handler: ErasedToolHandler,
    describe: Option<Describer>,
}

impl FnTool {
    pub fn new<A, F, Fut>(def: ToolDef, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let erased = move |raw: String| -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>> {
            match parse_tool_args::<A>(&raw) {
                Ok(args) => Box::pin(handler(args)),
                Err(e) => Box::pin(async move { Err(e) }),
            }
        };
        Self {
            def,
            handler: Box::new(erased),
            describe: None,
        }
    }

    /// Attach an audit description for each call.
    pub fn with_description<D>(mut self, describe: D) -> Self
    where
        D: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.describe = Some(Box::new(describe));
        self
    }
}

impl Tool for FnTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        (self.handler)(arguments.to_string())
    }

    fn describe_call(&self, arguments: &str) -> Option<String> {
        self.describe.as_ref().and_then(|d| d(arguments))
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.def.function.name)
            .finish()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Validate arguments against a tool's declared JSON Schema.
///
/// The error lists every violation with its instance path so the model can
/// correct all of them at once. An invalid schema skips validation.
pub fn validate_tool_arguments(def: &ToolDef, arguments: &str) -> Result<(), String> {
    let args_value: serde_json::Value = serde_json::from_str(arguments)
        .map_err(|e| format!("arguments are not valid JSON: {e}"))?;

    let Ok(validator) = jsonschema::validator_for(&def.function.parameters) else {
        return Ok(());
    };

    let errors: Vec<String> = validator
        .iter_errors(&args_value)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!("schema validation failed:\n{}", errors.join("\n")))
    }
}

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, arguments: &str) {
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.chars().count() > 120 { "..." } else { "" }
    );
    debug!("[tool] {name} full args ({} bytes)", arguments.len());
    trace!("[tool] {name} arguments: {arguments}");
}

/// Truncate a string to at most `max` bytes (on a char boundary),
/// appending a notice if trimmed.
pub fn truncate_result(s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}...\n[truncated: {} bytes total]",
        s.get(..cut).unwrap_or_default(),
        s.len()
    )
}

/// Parse raw JSON arguments into a typed struct.
pub fn parse_tool_args<T: DeserializeOwned>(arguments: &str) -> Result<T, String> {
    serde_json::from_str(arguments).map_err(|e| {
        format!(
            "invalid tool arguments: {e}. \
             Please provide valid JSON matching the tool's parameter schema."
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_schema_for;
    use schemars::JsonSchema;
    use serde::Deserialize;

    #[derive(Deserialize, JsonSchema)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    fn add_tool() -> FnTool {
        FnTool::new(
            ToolDef::new("add", "Add two numbers", json_schema_for::<AddArgs>()),
            |args: AddArgs| async move { Ok((args.a + args.b).to_string()) },
        )
        .with_description(|raw| Some(format!("add {raw}")))
    }

    #[tokio::test]
    async fn fn_tool_parses_and_runs() {
        let tool = add_tool();
        assert_eq!(tool.name(), "add");
        assert_eq!(tool.execute(r#"{"a": 2, "b": 3}"#).await, Ok("5".into()));
    }

    #[tokio::test]
    async fn fn_tool_reports_parse_errors() {
        let err = add_tool().execute("not json").await.unwrap_err();
        assert!(err.contains("invalid tool arguments"));
    }

    #[test]
    fn describe_call_uses_closure() {
        assert_eq!(add_tool().describe_call("{}"), Some("add {}".into()));
    }

    #[test]
    fn validation_lists_violations() {
        let def = add_tool().definition();
        assert!(validate_tool_arguments(&def, r#"{"a": 1, "b": 2}"#).is_ok());
        let err = validate_tool_arguments(&def, r#"{"a": "one"}"#).unwrap_err();
        assert!(err.contains("schema validation failed"), "{err}");
    }

    #[test]
    fn validation_rejects_bad_json() {
        let def = add_tool().definition();
        assert!(validate_tool_arguments(&def, "{").unwrap_err().contains("not valid JSON"));
    }

    #[test]
    fn truncation_keeps_char_boundaries() {
        let out = truncate_result("ééééé".into(), 3);
        assert!(out.starts_with("é..."));
        assert!(out.contains("[truncated: 10 bytes total]"));
        assert_eq!(truncate_result("short".into(), 100), "short");
    }
}
