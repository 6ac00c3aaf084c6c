//! Tool abstractions for LLM function-calling agents.
//!
//! Every agent capability is a [`Tool`] implementor. Tools live in a
//! [`ToolRegistry`] and each invocation runs through a [`ToolPipeline`]
//! of [`ToolPlugin`]s.
//!
//! # Defining tools
//!
//! - **[`FnTool`]**: closure-based, auto-parses arguments. Best for simple tools.
//! - **`impl Tool`**: full struct with manual [`Tool::definition()`] and
//!   [`Tool::execute()`]. Best for tools with state.
//!
//! # Submodules
//!
//! - [`core`]: [`Tool`] trait, [`FnTool`], argument validation and truncation helpers.
//! - [`registry`]: [`ToolRegistry`] with snapshot reads and atomic replacement.
//! - [`pipeline`]: [`ToolPipeline`] and the built-in plugins.

pub mod core;
pub mod pipeline;
pub mod registry;

pub use core::{
    DEFAULT_MAX_RESULT_BYTES, FnTool, Tool, ToolFuture, parse_tool_args, truncate_result,
    validate_tool_arguments,
};
pub use pipeline::{
    ArgumentValidationPlugin, LoggingToolPlugin, ToolInvocation, ToolPipeline, ToolPlugin,
    TruncationPlugin,
};
pub use registry::ToolRegistry;
