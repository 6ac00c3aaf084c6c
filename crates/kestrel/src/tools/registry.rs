//! Concurrent tool registry.
//!
//! Readers take a snapshot of the current map and never block writers for
//! longer than an `Arc` clone. Register and unregister build a new map and
//! swap it in, so a turn that already holds a snapshot keeps seeing the
//! tools it started with.

use super::core::Tool;
use crate::ToolDef;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

type ToolMap = HashMap<String, Arc<dyn Tool>>;

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<Arc<ToolMap>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool (builder pattern).
    pub fn with(self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    /// Register a tool, returning the one it replaced.
    pub fn register(&self, tool: impl Tool + 'static) -> Option<Arc<dyn Tool>> {
        self.register_shared(Arc::new(tool))
    }

    pub fn register_shared(&self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.name();
        debug!("[registry] register {name}");
        self.update(|map| map.insert(name, tool))
    }

    /// Remove a tool. Returns `true` if it was present.
    pub fn unregister(&self, name: &str) -> bool {
        debug!("[registry] unregister {name}");
        self.update(|map| map.remove(name)).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.snapshot().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.snapshot().contains_key(name)
    }

    /// The current map. Later registrations do not affect it.
    pub fn snapshot(&self) -> Arc<HashMap<String, Arc<dyn Tool>>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Definitions for the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDef> {
        let snapshot = self.snapshot();
        let mut defs: Vec<ToolDef> = snapshot.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn update<R>(&self, f: impl FnOnce(&mut ToolMap) -> R) -> R {
        let mut guard = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        let mut next: ToolMap = (**guard).clone();
        let out = f(&mut next);
        *guard = Arc::new(next);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::core::FnTool;
    use serde_json::json;

    fn named(name: &str, reply: &'static str) -> FnTool {
        FnTool::new(
            ToolDef::new(name, "test tool", json!({"type": "object"})),
            move |_: serde_json::Value| async move { Ok(reply.to_string()) },
        )
    }

    #[test]
    fn register_and_lookup() {
        let registry = ToolRegistry::new().with(named("b", "1")).with(named("a", "2"));
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.contains("a"));
        let defs = registry.definitions();
        assert_eq!(defs[0].function.name, "a");
    }

    #[tokio::test]
    async fn snapshots_survive_replacement() {
        let registry = ToolRegistry::new().with(named("echo", "old"));
        let before = registry.snapshot();
        let replaced = registry.register(named("echo", "new"));
        assert!(replaced.is_some());

        let old = before.get("echo").unwrap().execute("{}").await;
        let new = registry.get("echo").unwrap().execute("{}").await;
        assert_eq!(old, Ok("old".into()));
        assert_eq!(new, Ok("new".into()));
    }

    #[test]
    fn unregister_reports_presence() {
        let registry = ToolRegistry::new().with(named("x", ""));
        assert!(registry.unregister("x"));
        assert!(!registry.unregister("x"));
        assert!(registry.is_empty());
    }
}
