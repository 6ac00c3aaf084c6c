//! The context plugin contract.
//!
//! A plugin supplies zero or one [`ContextComponent`] per turn. The
//! [`ContextManager`](super::manager::ContextManager) never assumes a plugin
//! can shrink itself: the defaults report "not compactable" and "freed
//! nothing", and plugins opt in by overriding them.

use super::component::{ContextBudget, ContextComponent};
use super::estimator::TokenEstimator;
use crate::error::AgentError;
use serde::{Deserialize, Serialize};

/// Serialized plugin state. `data` is opaque to everyone but the plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginState {
    pub version: u32,
    pub data: serde_json::Value,
}

impl PluginState {
    pub fn new(version: u32, data: serde_json::Value) -> Self {
        Self { version, data }
    }

    /// State for plugins that carry nothing worth persisting.
    pub fn empty() -> Self {
        Self::new(0, serde_json::Value::Null)
    }

    /// Decode `data` into a typed value, rejecting unknown versions.
    pub fn decode<T: serde::de::DeserializeOwned>(
        &self,
        plugin: &str,
        expected_version: u32,
    ) -> Result<T, AgentError> {
        if self.version != expected_version {
            return Err(AgentError::State(format!(
                "plugin '{plugin}': unsupported state version {} (expected {expected_version})",
                self.version
            )));
        }
        serde_json::from_value(self.data.clone())
            .map_err(|e| AgentError::State(format!("plugin '{plugin}': {e}")))
    }
}

/// A pluggable supplier of one kind of context content.
///
/// Methods take `&self`; plugins that hold mutable content use interior
/// mutability so they can be shared with the code that feeds them.
pub trait ContextPlugin: Send + Sync {
    /// Stable plugin name, used as the key in manager state.
    fn name(&self) -> &str;

    /// The component for this turn, or `None` when there is nothing to add.
    fn get_component(&self) -> Result<Option<ContextComponent>, AgentError>;

    /// Whether [`compact`](Self::compact) can actually free tokens.
    fn is_compactable(&self) -> bool {
        false
    }

    /// Shrink internal content toward `target_tokens`. Returns tokens freed.
    fn compact(&self, target_tokens: usize, estimator: &dyn TokenEstimator) -> usize {
        let _ = (target_tokens, estimator);
        0
    }

    /// Accept a component shrunk by an external compactor so the shrinkage
    /// persists into the next turn. Returns `false` if ignored.
    fn apply_compacted(&self, component: &ContextComponent) -> bool {
        let _ = component;
        false
    }

    /// Called after compaction settles for plugins whose content changed.
    fn on_prepared(&self, budget: &ContextBudget) {
        let _ = budget;
    }

    fn get_state(&self) -> PluginState {
        PluginState::empty()
    }

    fn restore_state(&self, state: &PluginState) -> Result<(), AgentError> {
        let _ = state;
        Ok(())
    }

    /// Release resources. Called once when the manager is torn down.
    fn destroy(&self) {}
}
