//! Per-turn context assembly.
//!
//! [`ContextManager::prepare`] polls every plugin, prices the components,
//! classifies the budget and, when the strategy asks for it, runs
//! compaction exactly once before the content is handed to the model.

use super::component::{
    CompactionResult, ComponentContent, ContextBudget, ContextComponent, ContextOverflow,
};
use super::compactor::Compactor;
use super::estimator::{CharRatioEstimator, TokenEstimator};
use super::plugin::{ContextPlugin, PluginState};
use super::strategy::{CompactionContext, CompactionStrategy, ProactiveStrategy};
use crate::error::AgentError;
use crate::Message;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default context window size in tokens.
pub const DEFAULT_CONTEXT_WINDOW: usize = 200_000;

/// Default tokens held back for the model's response.
pub const DEFAULT_RESPONSE_RESERVE: usize = 4_096;

/// Size of the context window and the slice reserved for the response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_context_tokens: usize,
    pub response_reserve: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: DEFAULT_CONTEXT_WINDOW,
            response_reserve: DEFAULT_RESPONSE_RESERVE,
        }
    }
}

impl ContextConfig {
    pub fn with_max_tokens(mut self, tokens: usize) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    pub fn with_response_reserve(mut self, tokens: usize) -> Self {
        self.response_reserve = tokens;
        self
    }

    /// Tokens available for context.
    pub fn effective_total(&self) -> usize {
        self.max_context_tokens.saturating_sub(self.response_reserve)
    }
}

/// What the model sees this turn.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedContext {
    pub components: Vec<ContextComponent>,
    /// Budget after compaction (if any ran).
    pub budget: ContextBudget,
    pub compaction: Option<CompactionResult>,
    /// Set when the context does not fit even after compaction.
    pub overflow: Option<ContextOverflow>,
}

impl PreparedContext {
    /// Render for a chat-style model.
    ///
    /// Text and structured components become sections of one leading system
    /// message, in component order. Message components contribute their
    /// messages verbatim, after the system message.
    pub fn to_messages(&self) -> Vec<Message> {
        let mut sections = Vec::new();
        let mut conversation = Vec::new();
        for component in &self.components {
            match &component.content {
                ComponentContent::Text(t) if !t.is_empty() => sections.push(t.clone()),
                ComponentContent::Text(_) => {}
                ComponentContent::Structured(v) => {
                    let body = serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string());
                    sections.push(format!("## {}\n{body}", component.name));
                }
                ComponentContent::Messages(m) => conversation.extend(m.iter().cloned()),
            }
        }
        let mut out = Vec::with_capacity(conversation.len() + 1);
        if !sections.is_empty() {
            out.push(Message::system(sections.join("\n\n")));
        }
        out.extend(conversation);
        out
    }
}

/// Serialized state of every plugin, keyed by plugin name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerState {
    pub plugins: BTreeMap<String, PluginState>,
}

/// Orchestrates plugins, compactors and the active strategy.
///
/// # Example
///
/// ```ignore
/// let manager = ContextManager::new(ContextConfig::default().with_max_tokens(32_000))
///     .with_plugin(InstructionsPlugin::new("Be concise."))
///     .with_plugin(ConversationPlugin::new(history.clone()))
///     .with_compactor(ConversationCompactor::default())
///     .with_strategy(LazyStrategy::default());
///
/// let prepared = manager.prepare();
/// println!("{}", prepared.budget.to_log_string());
/// ```
pub struct ContextManager {
    config: ContextConfig,
    plugins: Vec<Arc<dyn ContextPlugin>>,
    compactors: Vec<Arc<dyn Compactor>>,
    strategy: Arc<dyn CompactionStrategy>,
    estimator: Arc<dyn TokenEstimator>,
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager")
            .field("config", &self.config)
            .field(
                "plugins",
                &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field(
                "compactors",
                &self.compactors.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            plugins: Vec::new(),
            compactors: Vec::new(),
            strategy: Arc::new(ProactiveStrategy::default()),
            estimator: Arc::new(CharRatioEstimator::default()),
        }
    }

    pub fn with_plugin(mut self, plugin: impl ContextPlugin + 'static) -> Self {
        self.add_plugin(Arc::new(plugin));
        self
    }

    /// Register a shared plugin. A plugin with the same name is replaced in
    /// place, keeping its registration slot.
    pub fn add_plugin(&mut self, plugin: Arc<dyn ContextPlugin>) {
        match self.plugins.iter().position(|p| p.name() == plugin.name()) {
            Some(i) => self.plugins[i] = plugin,
            None => self.plugins.push(plugin),
        }
    }

    pub fn with_compactor(mut self, compactor: impl Compactor + 'static) -> Self {
        self.compactors.push(Arc::new(compactor));
        self
    }

    pub fn with_strategy(mut self, strategy: impl CompactionStrategy + 'static) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    pub fn with_shared_strategy(mut self, strategy: Arc<dyn CompactionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_estimator(mut self, estimator: impl TokenEstimator + 'static) -> Self {
        self.estimator = Arc::new(estimator);
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn strategy(&self) -> &dyn CompactionStrategy {
        self.strategy.as_ref()
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Assemble this turn's context.
    pub fn prepare(&self) -> PreparedContext {
        let (components, owners) = self.collect();
        let total = self.config.effective_total();
        let thresholds = self.strategy.thresholds();
        let initial = ContextBudget::compute(total, sum_tokens(&components), &thresholds);
        debug!("[context] assembled {} component(s): {}", components.len(), initial.to_log_string());

        if !self.strategy.should_compact(&initial, &components) {
            self.strategy.record_turn(&initial, false);
            return PreparedContext {
                overflow: overflow_of(&initial, None),
                components,
                budget: initial,
                compaction: None,
            };
        }

        let ctx = CompactionContext {
            budget: &initial,
            compactors: &self.compactors,
            owners: &owners,
            estimator: self.estimator.as_ref(),
        };
        let result = self.strategy.compact(components, &ctx);
        let budget = ContextBudget::compute(total, sum_tokens(&result.components), &thresholds);

        for name in result.altered() {
            let Some(plugin) = owners.get(name) else {
                continue;
            };
            if let Some(component) = result.components.iter().find(|c| c.name == name)
                && !plugin.apply_compacted(component)
            {
                debug!("[context] plugin '{}' kept its own copy of '{name}'", plugin.name());
            }
            plugin.on_prepared(&budget);
        }

        info!(
            "[context] {} compaction freed {} tokens: {} -> {}",
            self.strategy.name(),
            result.tokens_freed,
            initial.used,
            budget.used
        );
        self.strategy.record_turn(&initial, true);

        PreparedContext {
            overflow: overflow_of(&budget, Some(&result)),
            components: result.components.clone(),
            budget,
            compaction: Some(result),
        }
    }

    /// Poll plugins in registration order. Failures are logged and the
    /// plugin's content is treated as absent for this turn.
    fn collect(&self) -> (Vec<ContextComponent>, HashMap<String, Arc<dyn ContextPlugin>>) {
        let mut components = Vec::with_capacity(self.plugins.len());
        let mut owners = HashMap::new();
        for plugin in &self.plugins {
            match plugin.get_component() {
                Ok(Some(component)) => {
                    let component = component.estimated(self.estimator.as_ref());
                    owners.insert(component.name.clone(), Arc::clone(plugin));
                    components.push(component);
                }
                Ok(None) => {}
                Err(e) => warn!("[context] plugin '{}' failed: {e}", plugin.name()),
            }
        }
        (components, owners)
    }

    pub fn get_state(&self) -> ManagerState {
        ManagerState {
            plugins: self
                .plugins
                .iter()
                .map(|p| (p.name().to_string(), p.get_state()))
                .collect(),
        }
    }

    /// Restore every plugin present in `state`. Plugins missing from the
    /// state are left untouched; entries for unknown plugins are ignored.
    pub fn restore_state(&self, state: &ManagerState) -> Result<(), AgentError> {
        for plugin in &self.plugins {
            if let Some(plugin_state) = state.plugins.get(plugin.name()) {
                plugin.restore_state(plugin_state)?;
            }
        }
        Ok(())
    }

    /// Release every plugin's resources.
    pub fn destroy(&self) {
        for plugin in &self.plugins {
            plugin.destroy();
        }
    }
}

fn sum_tokens(components: &[ContextComponent]) -> usize {
    components.iter().map(|c| c.token_estimate).sum()
}

/// Overflow when the context is over budget, or still critical after a
/// compaction that freed nothing.
fn overflow_of(budget: &ContextBudget, result: Option<&CompactionResult>) -> Option<ContextOverflow> {
    let stuck = result.is_some_and(|r| r.tokens_freed == 0)
        && budget.status == super::component::BudgetStatus::Critical;
    (budget.is_over() || stuck).then_some(ContextOverflow {
        used: budget.used,
        total: budget.total,
    })
}
