//! Context budgeting and compaction.
//!
//! Each turn the [`ContextManager`](manager::ContextManager) asks every
//! [`ContextPlugin`](plugin::ContextPlugin) for a component, prices it with
//! a [`TokenEstimator`](estimator::TokenEstimator), and lets the active
//! [`CompactionStrategy`](strategy::CompactionStrategy) decide whether to
//! shrink things with the registered [`Compactor`](compactor::Compactor)s.

pub mod compactor;
pub mod component;
pub mod estimator;
pub mod history;
pub mod manager;
pub mod plugin;
pub mod plugins;
pub mod strategy;

pub use compactor::{Compactor, ConversationCompactor, TruncatingCompactor};
pub use component::{
    BudgetStatus, CompactionAction, CompactionResult, ComponentContent, ContextBudget,
    ContextComponent, ContextOverflow, StatusThresholds,
};
pub use estimator::{CharRatioEstimator, DEFAULT_CHARS_PER_TOKEN, TokenEstimator};
pub use manager::{ContextConfig, ContextManager, ManagerState, PreparedContext};
pub use plugin::{ContextPlugin, PluginState};
pub use plugins::{
    ConversationHistory, ConversationPlugin, InstructionsPlugin, MemoryEntry, MemoryPlugin,
    StaticPlugin,
};
pub use strategy::{
    AdaptiveProfile, AdaptiveStrategy, AggressiveStrategy, CompactionStrategy, LazyStrategy,
    ProactiveStrategy, RollingWindowStrategy, StrategyKind,
};
