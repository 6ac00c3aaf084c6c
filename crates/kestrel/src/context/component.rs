//! Context components, budget snapshots, and compaction results.

use super::estimator::TokenEstimator;
use crate::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Components ─────────────────────────────────────────────────────

/// Payload carried by a [`ContextComponent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ComponentContent {
    Text(String),
    Messages(Vec<Message>),
    Structured(Value),
}

impl ComponentContent {
    pub fn estimate(&self, estimator: &dyn TokenEstimator) -> usize {
        match self {
            ComponentContent::Text(s) => estimator.estimate(s),
            ComponentContent::Messages(m) => estimator.estimate_messages(m),
            ComponentContent::Structured(v) => estimator.estimate_value(v),
        }
    }

    /// Number of conversation messages (zero for text and structured content).
    pub fn message_count(&self) -> usize {
        match self {
            ComponentContent::Messages(m) => m.len(),
            _ => 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ComponentContent::Text(_) => "text",
            ComponentContent::Messages(_) => "messages",
            ComponentContent::Structured(_) => "structured",
        }
    }
}

/// A named, priced, priority-tagged unit of context.
///
/// Higher `priority` means "compact first". A component with
/// `compactable = false` is never touched by the compaction loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextComponent {
    pub name: String,
    pub content: ComponentContent,
    #[serde(default)]
    pub token_estimate: usize,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub compactable: bool,
}

impl ContextComponent {
    pub fn new(name: impl Into<String>, content: ComponentContent) -> Self {
        Self {
            name: name.into(),
            content,
            token_estimate: 0,
            priority: 0,
            compactable: false,
        }
    }

    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name, ComponentContent::Text(text.into()))
    }

    pub fn messages(name: impl Into<String>, messages: Vec<Message>) -> Self {
        Self::new(name, ComponentContent::Messages(messages))
    }

    pub fn structured(name: impl Into<String>, value: Value) -> Self {
        Self::new(name, ComponentContent::Structured(value))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_compactable(mut self, compactable: bool) -> Self {
        self.compactable = compactable;
        self
    }

    /// Replace the content, keeping name, priority and compactability.
    pub fn with_content(&self, content: ComponentContent) -> Self {
        Self {
            name: self.name.clone(),
            content,
            token_estimate: 0,
            priority: self.priority,
            compactable: self.compactable,
        }
    }

    /// Re-price the component with `estimator` (builder form).
    pub fn estimated(mut self, estimator: &dyn TokenEstimator) -> Self {
        self.refresh_estimate(estimator);
        self
    }

    pub fn refresh_estimate(&mut self, estimator: &dyn TokenEstimator) {
        self.token_estimate = self.content.estimate(estimator);
    }
}

// ── Budget ─────────────────────────────────────────────────────────

/// Pressure level for one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatus {
    Ok,
    Warning,
    Critical,
}

impl std::fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetStatus::Ok => write!(f, "ok"),
            BudgetStatus::Warning => write!(f, "warning"),
            BudgetStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Utilization ratios at which a budget changes status.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            warning: 0.70,
            critical: 0.90,
        }
    }
}

impl StatusThresholds {
    pub fn classify(&self, utilization: f64) -> BudgetStatus {
        if utilization >= self.critical {
            BudgetStatus::Critical
        } else if utilization >= self.warning {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Ok
        }
    }
}

/// Token accounting for one turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextBudget {
    /// Tokens available for context (window minus response reserve).
    pub total: usize,
    pub used: usize,
    pub remaining: usize,
    pub status: BudgetStatus,
}

impl ContextBudget {
    pub fn compute(total: usize, used: usize, thresholds: &StatusThresholds) -> Self {
        let utilization = utilization(used, total);
        Self {
            total,
            used,
            remaining: total.saturating_sub(used),
            status: thresholds.classify(utilization),
        }
    }

    /// `used / total`; a zero-sized budget counts as fully used.
    pub fn utilization(&self) -> f64 {
        utilization(self.used, self.total)
    }

    pub fn is_over(&self) -> bool {
        self.used > self.total
    }

    /// Format as a compact log string.
    pub fn to_log_string(&self) -> String {
        format!(
            "{}/{} tokens ({:.1}%, {})",
            self.used,
            self.total,
            self.utilization() * 100.0,
            self.status,
        )
    }
}

fn utilization(used: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        used as f64 / total as f64
    }
}

// ── Compaction results ─────────────────────────────────────────────

/// One step taken by the compaction loop, in the order it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CompactionAction {
    /// An external compactor shrank the component.
    Compacted {
        component: String,
        compactor: String,
        round: u32,
        before: usize,
        after: usize,
    },
    /// The owning plugin shrank its own content.
    SelfCompacted {
        component: String,
        round: u32,
        before: usize,
        after: usize,
    },
    /// Neither a compactor nor the owning plugin could shrink the component.
    NoCompactorFound { component: String, round: u32 },
    /// The rolling window dropped old messages.
    WindowTrimmed {
        component: String,
        dropped_messages: usize,
        before: usize,
        after: usize,
    },
}

impl CompactionAction {
    pub fn component(&self) -> &str {
        match self {
            CompactionAction::Compacted { component, .. }
            | CompactionAction::SelfCompacted { component, .. }
            | CompactionAction::NoCompactorFound { component, .. }
            | CompactionAction::WindowTrimmed { component, .. } => component,
        }
    }

    /// Tokens this step released (zero for skipped components).
    pub fn freed(&self) -> usize {
        match self {
            CompactionAction::Compacted { before, after, .. }
            | CompactionAction::SelfCompacted { before, after, .. }
            | CompactionAction::WindowTrimmed { before, after, .. } => {
                before.saturating_sub(*after)
            }
            CompactionAction::NoCompactorFound { .. } => 0,
        }
    }
}

/// Outcome of one compaction pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionResult {
    pub components: Vec<ContextComponent>,
    pub log: Vec<CompactionAction>,
    /// Sum of measured `before - after` over every touched component.
    pub tokens_freed: usize,
    /// Tokens the strategy aimed to release.
    pub tokens_to_free: usize,
    pub rounds: u32,
}

impl CompactionResult {
    /// A pass that changed nothing.
    pub fn unchanged(components: Vec<ContextComponent>) -> Self {
        Self {
            components,
            log: Vec::new(),
            tokens_freed: 0,
            tokens_to_free: 0,
            rounds: 0,
        }
    }

    /// Names of components whose content changed, in first-touch order.
    pub fn altered(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for action in &self.log {
            if action.freed() > 0 && !names.contains(&action.component()) {
                names.push(action.component());
            }
        }
        names
    }
}

/// Signal that the assembled context does not fit even after compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextOverflow {
    pub used: usize,
    pub total: usize,
}
