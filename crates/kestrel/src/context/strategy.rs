//! Compaction strategies: when to compact and how hard.
//!
//! All strategies except [`RollingWindowStrategy`] share [`run_compaction`]
//! and differ only in their parameters:
//!
//! | Strategy | Trigger | Target utilization | Per-round size | Rounds |
//! |----------|---------|--------------------|----------------|--------|
//! | [`LazyStrategy`] | critical | 0.85 | 70% of original | 1 |
//! | [`ProactiveStrategy`] | warning or critical | 0.65 | 50%, -15pp per round, floor 10% | 3 |
//! | [`AggressiveStrategy`] | utilization >= 0.60 | 0.50 | 30%, halved per extra round | 2 |
//! | [`RollingWindowStrategy`] | message count over cap | n/a | newest N messages | 1 |
//! | [`AdaptiveStrategy`] | delegates | delegates | delegates | delegates |

use super::component::{
    BudgetStatus, CompactionAction, CompactionResult, ComponentContent, ContextBudget,
    ContextComponent, StatusThresholds,
};
use super::compactor::Compactor;
use super::estimator::TokenEstimator;
use super::history::retain_recent;
use super::plugin::ContextPlugin;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Everything a strategy needs besides the components themselves.
pub struct CompactionContext<'a> {
    pub budget: &'a ContextBudget,
    /// Registered compactors, in registration order.
    pub compactors: &'a [Arc<dyn Compactor>],
    /// Owning plugin for each component name (self-compaction fallback).
    pub owners: &'a HashMap<String, Arc<dyn ContextPlugin>>,
    pub estimator: &'a dyn TokenEstimator,
}

/// A policy deciding when to compact and how aggressively.
pub trait CompactionStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Utilization thresholds used to classify the budget.
    fn thresholds(&self) -> StatusThresholds {
        StatusThresholds::default()
    }

    fn should_compact(&self, budget: &ContextBudget, components: &[ContextComponent]) -> bool;

    /// Fraction of the budget the loop aims to get back under.
    fn target_utilization(&self) -> f64;

    /// Size to shrink a component to on `round` (1-based), given its size
    /// when compaction began.
    fn calculate_target_size(&self, original: usize, round: u32) -> usize;

    fn max_rounds(&self) -> u32;

    fn compact(
        &self,
        components: Vec<ContextComponent>,
        ctx: &CompactionContext<'_>,
    ) -> CompactionResult {
        run_compaction(self, components, ctx)
    }

    /// Feedback after each prepared turn. Only adaptive strategies care.
    fn record_turn(&self, budget: &ContextBudget, compacted: bool) {
        let _ = (budget, compacted);
    }
}

// ── Shared loop ────────────────────────────────────────────────────

/// The bounded multi-round compaction loop.
///
/// Components are visited in descending priority (ties keep registration
/// order). Each is offered to the first compactor that claims it, falling
/// back to the owning plugin's self-compaction. Non-compactable components
/// are never touched. The loop stops once enough tokens are freed or after
/// `max_rounds`.
pub fn run_compaction<S: CompactionStrategy + ?Sized>(
    strategy: &S,
    mut components: Vec<ContextComponent>,
    ctx: &CompactionContext<'_>,
) -> CompactionResult {
    let budget = ctx.budget;
    let floor = (budget.total as f64 * strategy.target_utilization()).floor() as usize;
    let tokens_to_free = budget.used.saturating_sub(floor);
    if tokens_to_free == 0 {
        return CompactionResult::unchanged(components);
    }

    let mut order: Vec<usize> = (0..components.len())
        .filter(|&i| components[i].compactable)
        .collect();
    // Stable: equal priorities keep registration order.
    order.sort_by_key(|&i| std::cmp::Reverse(components[i].priority));

    let originals: Vec<usize> = components.iter().map(|c| c.token_estimate).collect();
    let mut removed = vec![false; components.len()];
    let mut log = Vec::new();
    let mut tokens_freed = 0usize;
    let mut rounds = 0;

    'rounds: for round in 1..=strategy.max_rounds() {
        rounds = round;
        for &i in &order {
            if tokens_freed >= tokens_to_free {
                break 'rounds;
            }
            if removed[i] {
                continue;
            }
            let before = components[i].token_estimate;
            let target = strategy.calculate_target_size(originals[i], round);
            if before <= target {
                continue;
            }

            let name = components[i].name.clone();
            if let Some(compactor) = ctx.compactors.iter().find(|c| c.can_compact(&components[i]))
            {
                let mut shrunk = compactor.compact(&components[i], target, ctx.estimator);
                shrunk.refresh_estimate(ctx.estimator);
                let after = shrunk.token_estimate;
                if after >= before {
                    debug!("[compact] {} left '{name}' unchanged", compactor.name());
                    continue;
                }
                debug!(
                    "[compact] {} shrank '{name}' {before} -> {after} tokens (round {round})",
                    compactor.name()
                );
                tokens_freed += before - after;
                components[i] = shrunk;
                log.push(CompactionAction::Compacted {
                    component: name,
                    compactor: compactor.name().to_string(),
                    round,
                    before,
                    after,
                });
                continue;
            }

            let owner = ctx.owners.get(&name).filter(|p| p.is_compactable());
            let Some(plugin) = owner else {
                if round == 1 {
                    warn!("[compact] no compactor found for '{name}', skipping");
                    log.push(CompactionAction::NoCompactorFound {
                        component: name,
                        round,
                    });
                }
                continue;
            };

            plugin.compact(target, ctx.estimator);
            let after = match plugin.get_component() {
                Ok(Some(refreshed)) => {
                    let refreshed = refreshed.estimated(ctx.estimator);
                    let after = refreshed.token_estimate;
                    components[i] = refreshed;
                    after
                }
                Ok(None) => {
                    removed[i] = true;
                    0
                }
                Err(e) => {
                    warn!("[compact] '{name}' failed to report after self-compaction: {e}");
                    continue;
                }
            };
            if after >= before {
                continue;
            }
            debug!("[compact] '{name}' self-compacted {before} -> {after} tokens (round {round})");
            tokens_freed += before - after;
            log.push(CompactionAction::SelfCompacted {
                component: name,
                round,
                before,
                after,
            });
        }
    }

    let components = components
        .into_iter()
        .zip(removed)
        .filter_map(|(c, gone)| (!gone).then_some(c))
        .collect();

    info!(
        "[compact] {}: freed {tokens_freed}/{tokens_to_free} tokens in {rounds} round(s)",
        strategy.name()
    );

    CompactionResult {
        components,
        log,
        tokens_freed,
        tokens_to_free,
        rounds,
    }
}

fn percent_of(original: usize, percent: u32) -> usize {
    original * percent as usize / 100
}

// ── Lazy ───────────────────────────────────────────────────────────

/// Compacts only under critical pressure, and gently.
#[derive(Debug, Clone, Default)]
pub struct LazyStrategy {
    thresholds: StatusThresholds,
}

impl LazyStrategy {
    pub fn with_thresholds(mut self, thresholds: StatusThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }
}

impl CompactionStrategy for LazyStrategy {
    fn name(&self) -> &str {
        "lazy"
    }

    fn thresholds(&self) -> StatusThresholds {
        self.thresholds
    }

    fn should_compact(&self, budget: &ContextBudget, _: &[ContextComponent]) -> bool {
        budget.status == BudgetStatus::Critical
    }

    fn target_utilization(&self) -> f64 {
        0.85
    }

    fn calculate_target_size(&self, original: usize, _round: u32) -> usize {
        percent_of(original, 70)
    }

    fn max_rounds(&self) -> u32 {
        1
    }
}

// ── Proactive ──────────────────────────────────────────────────────

/// Starts compacting at the warning level and tightens every round.
#[derive(Debug, Clone, Default)]
pub struct ProactiveStrategy {
    thresholds: StatusThresholds,
}

impl ProactiveStrategy {
    pub fn with_thresholds(mut self, thresholds: StatusThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }
}

impl CompactionStrategy for ProactiveStrategy {
    fn name(&self) -> &str {
        "proactive"
    }

    fn thresholds(&self) -> StatusThresholds {
        self.thresholds
    }

    fn should_compact(&self, budget: &ContextBudget, _: &[ContextComponent]) -> bool {
        matches!(budget.status, BudgetStatus::Warning | BudgetStatus::Critical)
    }

    fn target_utilization(&self) -> f64 {
        0.65
    }

    fn calculate_target_size(&self, original: usize, round: u32) -> usize {
        let step = 15u32.saturating_mul(round.saturating_sub(1));
        let percent = 50u32.saturating_sub(step).max(10);
        percent_of(original, percent)
    }

    fn max_rounds(&self) -> u32 {
        3
    }
}

// ── Aggressive ─────────────────────────────────────────────────────

/// Keeps utilization low at the cost of detail.
#[derive(Debug, Clone)]
pub struct AggressiveStrategy {
    trigger: f64,
    max_rounds: u32,
}

impl Default for AggressiveStrategy {
    fn default() -> Self {
        Self {
            trigger: 0.60,
            max_rounds: 2,
        }
    }
}

impl AggressiveStrategy {
    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }
}

impl CompactionStrategy for AggressiveStrategy {
    fn name(&self) -> &str {
        "aggressive"
    }

    fn should_compact(&self, budget: &ContextBudget, _: &[ContextComponent]) -> bool {
        budget.utilization() >= self.trigger
    }

    fn target_utilization(&self) -> f64 {
        0.50
    }

    fn calculate_target_size(&self, original: usize, round: u32) -> usize {
        // 30%, then 15%, 7%... with a 5% floor.
        let mut percent = 30u32;
        for _ in 1..round {
            percent = (percent / 2).max(5);
        }
        percent_of(original, percent)
    }

    fn max_rounds(&self) -> u32 {
        self.max_rounds
    }
}

// ── Rolling window ─────────────────────────────────────────────────

/// Caps the number of conversation messages, keeping the newest ones.
///
/// Operates on message components only and never splits a tool call from
/// its result, so slightly fewer than `preserve_recent` messages may be
/// kept.
#[derive(Debug, Clone)]
pub struct RollingWindowStrategy {
    max_messages: usize,
    preserve_recent: usize,
}

impl Default for RollingWindowStrategy {
    fn default() -> Self {
        Self::new(50, 20)
    }
}

impl RollingWindowStrategy {
    /// `preserve_recent` is clamped to `max_messages`.
    pub fn new(max_messages: usize, preserve_recent: usize) -> Self {
        Self {
            max_messages,
            preserve_recent: preserve_recent.min(max_messages),
        }
    }

    fn message_count(components: &[ContextComponent]) -> usize {
        components.iter().map(|c| c.content.message_count()).sum()
    }
}

impl CompactionStrategy for RollingWindowStrategy {
    fn name(&self) -> &str {
        "rolling_window"
    }

    fn should_compact(&self, _: &ContextBudget, components: &[ContextComponent]) -> bool {
        Self::message_count(components) > self.max_messages
    }

    fn target_utilization(&self) -> f64 {
        1.0
    }

    fn calculate_target_size(&self, original: usize, _round: u32) -> usize {
        original
    }

    fn max_rounds(&self) -> u32 {
        1
    }

    fn compact(
        &self,
        mut components: Vec<ContextComponent>,
        ctx: &CompactionContext<'_>,
    ) -> CompactionResult {
        let mut log = Vec::new();
        let mut tokens_freed = 0;
        for component in components.iter_mut().filter(|c| c.compactable) {
            let ComponentContent::Messages(messages) = &component.content else {
                continue;
            };
            if messages.len() <= self.preserve_recent {
                continue;
            }
            let kept = retain_recent(messages, self.preserve_recent);
            let dropped = messages.len() - kept.len();
            if dropped == 0 {
                continue;
            }
            let before = component.token_estimate;
            *component = component
                .with_content(ComponentContent::Messages(kept))
                .estimated(ctx.estimator);
            let after = component.token_estimate;
            tokens_freed += before.saturating_sub(after);
            debug!(
                "[compact] rolling window dropped {dropped} message(s) from '{}'",
                component.name
            );
            log.push(CompactionAction::WindowTrimmed {
                component: component.name.clone(),
                dropped_messages: dropped,
                before,
                after,
            });
        }
        CompactionResult {
            components,
            log,
            tokens_freed,
            tokens_to_free: 0,
            rounds: 1,
        }
    }
}

// ── Adaptive ───────────────────────────────────────────────────────

/// Profile an [`AdaptiveStrategy`] is currently delegating to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptiveProfile {
    Lazy,
    Proactive,
    Aggressive,
}

#[derive(Debug)]
struct AdaptiveState {
    observations: VecDeque<(f64, bool)>,
    profile: AdaptiveProfile,
}

/// Switches between lazy, proactive and aggressive compaction based on a
/// rolling window of recent turns.
///
/// - compaction in at least half the observed turns: aggressive
/// - mean utilization under 50% and no compaction observed: lazy
/// - otherwise: proactive (also the starting profile)
pub struct AdaptiveStrategy {
    window: usize,
    min_observations: usize,
    lazy: LazyStrategy,
    proactive: ProactiveStrategy,
    aggressive: AggressiveStrategy,
    state: Mutex<AdaptiveState>,
}

impl Default for AdaptiveStrategy {
    fn default() -> Self {
        Self::new(10)
    }
}

impl AdaptiveStrategy {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            min_observations: 3.min(window),
            lazy: LazyStrategy::default(),
            proactive: ProactiveStrategy::default(),
            aggressive: AggressiveStrategy::default(),
            state: Mutex::new(AdaptiveState {
                observations: VecDeque::with_capacity(window),
                profile: AdaptiveProfile::Proactive,
            }),
        }
    }

    pub fn profile(&self) -> AdaptiveProfile {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .profile
    }

    fn active(&self) -> &dyn CompactionStrategy {
        match self.profile() {
            AdaptiveProfile::Lazy => &self.lazy,
            AdaptiveProfile::Proactive => &self.proactive,
            AdaptiveProfile::Aggressive => &self.aggressive,
        }
    }

    fn choose(observations: &VecDeque<(f64, bool)>) -> AdaptiveProfile {
        let n = observations.len() as f64;
        let compactions = observations.iter().filter(|(_, c)| *c).count();
        let mean_util = observations.iter().map(|(u, _)| u).sum::<f64>() / n;
        if compactions as f64 / n >= 0.5 {
            AdaptiveProfile::Aggressive
        } else if compactions == 0 && mean_util < 0.5 {
            AdaptiveProfile::Lazy
        } else {
            AdaptiveProfile::Proactive
        }
    }
}

impl CompactionStrategy for AdaptiveStrategy {
    fn name(&self) -> &str {
        "adaptive"
    }

    fn thresholds(&self) -> StatusThresholds {
        self.active().thresholds()
    }

    fn should_compact(&self, budget: &ContextBudget, components: &[ContextComponent]) -> bool {
        self.active().should_compact(budget, components)
    }

    fn target_utilization(&self) -> f64 {
        self.active().target_utilization()
    }

    fn calculate_target_size(&self, original: usize, round: u32) -> usize {
        self.active().calculate_target_size(original, round)
    }

    fn max_rounds(&self) -> u32 {
        self.active().max_rounds()
    }

    fn compact(
        &self,
        components: Vec<ContextComponent>,
        ctx: &CompactionContext<'_>,
    ) -> CompactionResult {
        self.active().compact(components, ctx)
    }

    fn record_turn(&self, budget: &ContextBudget, compacted: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.observations.len() == self.window {
            state.observations.pop_front();
        }
        state.observations.push_back((budget.utilization(), compacted));
        if state.observations.len() < self.min_observations {
            return;
        }
        let next = Self::choose(&state.observations);
        if next != state.profile {
            info!(
                "[compact] adaptive strategy switching {:?} -> {next:?}",
                state.profile
            );
            state.profile = next;
        }
    }
}

// ── Selection ──────────────────────────────────────────────────────

/// Strategy selection for configuration files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyKind {
    Lazy,
    #[default]
    Proactive,
    Aggressive,
    RollingWindow {
        max_messages: usize,
        preserve_recent: usize,
    },
    Adaptive {
        #[serde(default = "default_adaptive_window")]
        window: usize,
    },
}

fn default_adaptive_window() -> usize {
    10
}

impl StrategyKind {
    pub fn build(&self) -> Arc<dyn CompactionStrategy> {
        match self {
            StrategyKind::Lazy => Arc::new(LazyStrategy::default()),
            StrategyKind::Proactive => Arc::new(ProactiveStrategy::default()),
            StrategyKind::Aggressive => Arc::new(AggressiveStrategy::default()),
            StrategyKind::RollingWindow {
                max_messages,
                preserve_recent,
            } => Arc::new(RollingWindowStrategy::new(*max_messages, *preserve_recent)),
            StrategyKind::Adaptive { window } => Arc::new(AdaptiveStrategy::new(*window)),
        }
    }

    /// Parse a bare strategy name as used on the command line.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "lazy" => Some(StrategyKind::Lazy),
            "proactive" => Some(StrategyKind::Proactive),
            "aggressive" => Some(StrategyKind::Aggressive),
            "rolling_window" | "rolling-window" => Some(StrategyKind::RollingWindow {
                max_messages: 50,
                preserve_recent: 20,
            }),
            "adaptive" => Some(StrategyKind::Adaptive {
                window: default_adaptive_window(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::compactor::{ConversationCompactor, TruncatingCompactor};
    use crate::context::estimator::CharRatioEstimator;
    use crate::context::history::pairs_intact;
    use crate::context::plugins::MemoryPlugin;
    use crate::{Message, ToolCall};

    fn est() -> CharRatioEstimator {
        CharRatioEstimator::new(1.0)
    }

    fn text(name: &str, size: usize, priority: i32) -> ContextComponent {
        ContextComponent::text(name, "x".repeat(size))
            .with_priority(priority)
            .with_compactable(true)
            .estimated(&est())
    }

    fn budget_for(components: &[ContextComponent], total: usize) -> ContextBudget {
        let used = components.iter().map(|c| c.token_estimate).sum();
        ContextBudget::compute(total, used, &StatusThresholds::default())
    }

    fn run(
        strategy: &dyn CompactionStrategy,
        components: Vec<ContextComponent>,
        total: usize,
        compactors: &[Arc<dyn Compactor>],
        owners: &HashMap<String, Arc<dyn ContextPlugin>>,
    ) -> CompactionResult {
        let budget = budget_for(&components, total);
        let estimator = est();
        let ctx = CompactionContext {
            budget: &budget,
            compactors,
            owners,
            estimator: &estimator,
        };
        strategy.compact(components, &ctx)
    }

    fn truncator() -> Vec<Arc<dyn Compactor>> {
        vec![Arc::new(TruncatingCompactor::new())]
    }

    #[test]
    fn noop_when_under_target() {
        let components = vec![text("a", 100, 1)];
        let result = run(
            &ProactiveStrategy::default(),
            components.clone(),
            1000,
            &truncator(),
            &HashMap::new(),
        );
        assert_eq!(result.tokens_freed, 0);
        assert!(result.log.is_empty());
        assert_eq!(result.components, components);
    }

    #[test]
    fn non_compactable_components_untouched() {
        let pinned = ContextComponent::text("pinned", "p".repeat(900)).estimated(&est());
        let components = vec![pinned.clone(), text("a", 100, 1)];
        let result = run(
            &AggressiveStrategy::default(),
            components,
            1000,
            &truncator(),
            &HashMap::new(),
        );
        assert_eq!(result.components[0], pinned);
        assert!(result.log.iter().all(|a| a.component() != "pinned"));
    }

    #[test]
    fn higher_priority_compacted_first() {
        let components = vec![text("p3", 300, 3), text("p7", 300, 7), text("p1", 300, 1)];
        // Everything must shrink: 900 used against a 1000 budget, target 650.
        let result = run(
            &ProactiveStrategy::default(),
            components,
            1000,
            &truncator(),
            &HashMap::new(),
        );
        let order: Vec<&str> = result.log.iter().map(|a| a.component()).collect();
        assert_eq!(order, vec!["p7", "p3"]);
        assert!(result.tokens_freed >= result.tokens_to_free);
    }

    #[test]
    fn equal_priorities_keep_registration_order() {
        let components = vec![text("first", 400, 2), text("second", 400, 2)];
        let result = run(
            &AggressiveStrategy::default(),
            components,
            1000,
            &truncator(),
            &HashMap::new(),
        );
        assert_eq!(result.log[0].component(), "first");
    }

    #[test]
    fn tokens_freed_is_measured() {
        let components = vec![text("a", 950, 1)];
        let result = run(
            &LazyStrategy::default(),
            components,
            1000,
            &truncator(),
            &HashMap::new(),
        );
        let after = result.components[0].token_estimate;
        assert_eq!(result.tokens_freed, 950 - after);
        assert_eq!(result.log.iter().map(|a| a.freed()).sum::<usize>(), result.tokens_freed);
        assert_eq!(result.rounds, 1);
    }

    #[test]
    fn missing_compactor_is_logged_not_fatal() {
        let components = vec![text("orphan", 950, 1)];
        let result = run(
            &LazyStrategy::default(),
            components.clone(),
            1000,
            &[],
            &HashMap::new(),
        );
        assert_eq!(result.tokens_freed, 0);
        assert_eq!(
            result.log,
            vec![CompactionAction::NoCompactorFound {
                component: "orphan".into(),
                round: 1
            }]
        );
        assert_eq!(result.components, components);
    }

    #[test]
    fn falls_back_to_plugin_self_compaction() {
        let memory = Arc::new(MemoryPlugin::new());
        for i in 0..10 {
            memory.remember(format!("k{i}"), "v".repeat(90), i);
        }
        let component = memory.get_component().unwrap().unwrap().estimated(&est());
        let mut owners: HashMap<String, Arc<dyn ContextPlugin>> = HashMap::new();
        owners.insert("memory".into(), memory.clone());

        let result = run(&LazyStrategy::default(), vec![component], 1000, &[], &owners);
        assert!(matches!(
            result.log[0],
            CompactionAction::SelfCompacted { .. }
        ));
        assert!(result.tokens_freed > 0);
        assert!(memory.entries().len() < 10);
        // Lowest priorities go first.
        assert!(memory.entries().iter().all(|e| e.priority > 0));
    }

    #[test]
    fn proactive_tightens_per_round() {
        let s = ProactiveStrategy::default();
        assert_eq!(s.calculate_target_size(1000, 1), 500);
        assert_eq!(s.calculate_target_size(1000, 2), 350);
        assert_eq!(s.calculate_target_size(1000, 3), 200);
        assert_eq!(s.calculate_target_size(1000, 9), 100);
    }

    #[test]
    fn aggressive_and_lazy_parameters() {
        let a = AggressiveStrategy::default();
        assert_eq!(a.calculate_target_size(1000, 1), 300);
        assert_eq!(a.calculate_target_size(1000, 2), 150);
        assert_eq!(a.max_rounds(), 2);
        let budget = ContextBudget::compute(100, 60, &StatusThresholds::default());
        assert!(a.should_compact(&budget, &[]));
        assert!(!LazyStrategy::default().should_compact(&budget, &[]));

        let l = LazyStrategy::default();
        assert_eq!(l.calculate_target_size(1000, 1), 700);
        let critical = ContextBudget::compute(100, 95, &StatusThresholds::default());
        assert!(l.should_compact(&critical, &[]));
    }

    fn conversation(turns: usize) -> ContextComponent {
        let mut msgs = vec![Message::user("go")];
        for t in 0..turns {
            let id = format!("c{t}");
            msgs.push(Message::assistant_tool_calls(
                None,
                vec![ToolCall::new(&id, "step", "{}")],
            ));
            msgs.push(Message::tool_result(&id, "ok"));
        }
        ContextComponent::messages("conversation", msgs)
            .with_compactable(true)
            .estimated(&est())
    }

    #[test]
    fn rolling_window_keeps_recent_pairs() {
        let strategy = RollingWindowStrategy::new(10, 5);
        let components = vec![conversation(8)];
        let budget = budget_for(&components, 100_000);
        assert!(strategy.should_compact(&budget, &components));

        let result = run(&strategy, components, 100_000, &[], &HashMap::new());
        let ComponentContent::Messages(msgs) = &result.components[0].content else {
            panic!("expected messages");
        };
        assert_eq!(msgs.len(), 4);
        assert!(pairs_intact(msgs));
        assert!(result.tokens_freed > 0);
    }

    #[test]
    fn pair_integrity_survives_every_strategy() {
        let compactors: Vec<Arc<dyn Compactor>> = vec![Arc::new(ConversationCompactor::new(2))];
        let strategies: Vec<Box<dyn CompactionStrategy>> = vec![
            Box::new(LazyStrategy::default()),
            Box::new(ProactiveStrategy::default()),
            Box::new(AggressiveStrategy::default()),
        ];
        for strategy in strategies {
            let component = conversation(30);
            let total = component.token_estimate;
            let result = run(strategy.as_ref(), vec![component], total, &compactors, &HashMap::new());
            let ComponentContent::Messages(msgs) = &result.components[0].content else {
                panic!("expected messages");
            };
            assert!(pairs_intact(msgs), "{} split a pair", strategy.name());
        }
    }

    #[test]
    fn adaptive_moves_to_aggressive_under_sustained_pressure() {
        let adaptive = AdaptiveStrategy::new(4);
        assert_eq!(adaptive.profile(), AdaptiveProfile::Proactive);
        let hot = ContextBudget::compute(100, 85, &StatusThresholds::default());
        for _ in 0..3 {
            adaptive.record_turn(&hot, true);
        }
        assert_eq!(adaptive.profile(), AdaptiveProfile::Aggressive);
        assert_eq!(adaptive.target_utilization(), 0.50);
    }

    #[test]
    fn adaptive_relaxes_when_idle() {
        let adaptive = AdaptiveStrategy::new(4);
        let cool = ContextBudget::compute(100, 20, &StatusThresholds::default());
        for _ in 0..4 {
            adaptive.record_turn(&cool, false);
        }
        assert_eq!(adaptive.profile(), AdaptiveProfile::Lazy);
        assert_eq!(adaptive.max_rounds(), 1);
    }

    #[test]
    fn strategy_kind_parses_from_json() {
        let kind: StrategyKind =
            serde_json::from_str(r#"{"kind":"rolling_window","max_messages":40,"preserve_recent":10}"#)
                .unwrap();
        assert_eq!(kind.build().name(), "rolling_window");
        let adaptive: StrategyKind = serde_json::from_str(r#"{"kind":"adaptive"}"#).unwrap();
        assert_eq!(adaptive, StrategyKind::Adaptive { window: 10 });
        assert_eq!(StrategyKind::from_name("lazy"), Some(StrategyKind::Lazy));
        assert!(StrategyKind::from_name("bogus").is_none());
    }
}
