//! Compactors: strategy-agnostic shrinkers bound to a kind of component.
//!
//! A compactor claims components by type or name through
//! [`Compactor::can_compact`]. When several claim the same component the
//! first registered one wins.

use super::component::{ComponentContent, ContextComponent};
use super::estimator::TokenEstimator;
use super::history::{originating_call, summarize_args, turn_units};
use crate::{Message, MessageRole};
use tracing::trace;

/// Prefix used for cleared tool result placeholders.
///
/// Both the placeholder writer and the "already cleared?" check reference
/// this constant so they can't drift out of sync.
pub const EVICTED_PREFIX: &str = "[Cleared:";

pub trait Compactor: Send + Sync {
    fn name(&self) -> &str;

    fn can_compact(&self, component: &ContextComponent) -> bool;

    /// Return a copy of `component` shrunk toward `target_tokens`. The
    /// returned component keeps its name, priority and compactability.
    fn compact(
        &self,
        component: &ContextComponent,
        target_tokens: usize,
        estimator: &dyn TokenEstimator,
    ) -> ContextComponent;
}

// ── TruncatingCompactor ────────────────────────────────────────────

/// Keeps the head of text (or rendered structured) content and appends a
/// truncation notice.
#[derive(Debug, Clone, Default)]
pub struct TruncatingCompactor {
    only: Option<Vec<String>>,
}

impl TruncatingCompactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the compactor to components with these names.
    pub fn for_components<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            only: Some(names.into_iter().map(Into::into).collect()),
        }
    }
}

impl Compactor for TruncatingCompactor {
    fn name(&self) -> &str {
        "truncate"
    }

    fn can_compact(&self, component: &ContextComponent) -> bool {
        let kind_ok = matches!(
            component.content,
            ComponentContent::Text(_) | ComponentContent::Structured(_)
        );
        let name_ok = self
            .only
            .as_ref()
            .is_none_or(|names| names.iter().any(|n| *n == component.name));
        kind_ok && name_ok
    }

    fn compact(
        &self,
        component: &ContextComponent,
        target_tokens: usize,
        estimator: &dyn TokenEstimator,
    ) -> ContextComponent {
        let text = match &component.content {
            ComponentContent::Text(s) => s.clone(),
            ComponentContent::Structured(v) => {
                serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
            }
            ComponentContent::Messages(_) => return component.clone(),
        };
        if estimator.estimate(&text) <= target_tokens {
            return component.clone();
        }
        let truncated = truncate_to_tokens(&text, target_tokens, estimator);
        component
            .with_content(ComponentContent::Text(truncated))
            .estimated(estimator)
    }
}

/// Longest head of `text` that fits `target_tokens` together with the
/// truncation notice.
fn truncate_to_tokens(text: &str, target_tokens: usize, estimator: &dyn TokenEstimator) -> String {
    let notice = |kept: usize| format!("\n[truncated: kept {kept} of {} bytes]", text.len());
    if estimator.estimate(&notice(0)) > target_tokens {
        return String::new();
    }

    let (mut lo, mut hi) = (0usize, text.len());
    while lo < hi {
        let mid = floor_char_boundary(text, (lo + hi).div_ceil(2));
        if mid <= lo {
            break;
        }
        let head = text.get(..mid).unwrap_or_default();
        if estimator.estimate(&format!("{head}{}", notice(mid))) <= target_tokens {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    let kept = floor_char_boundary(text, lo);
    format!("{}{}", text.get(..kept).unwrap_or_default(), notice(kept))
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

// ── ConversationCompactor ──────────────────────────────────────────

/// Shrinks conversation transcripts in two phases.
///
/// 1. Old tool result bodies are replaced with one-line placeholders,
///    oldest first. The newest `keep_recent` messages are left alone.
/// 2. If that is not enough, whole turn units are dropped from the front.
///    The newest unit always survives.
///
/// Neither phase splits a tool call from its result.
#[derive(Debug, Clone)]
pub struct ConversationCompactor {
    keep_recent: usize,
}

impl Default for ConversationCompactor {
    fn default() -> Self {
        Self { keep_recent: 4 }
    }
}

impl ConversationCompactor {
    pub fn new(keep_recent: usize) -> Self {
        Self { keep_recent }
    }

    fn clear_old_results(
        &self,
        messages: &mut [Message],
        target_tokens: usize,
        estimator: &dyn TokenEstimator,
    ) {
        let protected_from = messages.len().saturating_sub(self.keep_recent);
        for i in 0..protected_from {
            if estimator.estimate_messages(messages) <= target_tokens {
                return;
            }
            if messages[i].role != MessageRole::Tool {
                continue;
            }
            let Some(content) = messages[i].content.as_deref() else {
                continue;
            };
            if content.starts_with(EVICTED_PREFIX) {
                continue;
            }
            let chars = content.chars().count();
            let placeholder = match originating_call(messages, i) {
                Some(call) => format!(
                    "{EVICTED_PREFIX} {}({}), {chars} chars]",
                    call.name(),
                    summarize_args(call.arguments()),
                ),
                None => format!("{EVICTED_PREFIX} tool result, {chars} chars]"),
            };
            if placeholder.len() >= content.len() {
                continue;
            }
            trace!("[compact] clearing tool result at index {i} ({chars} chars)");
            messages[i].content = Some(placeholder);
        }
    }
}

impl Compactor for ConversationCompactor {
    fn name(&self) -> &str {
        "conversation"
    }

    fn can_compact(&self, component: &ContextComponent) -> bool {
        matches!(component.content, ComponentContent::Messages(_))
    }

    fn compact(
        &self,
        component: &ContextComponent,
        target_tokens: usize,
        estimator: &dyn TokenEstimator,
    ) -> ContextComponent {
        let ComponentContent::Messages(original) = &component.content else {
            return component.clone();
        };
        let mut messages = original.clone();
        self.clear_old_results(&mut messages, target_tokens, estimator);

        while estimator.estimate_messages(&messages) > target_tokens {
            let units = turn_units(&messages);
            if units.len() <= 1 {
                break;
            }
            let drop = units[0].len();
            messages.drain(..drop);
        }

        component
            .with_content(ComponentContent::Messages(messages))
            .estimated(estimator)
    }
}
