//! Built-in context plugins.
//!
//! | Plugin | Content | Compaction |
//! |--------|---------|------------|
//! | [`InstructionsPlugin`] | System instructions | Never |
//! | [`ConversationPlugin`] | Shared [`ConversationHistory`] | External compactors; accepts the result |
//! | [`MemoryPlugin`] | Keyed notes with priorities | Self-compacting |
//! | [`StaticPlugin`] | One fixed component | External compactors; accepts the result |

use super::component::{ComponentContent, ContextBudget, ContextComponent};
use super::estimator::TokenEstimator;
use super::plugin::{ContextPlugin, PluginState};
use crate::Message;
use crate::error::AgentError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

const STATE_VERSION: u32 = 1;

// ── InstructionsPlugin ─────────────────────────────────────────────

/// System instructions. Always present, never compacted.
pub struct InstructionsPlugin {
    text: Mutex<String>,
}

impl InstructionsPlugin {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Mutex::new(text.into()),
        }
    }

    /// Swap the instructions for subsequent turns.
    pub fn set(&self, text: impl Into<String>) {
        *self.text.lock().unwrap_or_else(PoisonError::into_inner) = text.into();
    }
}

impl ContextPlugin for InstructionsPlugin {
    fn name(&self) -> &str {
        "instructions"
    }

    fn get_component(&self) -> Result<Option<ContextComponent>, AgentError> {
        let text = self.text.lock().unwrap_or_else(PoisonError::into_inner);
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(ContextComponent::text("instructions", text.clone())))
    }

    fn get_state(&self) -> PluginState {
        let text = self.text.lock().unwrap_or_else(PoisonError::into_inner);
        PluginState::new(STATE_VERSION, serde_json::Value::String(text.clone()))
    }

    fn restore_state(&self, state: &PluginState) -> Result<(), AgentError> {
        let text: String = state.decode(self.name(), STATE_VERSION)?;
        self.set(text);
        Ok(())
    }
}

// ── ConversationHistory ────────────────────────────────────────────

/// Shared, append-mostly conversation transcript.
///
/// The [`Harness`](crate::agent::harness::Harness) appends to it and the
/// [`ConversationPlugin`] reads from it; clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: Arc::new(Mutex::new(messages)),
        }
    }

    pub fn push(&self, message: Message) {
        self.lock().push(message);
    }

    /// Append several messages under one lock so readers never observe a
    /// partial turn.
    pub fn extend(&self, messages: impl IntoIterator<Item = Message>) {
        self.lock().extend(messages);
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.lock().clone()
    }

    pub fn replace(&self, messages: Vec<Message>) {
        *self.lock() = messages;
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Message>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── ConversationPlugin ─────────────────────────────────────────────

/// Exposes the conversation transcript as a compactable message component.
pub struct ConversationPlugin {
    history: ConversationHistory,
    priority: i32,
}

impl ConversationPlugin {
    pub fn new(history: ConversationHistory) -> Self {
        Self {
            history,
            priority: 10,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl ContextPlugin for ConversationPlugin {
    fn name(&self) -> &str {
        "conversation"
    }

    fn get_component(&self) -> Result<Option<ContextComponent>, AgentError> {
        let messages = self.history.snapshot();
        if messages.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            ContextComponent::messages("conversation", messages)
                .with_priority(self.priority)
                .with_compactable(true),
        ))
    }

    fn apply_compacted(&self, component: &ContextComponent) -> bool {
        match &component.content {
            ComponentContent::Messages(messages) => {
                self.history.replace(messages.clone());
                true
            }
            _ => false,
        }
    }

    fn get_state(&self) -> PluginState {
        let data = serde_json::to_value(self.history.snapshot()).unwrap_or_default();
        PluginState::new(STATE_VERSION, data)
    }

    fn restore_state(&self, state: &PluginState) -> Result<(), AgentError> {
        let messages: Vec<Message> = state.decode(self.name(), STATE_VERSION)?;
        self.history.replace(messages);
        Ok(())
    }
}

// ── MemoryPlugin ───────────────────────────────────────────────────

/// One remembered fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub content: String,
    /// Higher survives longer under pressure.
    pub priority: i32,
    /// Insertion sequence; older entries are evicted first among equals.
    pub seq: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryStore {
    entries: Vec<MemoryEntry>,
    next_seq: u64,
}

/// Keyed in-context notes that shrink themselves under pressure.
///
/// Self-compaction evicts the lowest-priority entries first, oldest first
/// among equal priorities, until the rendered block fits the target.
#[derive(Default)]
pub struct MemoryPlugin {
    store: Mutex<MemoryStore>,
    evicted: AtomicUsize,
    last_budget: Mutex<Option<ContextBudget>>,
}

impl MemoryPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update an entry. Updating keeps the original sequence.
    pub fn remember(&self, key: impl Into<String>, content: impl Into<String>, priority: i32) {
        let key = key.into();
        let content = content.into();
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = store.entries.iter_mut().find(|e| e.key == key) {
            entry.content = content;
            entry.priority = priority;
            return;
        }
        let seq = store.next_seq;
        store.next_seq += 1;
        store.entries.push(MemoryEntry {
            key,
            content,
            priority,
            seq,
        });
    }

    pub fn forget(&self, key: &str) -> bool {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let before = store.entries.len();
        store.entries.retain(|e| e.key != key);
        store.entries.len() != before
    }

    pub fn entries(&self) -> Vec<MemoryEntry> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    /// Entries evicted by self-compaction over the plugin's lifetime.
    pub fn evicted_count(&self) -> usize {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Budget seen at the end of the last turn that changed this plugin.
    pub fn last_budget(&self) -> Option<ContextBudget> {
        *self.last_budget.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn render(entries: &[MemoryEntry]) -> String {
        entries
            .iter()
            .map(|e| format!("- {}: {}", e.key, e.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl ContextPlugin for MemoryPlugin {
    fn name(&self) -> &str {
        "memory"
    }

    fn get_component(&self) -> Result<Option<ContextComponent>, AgentError> {
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        if store.entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            ContextComponent::text("memory", Self::render(&store.entries))
                .with_priority(5)
                .with_compactable(true),
        ))
    }

    fn is_compactable(&self) -> bool {
        true
    }

    fn compact(&self, target_tokens: usize, estimator: &dyn TokenEstimator) -> usize {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let before = estimator.estimate(&Self::render(&store.entries));
        let mut current = before;
        while current > target_tokens && !store.entries.is_empty() {
            let victim = store
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| (e.priority, e.seq))
                .map(|(i, _)| i);
            let Some(index) = victim else { break };
            let removed = store.entries.remove(index);
            self.evicted.fetch_add(1, Ordering::Relaxed);
            debug!("[memory] evicted '{}' (priority {})", removed.key, removed.priority);
            current = estimator.estimate(&Self::render(&store.entries));
        }
        before.saturating_sub(current)
    }

    fn on_prepared(&self, budget: &ContextBudget) {
        *self.last_budget.lock().unwrap_or_else(PoisonError::into_inner) = Some(*budget);
    }

    fn get_state(&self) -> PluginState {
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        PluginState::new(
            STATE_VERSION,
            serde_json::to_value(&*store).unwrap_or_default(),
        )
    }

    fn restore_state(&self, state: &PluginState) -> Result<(), AgentError> {
        let restored: MemoryStore = state.decode(self.name(), STATE_VERSION)?;
        *self.store.lock().unwrap_or_else(PoisonError::into_inner) = restored;
        Ok(())
    }
}

// ── StaticPlugin ───────────────────────────────────────────────────

/// Supplies one fixed component (documents, tool catalogues, fixtures).
pub struct StaticPlugin {
    name: String,
    component: Mutex<ContextComponent>,
}

impl StaticPlugin {
    pub fn new(component: ContextComponent) -> Self {
        Self {
            name: component.name.clone(),
            component: Mutex::new(component),
        }
    }

    pub fn component(&self) -> ContextComponent {
        self.component
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ContextPlugin for StaticPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_component(&self) -> Result<Option<ContextComponent>, AgentError> {
        Ok(Some(self.component()))
    }

    fn apply_compacted(&self, component: &ContextComponent) -> bool {
        *self.component.lock().unwrap_or_else(PoisonError::into_inner) = component.clone();
        true
    }

    fn get_state(&self) -> PluginState {
        PluginState::new(
            STATE_VERSION,
            serde_json::to_value(self.component()).unwrap_or_default(),
        )
    }

    fn restore_state(&self, state: &PluginState) -> Result<(), AgentError> {
        let component: ContextComponent = state.decode(&self.name, STATE_VERSION)?;
        *self.component.lock().unwrap_or_else(PoisonError::into_inner) = component;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::estimator::CharRatioEstimator;

    #[test]
    fn instructions_are_never_compactable() {
        let plugin = InstructionsPlugin::new("Be brief.");
        let c = plugin.get_component().unwrap().unwrap();
        assert!(!c.compactable);
        assert!(!plugin.is_compactable());

        plugin.set("");
        assert!(plugin.get_component().unwrap().is_none());
    }

    #[test]
    fn conversation_shares_history_handle() {
        let history = ConversationHistory::new();
        let plugin = ConversationPlugin::new(history.clone());
        assert!(plugin.get_component().unwrap().is_none());

        history.push(Message::user("hi"));
        let c = plugin.get_component().unwrap().unwrap();
        assert_eq!(c.content.message_count(), 1);
        assert!(c.compactable);

        let shrunk = c.with_content(ComponentContent::Messages(vec![]));
        assert!(plugin.apply_compacted(&shrunk));
        assert!(history.is_empty());
    }

    #[test]
    fn conversation_state_round_trip() {
        let history = ConversationHistory::from_messages(vec![
            Message::user("one"),
            Message::assistant_text("two"),
        ]);
        let plugin = ConversationPlugin::new(history.clone());
        let before = plugin.get_component().unwrap();
        let state = plugin.get_state();

        history.replace(vec![]);
        plugin.restore_state(&state).unwrap();
        assert_eq!(plugin.get_component().unwrap(), before);
    }

    #[test]
    fn memory_evicts_lowest_priority_then_oldest() {
        let memory = MemoryPlugin::new();
        memory.remember("a", "x".repeat(20), 1);
        memory.remember("b", "y".repeat(20), 5);
        memory.remember("c", "z".repeat(20), 1);

        let est = CharRatioEstimator::new(1.0);
        let before = est.estimate(&MemoryPlugin::render(&memory.entries()));
        // Enough room for two entries.
        let freed = memory.compact(before - 10, &est);
        assert!(freed > 0);

        let keys: Vec<String> = memory.entries().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert_eq!(memory.evicted_count(), 1);
    }

    #[test]
    fn memory_update_keeps_position() {
        let memory = MemoryPlugin::new();
        memory.remember("a", "first", 1);
        memory.remember("b", "second", 1);
        memory.remember("a", "updated", 3);
        let entries = memory.entries();
        assert_eq!(entries[0].key, "a");
        assert_eq!(entries[0].content, "updated");
        assert_eq!(entries[0].priority, 3);
        assert!(memory.forget("b"));
        assert!(!memory.forget("b"));
    }

    #[test]
    fn memory_state_round_trip() {
        let memory = MemoryPlugin::new();
        memory.remember("k", "v", 2);
        let before = memory.get_component().unwrap();
        let state = memory.get_state();

        let restored = MemoryPlugin::new();
        restored.restore_state(&state).unwrap();
        assert_eq!(restored.get_component().unwrap(), before);

        // Sequence numbering continues after restore.
        restored.remember("k2", "v2", 2);
        assert_eq!(restored.entries()[1].seq, 1);
    }

    #[test]
    fn static_plugin_persists_compacted_content() {
        let plugin = StaticPlugin::new(ContextComponent::text("doc", "long text"));
        let shrunk = ContextComponent::text("doc", "short");
        assert!(plugin.apply_compacted(&shrunk));
        assert_eq!(plugin.component().content, ComponentContent::Text("short".into()));
    }
}
