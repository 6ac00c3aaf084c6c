//! Tool call / result pair integrity.
//!
//! An assistant message carrying tool calls and the tool messages answering
//! those calls form one *turn unit*. Anything that removes history removes
//! whole units, so a call never survives without its result and a result
//! never survives without its call.

use crate::{Message, MessageRole, ToolCall};
use std::collections::HashSet;
use std::ops::Range;

/// Split `messages` into contiguous turn units.
///
/// A message with tool calls absorbs the tool results that immediately
/// follow it and answer one of its calls. Every other message is its own
/// unit.
pub fn turn_units(messages: &[Message]) -> Vec<Range<usize>> {
    let mut units = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let msg = &messages[i];
        let mut end = i + 1;
        if msg.has_tool_calls() {
            let ids: HashSet<&str> = msg.calls().iter().map(|c| c.id.as_str()).collect();
            while end < messages.len()
                && messages[end].role == MessageRole::Tool
                && messages[end]
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| ids.contains(id))
            {
                end += 1;
            }
        }
        units.push(i..end);
        i = end;
    }
    units
}

/// Keep the newest whole units that fit in `max_messages`.
///
/// If even the newest unit is larger than the cap it is kept whole.
pub fn retain_recent(messages: &[Message], max_messages: usize) -> Vec<Message> {
    if messages.len() <= max_messages {
        return messages.to_vec();
    }
    let units = turn_units(messages);
    let mut start = messages.len();
    let mut kept = 0;
    for unit in units.iter().rev() {
        if kept + unit.len() > max_messages {
            break;
        }
        kept += unit.len();
        start = unit.start;
    }
    if kept == 0
        && let Some(last) = units.last()
    {
        start = last.start;
    }
    messages[start..].to_vec()
}

/// Whether every tool call has exactly one result and every result answers
/// an earlier call.
pub fn pairs_intact(messages: &[Message]) -> bool {
    let mut open: HashSet<&str> = HashSet::new();
    for msg in messages {
        for call in msg.calls() {
            open.insert(call.id.as_str());
        }
        if msg.role == MessageRole::Tool {
            match msg.tool_call_id.as_deref() {
                Some(id) if open.remove(id) => {}
                _ => return false,
            }
        }
    }
    open.is_empty()
}

/// Find the call that produced the tool result at `index`.
pub fn originating_call(messages: &[Message], index: usize) -> Option<&ToolCall> {
    let id = messages.get(index)?.tool_call_id.as_deref()?;
    messages[..index]
        .iter()
        .rev()
        .flat_map(|m| m.calls())
        .find(|c| c.id == id)
}

/// Short human-readable summary of tool arguments for placeholders.
///
/// Objects render as `key=value` pairs (values clipped), anything else as a
/// clipped raw string.
pub fn summarize_args(arguments: &str) -> String {
    const MAX_VALUE: usize = 40;
    let clip = |s: &str| -> String {
        if s.chars().count() > MAX_VALUE {
            let head: String = s.chars().take(MAX_VALUE).collect();
            format!("{head}...")
        } else {
            s.to_string()
        }
    };
    match serde_json::from_str::<serde_json::Value>(arguments) {
        Ok(serde_json::Value::Object(map)) => map
            .iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => format!("{k}={}", clip(s)),
                other => format!("{k}={}", clip(&other.to_string())),
            })
            .collect::<Vec<_>>()
            .join(", "),
        _ => clip(arguments),
    }
}
