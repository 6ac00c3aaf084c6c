//! Token estimation.
//!
//! The runtime never depends on a particular tokenizer. Everything that
//! prices content goes through the [`TokenEstimator`] trait; the default
//! [`CharRatioEstimator`] divides byte length by a chars-per-token ratio.

use crate::Message;
use serde_json::Value;

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; 3.5 sits in the middle.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Fixed per-message overhead for role and framing tokens.
pub const DEFAULT_MESSAGE_OVERHEAD: usize = 4;

/// Pure mapping from content to an approximate token count.
///
/// Implementations must be deterministic: the same input always yields the
/// same estimate, and the empty string costs zero.
pub trait TokenEstimator: Send + Sync {
    /// Estimate the tokens in a text fragment.
    fn estimate(&self, text: &str) -> usize;

    /// Estimate a structured value. Strings are priced as text; everything
    /// else is priced by its compact JSON rendering.
    fn estimate_value(&self, value: &Value) -> usize {
        match value {
            Value::String(s) => self.estimate(s),
            Value::Null => 0,
            other => self.estimate(&other.to_string()),
        }
    }

    /// Estimate a message list, including tool-call names and arguments.
    fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }

    fn estimate_message(&self, message: &Message) -> usize {
        let content = message.content.as_deref().map_or(0, |c| self.estimate(c));
        let calls: usize = message
            .calls()
            .iter()
            .map(|c| self.estimate(c.name()) + self.estimate(c.arguments()))
            .sum();
        DEFAULT_MESSAGE_OVERHEAD + content + calls
    }
}

/// Character-ratio estimator: `ceil(bytes / chars_per_token)`.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: f64,
}

impl CharRatioEstimator {
    /// Create an estimator with a calibrated ratio. Non-positive ratios fall
    /// back to [`DEFAULT_CHARS_PER_TOKEN`].
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    /// Approximate byte budget that fits in `tokens`.
    pub fn bytes_for_tokens(&self, tokens: usize) -> usize {
        (tokens as f64 * self.chars_per_token).floor() as usize
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.len() as f64 / self.chars_per_token).ceil() as usize
    }
}
