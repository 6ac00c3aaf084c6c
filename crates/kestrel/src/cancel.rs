//! Cancellation-aware waiting.
//!
//! Every suspension point in the runtime (model call, tool execution, hook
//! callback, backoff or poll timer) goes through [`await_or_cancel`] so a
//! single [`CancellationToken::cancel`] unblocks it.

use std::future::Future;
use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

/// Result of a wait that may have been interrupted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelAware<T> {
    Value(T),
    Cancelled,
}

impl<T> CancelAware<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CancelAware::Cancelled)
    }
}

/// Race `fut` against the token. Checks the token before polling so an
/// already-cancelled token never starts the work.
pub async fn await_or_cancel<T, F>(token: &CancellationToken, fut: F) -> CancelAware<T>
where
    F: Future<Output = T>,
{
    if token.is_cancelled() {
        return CancelAware::Cancelled;
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => CancelAware::Cancelled,
        value = fut => {
            // A value that races a cancel still counts as cancelled.
            if token.is_cancelled() {
                CancelAware::Cancelled
            } else {
                CancelAware::Value(value)
            }
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `true` when cancelled.
pub async fn sleep_or_cancel(token: &CancellationToken, delay: Duration) -> bool {
    await_or_cancel(token, tokio::time::sleep(delay))
        .await
        .is_cancelled()
}
