//! Everything between the harness loop and a model backend.
//!
//! - [`client`]: the [`LlmClient`] contract and request/response types.
//! - [`retry`]: exponential backoff with jitter, and cancellable retries
//!   that only repeat transient errors.
//! - [`circuit`]: per-dependency circuit breakers so a failing backend is
//!   shed instead of hammered.

pub mod circuit;
pub mod client;
pub mod retry;

pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, Permit,
};
pub use client::{LlmClient, LlmFuture, ModelRequest, ModelResponse, UsageInfo};
pub use retry::{BackoffConfig, RetryConfig, retry_with_backoff};
