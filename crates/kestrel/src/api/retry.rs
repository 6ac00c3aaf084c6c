//! Exponential backoff with jitter, and cancellable retries.
//!
//! [`BackoffConfig`] is a pure calculator: the delay for an attempt depends
//! only on the attempt number and the config. [`retry_with_backoff`] retries
//! transient errors ([`AgentError::is_transient`]) and never retries
//! authentication, context-length or circuit-open failures.

use crate::cancel::{CancelAware, CancellationToken, await_or_cancel, sleep_or_cancel};
use crate::config::serde_millis;
use crate::error::AgentError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Delay schedule: `min(initial * multiplier^(attempt-1), max)`, optionally
/// perturbed uniformly within `± delay * jitter_factor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(rename = "initial_delay_ms", with = "serde_millis")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "serde_millis")]
    pub max_delay: Duration,
    /// Growth factor (2.0 doubles every attempt).
    pub multiplier: f64,
    pub jitter: bool,
    /// Fraction of the delay used as the jitter half-width.
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Clamped to `0.0..=1.0`; a non-finite factor disables jitter.
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = usable_jitter(factor);
        self
    }

    /// Deterministic delay for a 1-based attempt (0 is treated as 1).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else if capped > 0.0 {
            self.max_delay
        } else {
            Duration::ZERO
        }
    }

    /// Delay for an attempt, with jitter drawn from the thread RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::rng())
    }

    /// Delay for an attempt, with jitter drawn from `rng`.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        // Public field; may not have gone through the builder.
        let factor = usable_jitter(self.jitter_factor);
        if !self.jitter || factor <= 0.0 || base.is_zero() {
            return base;
        }
        let base_secs = base.as_secs_f64();
        let spread = base_secs * factor;
        let offset = rng.random_range(-spread..=spread);
        Duration::from_secs_f64((base_secs + offset).max(0.0))
    }

    /// Base delays for attempts `1..=attempts`.
    pub fn schedule(&self, attempts: u32) -> Vec<Duration> {
        (1..=attempts).map(|a| self.base_delay(a)).collect()
    }
}

fn usable_jitter(factor: f64) -> f64 {
    if factor.is_finite() {
        factor.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// How many times to retry transient failures, and how long to wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = fail on the first error).
    pub max_retries: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryConfig {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    pub fn none() -> Self {
        Self::with_retries(0)
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
///
/// `op` receives the 1-based attempt number. `on_retry` is called before
/// each backoff sleep with the failed attempt, its error and the delay.
/// Cancellation interrupts both the operation and the sleep.
pub async fn retry_with_backoff<T, F, Fut, R>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut op: F,
    mut on_retry: R,
) -> Result<T, AgentError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
    R: FnMut(u32, &AgentError, Duration),
{
    let mut attempt = 1;
    loop {
        let outcome = match await_or_cancel(cancel, op(attempt)).await {
            CancelAware::Cancelled => return Err(AgentError::Cancelled),
            CancelAware::Value(v) => v,
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt <= config.max_retries => {
                let delay = e
                    .retry_after()
                    .unwrap_or_else(|| config.backoff.delay(attempt));
                warn!(
                    "Attempt {attempt}/{} failed ({e}), retrying in {:.1}s",
                    config.max_retries + 1,
                    delay.as_secs_f64()
                );
                on_retry(attempt, &e, delay);
                if sleep_or_cancel(cancel, delay).await {
                    return Err(AgentError::Cancelled);
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(initial_ms: u64, max_ms: u64) -> BackoffConfig {
        BackoffConfig::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
        )
        .with_jitter(false)
    }

    #[test]
    fn base_delays_grow_and_cap() {
        let config = no_jitter(1000, 4000);
        let ms: Vec<u128> = config.schedule(4).iter().map(|d| d.as_millis()).collect();
        assert_eq!(ms, vec![1000, 2000, 4000, 4000]);
    }

    #[test]
    fn attempt_zero_is_first_attempt() {
        let config = no_jitter(250, 10_000);
        assert_eq!(config.base_delay(0), config.base_delay(1));
    }

    #[test]
    fn huge_attempts_stay_capped() {
        let config = no_jitter(1000, 4000);
        assert_eq!(config.base_delay(10_000), Duration::from_millis(4000));
    }

    #[test]
    fn jitter_stays_within_factor() {
        let config = no_jitter(1000, 4000)
            .with_jitter(true)
            .with_jitter_factor(0.1);
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=4 {
            let base = config.base_delay(attempt).as_secs_f64();
            for _ in 0..200 {
                let d = config.delay_with_rng(attempt, &mut rng).as_secs_f64();
                assert!(
                    (d - base).abs() <= base * 0.1 + 1e-9,
                    "attempt {attempt}: {d} outside ±10% of {base}"
                );
            }
        }
    }

    #[test]
    fn unusable_jitter_factors_do_not_panic() {
        let mut rng = StdRng::seed_from_u64(3);
        for factor in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut config = no_jitter(1000, 4000).with_jitter(true);
            config.jitter_factor = factor;
            assert_eq!(config.delay_with_rng(2, &mut rng), Duration::from_millis(2000));
            let built = no_jitter(1000, 4000).with_jitter(true).with_jitter_factor(factor);
            assert_eq!(built.jitter_factor, 0.0);
        }

        let wide = no_jitter(1000, 4000).with_jitter(true).with_jitter_factor(7.5);
        assert_eq!(wide.jitter_factor, 1.0);
        for _ in 0..100 {
            assert!(wide.delay_with_rng(1, &mut rng) <= Duration::from_millis(2000));
        }
    }

    #[test]
    fn config_reads_millis_from_json() {
        let config: BackoffConfig =
            serde_json::from_str(r#"{"initial_delay_ms": 100, "max_delay_ms": 900}"#).unwrap();
        assert_eq!(config.initial_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_millis(900));
        assert_eq!(config.multiplier, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let config = RetryConfig {
            max_retries: 3,
            backoff: no_jitter(100, 1000),
        };
        let result = retry_with_backoff(
            &config,
            &CancellationToken::new(),
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(AgentError::transient("503"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |attempt, _, delay| retries.push((attempt, delay)),
        )
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            retries,
            vec![
                (1, Duration::from_millis(100)),
                (2, Duration::from_millis(200))
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            &RetryConfig::with_retries(5),
            &CancellationToken::new(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AgentError::Authentication("bad key".into())) }
            },
            |_, _, _| {},
        )
        .await;
        assert!(matches!(result, Err(AgentError::Authentication(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            &RetryConfig::with_retries(2),
            &CancellationToken::new(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AgentError::transient("502")) }
            },
            |_, _, _| {},
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff_sleep() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        let config = RetryConfig {
            max_retries: 5,
            backoff: no_jitter(60_000, 60_000),
        };
        let result: Result<(), _> = retry_with_backoff(
            &config,
            &token,
            |_| async { Err(AgentError::transient("503")) },
            move |_, _, _| canceller.cancel(),
        )
        .await;
        assert_eq!(result, Err(AgentError::Cancelled));
    }
}
