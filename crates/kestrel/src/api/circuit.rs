//! Per-dependency circuit breakers.
//!
//! | State     | Requests         | Leaves when                                   |
//! |-----------|------------------|-----------------------------------------------|
//! | Closed    | pass             | `failure_threshold` failures inside `window`  |
//! | Open      | rejected         | `reset_timeout` elapsed since last failure    |
//! | HalfOpen  | one trial at once| trial fails (Open) or enough succeed (Closed) |
//!
//! Time comes from [`tokio::time::Instant`] so tests can pause the clock.

use crate::config::serde_millis;
use crate::error::AgentError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// Rolling window in which failures are counted.
    #[serde(rename = "window_ms", with = "serde_millis")]
    pub window: Duration,
    /// Time after the last failure before a trial request is allowed.
    #[serde(rename = "reset_timeout_ms", with = "serde_millis")]
    pub reset_timeout: Duration,
    /// Trial successes needed in half-open before closing.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(300),
            reset_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// A state change, returned so callers can emit events for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub dependency: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Permission for one call, granted by [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permit {
    /// `Open -> HalfOpen` when this call became the trial request.
    pub transition: Option<Transition>,
    trial: bool,
}

impl Permit {
    /// Whether this call holds the half-open trial slot.
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    last_failure: Option<Instant>,
    half_open_successes: u32,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                last_failure: None,
                half_open_successes: 0,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose reset timeout has elapsed still
    /// reports `Open` until the next [`try_acquire`](Self::try_acquire).
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Failures currently counted inside the window.
    pub fn failure_count(&self) -> usize {
        let mut inner = self.lock();
        self.prune(&mut inner, Instant::now());
        inner.failures.len()
    }

    /// Ask permission to call the dependency.
    ///
    /// The permit carries the `Open -> HalfOpen` transition when this call
    /// becomes the trial request.
    pub fn try_acquire(&self) -> Result<Permit, AgentError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit {
                transition: None,
                trial: false,
            }),
            CircuitState::Open => {
                let ready = inner
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.config.reset_timeout);
                if !ready {
                    return Err(AgentError::CircuitOpen(self.name.clone()));
                }
                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
                inner.trial_in_flight = true;
                info!("[circuit] {}: open -> half_open", self.name);
                Ok(Permit {
                    transition: Some(self.transition(CircuitState::Open, CircuitState::HalfOpen)),
                    trial: true,
                })
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(AgentError::CircuitOpen(self.name.clone()));
                }
                inner.trial_in_flight = true;
                Ok(Permit {
                    transition: None,
                    trial: true,
                })
            }
        }
    }

    pub fn record_success(&self) -> Option<Transition> {
        let mut inner = self.lock();
        if inner.state != CircuitState::HalfOpen {
            return None;
        }
        inner.trial_in_flight = false;
        inner.half_open_successes += 1;
        if inner.half_open_successes < self.config.success_threshold {
            return None;
        }
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.half_open_successes = 0;
        info!("[circuit] {}: half_open -> closed", self.name);
        Some(self.transition(CircuitState::HalfOpen, CircuitState::Closed))
    }

    pub fn record_failure(&self) -> Option<Transition> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.last_failure = Some(now);
        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                self.prune(&mut inner, now);
                if inner.failures.len() < self.config.failure_threshold as usize {
                    return None;
                }
                inner.state = CircuitState::Open;
                warn!(
                    "[circuit] {}: closed -> open after {} failures",
                    self.name,
                    inner.failures.len()
                );
                Some(self.transition(CircuitState::Closed, CircuitState::Open))
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
                inner.half_open_successes = 0;
                warn!("[circuit] {}: trial failed, half_open -> open", self.name);
                Some(self.transition(CircuitState::HalfOpen, CircuitState::Open))
            }
            CircuitState::Open => None,
        }
    }

    /// Give back the trial slot held by `permit` without recording an
    /// outcome. Permits granted while closed hold no slot and are ignored.
    pub fn release(&self, permit: &Permit) {
        if !permit.trial {
            return;
        }
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        while let Some(&oldest) = inner.failures.front() {
            if now.saturating_duration_since(oldest) > self.config.window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> Transition {
        Transition {
            dependency: self.name.clone(),
            from,
            to,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Registry ───────────────────────────────────────────────────────

/// Lazily creates one breaker per dependency key.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Use a different config for one dependency.
    pub fn with_override(mut self, key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(key.into(), config);
        self
    }

    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                let config = self.overrides.get(key).unwrap_or(&self.config).clone();
                Arc::new(CircuitBreaker::new(key, config))
            })
            .clone()
    }

    /// Snapshot of every breaker created so far, sorted by key.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = breakers
            .iter()
            .map(|(k, b)| (k.clone(), b.state()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(10),
            success_threshold: 2,
        }
    }

    fn trip(breaker: &CircuitBreaker) -> Option<Transition> {
        let mut last = None;
        for _ in 0..breaker.config().failure_threshold {
            last = breaker.record_failure();
        }
        last
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold() {
        let breaker = CircuitBreaker::new("llm", config());
        assert!(breaker.record_failure().is_none());
        assert!(breaker.record_failure().is_none());
        let t = breaker.record_failure().expect("should open");
        assert_eq!((t.from, t.to), (CircuitState::Closed, CircuitState::Open));
        assert!(matches!(
            breaker.try_acquire(),
            Err(AgentError::CircuitOpen(name)) if name == "llm"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_outside_window_are_forgotten() {
        let breaker = CircuitBreaker::new("llm", config());
        breaker.record_failure();
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(breaker.record_failure().is_none());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_allows_single_trial() {
        let breaker = CircuitBreaker::new("llm", config());
        trip(&breaker);
        tokio::time::advance(Duration::from_secs(10)).await;

        let permit = breaker.try_acquire().unwrap();
        assert!(permit.is_trial());
        let t = permit.transition.expect("transition");
        assert_eq!(t.to, CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_err(), "second concurrent trial");

        assert!(breaker.record_success().is_none());
        assert!(breaker.try_acquire().unwrap().transition.is_none());
        let t = breaker.record_success().expect("closes");
        assert_eq!((t.from, t.to), (CircuitState::HalfOpen, CircuitState::Closed));
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let breaker = CircuitBreaker::new("llm", config());
        trip(&breaker);
        tokio::time::advance(Duration::from_secs(10)).await;
        breaker.try_acquire().unwrap();
        let t = breaker.record_failure().expect("reopens");
        assert_eq!(t.to, CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn release_frees_trial_slot() {
        let breaker = CircuitBreaker::new("llm", config());
        trip(&breaker);
        tokio::time::advance(Duration::from_secs(10)).await;
        let permit = breaker.try_acquire().unwrap();
        breaker.release(&permit);
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn releasing_a_closed_permit_keeps_someone_elses_trial() {
        let breaker = CircuitBreaker::new("llm", config());
        let early = breaker.try_acquire().unwrap();
        assert!(!early.is_trial());

        trip(&breaker);
        tokio::time::advance(Duration::from_secs(10)).await;
        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());

        breaker.release(&early);
        assert!(matches!(breaker.try_acquire(), Err(AgentError::CircuitOpen(_))));
        breaker.release(&trial);
        assert!(breaker.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn default_breaker_cycles_open_half_open_closed() {
        let breaker = CircuitBreaker::new("llm", CircuitBreakerConfig::default());
        for _ in 0..4 {
            assert!(breaker.record_failure().is_none());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        let t = breaker.record_failure().expect("fifth failure opens");
        assert_eq!((t.from, t.to), (CircuitState::Closed, CircuitState::Open));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(matches!(breaker.try_acquire(), Err(AgentError::CircuitOpen(_))));
        tokio::time::advance(Duration::from_secs(1)).await;
        let permit = breaker.try_acquire().unwrap();
        assert_eq!(
            permit.transition.map(|t| (t.from, t.to)),
            Some((CircuitState::Open, CircuitState::HalfOpen))
        );

        assert!(breaker.record_success().is_none());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.try_acquire().unwrap();
        let t = breaker.record_success().expect("second success closes");
        assert_eq!((t.from, t.to), (CircuitState::HalfOpen, CircuitState::Closed));
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_isolates_dependencies() {
        let registry = CircuitBreakerRegistry::new(config())
            .with_override("flaky", CircuitBreakerConfig {
                failure_threshold: 1,
                ..config()
            });
        registry.get("flaky").record_failure();
        registry.get("llm").record_failure();
        assert!(Arc::ptr_eq(&registry.get("llm"), &registry.get("llm")));
        assert_eq!(
            registry.states(),
            vec![
                ("flaky".to_string(), CircuitState::Open),
                ("llm".to_string(), CircuitState::Closed),
            ]
        );
    }
}
