//! File-backed runtime configuration.
//!
//! One JSON document configures the whole runtime. Every section is
//! optional and falls back to its defaults:
//!
//! ```json
//! {
//!   "harness": { "max_iterations": 40, "hook_timeout_ms": 2000,
//!                "retry": { "max_retries": 3, "backoff": { "initial_delay_ms": 250 } } },
//!   "context": { "max_context_tokens": 128000, "response_reserve": 8192 },
//!   "strategy": { "kind": "rolling_window", "max_messages": 60, "preserve_recent": 20 },
//!   "hooks": { "approve:tool": [{ "command": "./policy.sh" }] }
//! }
//! ```

use crate::agent::config::HarnessConfig;
use crate::agent::hooks::{HookConfig, HookManager};
use crate::context::{ContextConfig, ContextManager, StrategyKind};
use crate::error::AgentError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub harness: HarnessConfig,
    pub context: ContextConfig,
    pub strategy: StrategyKind,
    pub hooks: HookConfig,
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?;
        let config = Self::from_json(&contents)
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?;
        debug!("Loaded runtime config from {}", path.display());
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, AgentError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| AgentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the runtime misbehave rather than
    /// fail loudly.
    pub fn validate(&self) -> Result<(), AgentError> {
        let h = &self.harness;
        if h.max_iterations == 0 {
            return Err(AgentError::Config("harness.max_iterations must be at least 1".into()));
        }
        let backoff = &h.retry.backoff;
        if backoff.multiplier < 1.0 {
            return Err(AgentError::Config(
                "harness.retry.backoff.multiplier must be >= 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&backoff.jitter_factor) {
            return Err(AgentError::Config(
                "harness.retry.backoff.jitter_factor must be within 0.0..=1.0".into(),
            ));
        }
        if backoff.initial_delay > backoff.max_delay {
            return Err(AgentError::Config(
                "harness.retry.backoff.initial_delay_ms exceeds max_delay_ms".into(),
            ));
        }
        if h.circuit.failure_threshold == 0 || h.circuit.success_threshold == 0 {
            return Err(AgentError::Config(
                "harness.circuit thresholds must be at least 1".into(),
            ));
        }
        if self.context.effective_total() == 0 {
            return Err(AgentError::Config(
                "context.response_reserve leaves no room for context".into(),
            ));
        }
        match &self.strategy {
            StrategyKind::RollingWindow {
                max_messages,
                preserve_recent,
            } if preserve_recent > max_messages => Err(AgentError::Config(
                "strategy.preserve_recent exceeds max_messages".into(),
            )),
            StrategyKind::Adaptive { window: 0 } => {
                Err(AgentError::Config("strategy.window must be at least 1".into()))
            }
            _ => Ok(()),
        }
    }

    /// A manager with the configured window and strategy, and no plugins.
    pub fn context_manager(&self) -> ContextManager {
        ContextManager::new(self.context).with_shared_strategy(self.strategy.build())
    }

    /// Command hooks from the file, with the harness timeout and parallelism.
    pub fn hook_manager(&self, workdir: Option<&Path>) -> HookManager {
        HookManager::from_config(&self.hooks, workdir)
            .with_timeout(self.harness.hook_timeout)
            .with_parallel(self.harness.parallel_hooks)
    }
}

/// `Duration` as integer milliseconds.
pub mod serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    /// `Option<Duration>` as milliseconds or `null`.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::hooks::HookPoint;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn empty_document_is_all_defaults() {
        let config = RuntimeConfig::from_json("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn loads_every_section_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "harness": {{ "max_iterations": 40, "tool_timeout_ms": 1500,
                              "retry": {{ "max_retries": 4, "backoff": {{ "initial_delay_ms": 250 }} }},
                              "circuit": {{ "failure_threshold": 2 }} }},
                "context": {{ "max_context_tokens": 32000 }},
                "strategy": {{ "kind": "rolling_window", "max_messages": 60, "preserve_recent": 20 }},
                "hooks": {{ "approve:tool": [{{ "command": "./policy.sh", "matcher": "delete" }}] }}
            }}"#
        )
        .unwrap();

        let config = RuntimeConfig::load(file.path()).unwrap();
        assert_eq!(config.harness.max_iterations, 40);
        assert_eq!(config.harness.tool_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.harness.retry.max_retries, 4);
        assert_eq!(
            config.harness.retry.backoff.initial_delay,
            Duration::from_millis(250)
        );
        assert_eq!(config.harness.retry.backoff.multiplier, 2.0);
        assert_eq!(config.harness.circuit.failure_threshold, 2);
        assert_eq!(config.context.max_context_tokens, 32_000);
        assert_eq!(
            config.strategy,
            StrategyKind::RollingWindow {
                max_messages: 60,
                preserve_recent: 20
            }
        );
        assert_eq!(config.hooks.0[&HookPoint::ApproveTool].len(), 1);

        let manager = config.context_manager();
        assert_eq!(manager.strategy().name(), "rolling_window");
        assert!(config.hook_manager(None).has_hooks(HookPoint::ApproveTool));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for json in [
            r#"{"harness": {"max_iterations": 0}}"#,
            r#"{"harness": {"retry": {"backoff": {"multiplier": 0.5}}}}"#,
            r#"{"context": {"max_context_tokens": 100, "response_reserve": 100}}"#,
            r#"{"strategy": {"kind": "rolling_window", "max_messages": 5, "preserve_recent": 10}}"#,
            r#"{"strategy": {"kind": "nonsense"}}"#,
        ] {
            assert!(
                matches!(RuntimeConfig::from_json(json), Err(AgentError::Config(_))),
                "{json}"
            );
        }
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RuntimeConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, AgentError::Config(ref m) if m.contains("absent.json")));
    }

    #[test]
    fn millis_round_trip_through_json() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Timeouts {
            #[serde(with = "serde_millis")]
            fixed: Duration,
            #[serde(with = "serde_millis::option")]
            optional: Option<Duration>,
        }
        let t = Timeouts {
            fixed: Duration::from_millis(1_250),
            optional: None,
        };
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, r#"{"fixed":1250,"optional":null}"#);
        assert_eq!(serde_json::from_str::<Timeouts>(&json).unwrap(), t);
    }
}
