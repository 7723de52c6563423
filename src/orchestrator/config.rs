//! Declarative execution policy for the orchestrator.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// How steps within one operation are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One step at a time, in topological order.
    #[default]
    Sequential,
    /// Steps run concurrently as soon as their dependencies complete,
    /// bounded by `max_parallel`.
    ParallelByDependency,
}

/// Exponential backoff policy for retryable step failures.
///
/// Attempt 1 runs immediately; attempt n ≥ 2 is delayed by
/// `min(max_delay, initial_delay * multiplier^(n-2))`. A multiplier of
/// zero means zero-delay retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total invocations allowed, including the first. 1 means no retry.
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration, multiplier: f64) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self.multiplier = multiplier;
        self
    }
}

/// Orchestrator configuration. Unknown request parameters are accepted
/// and ignored; everything recognized is enumerated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub execution_mode: ExecutionMode,
    /// When false (the default) a failed step skips its dependents and
    /// fails the operation; when true, independent branches continue.
    pub continue_on_error: bool,
    /// Concurrency bound for `ParallelByDependency`.
    pub max_parallel: usize,
    #[serde(with = "duration_millis")]
    pub default_step_timeout: Duration,
    /// Hard per-step timeouts, overriding the default.
    #[serde(with = "duration_map_millis")]
    pub step_timeouts: HashMap<String, Duration>,
    pub retry: RetryPolicy,
    /// Arbitrary per-step configuration, surfaced to each step through
    /// its run context.
    pub step_configs: HashMap<String, serde_json::Value>,
    /// How many finished operations to keep for lookup.
    pub history_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Sequential,
            continue_on_error: false,
            max_parallel: 4,
            default_step_timeout: Duration::from_secs(30 * 60),
            step_timeouts: HashMap::new(),
            retry: RetryPolicy::default(),
            step_configs: HashMap::new(),
            history_limit: 50,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    pub fn with_step_timeout(mut self, step_id: impl Into<String>, timeout: Duration) -> Self {
        self.step_timeouts.insert(step_id.into(), timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_step_config(
        mut self,
        step_id: impl Into<String>,
        config: serde_json::Value,
    ) -> Self {
        self.step_configs.insert(step_id.into(), config);
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Effective timeout for a step.
    pub fn timeout_for(&self, step_id: &str) -> Duration {
        self.step_timeouts
            .get(step_id)
            .copied()
            .unwrap_or(self.default_step_timeout)
    }

    pub fn step_config(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.step_configs.get(step_id)
    }
}

/// Serde helpers: durations as integer milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod duration_map_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;
    use std::time::Duration;

    pub fn serialize<S>(
        map: &HashMap<String, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis: HashMap<&String, u64> = map
            .iter()
            .map(|(k, v)| (k, v.as_millis() as u64))
            .collect();
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = HashMap::<String, u64>::deserialize(deserializer)?;
        Ok(millis
            .into_iter()
            .map(|(k, v)| (k, Duration::from_millis(v)))
            .collect())
    }
}
