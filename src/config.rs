//! Configuration for the pipeline coordinator.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum phases to run in parallel
    pub max_parallel_phases: usize,
    /// Default timeout for one agent invocation
    #[serde(with = "duration_secs")]
    pub agent_timeout: Duration,
    /// Maximum retry attempts per phase after agent or quality failures
    pub max_retries: u32,
    /// Base delay between retries, scaled linearly by attempt number
    #[serde(with = "duration_secs")]
    pub retry_base_delay: Duration,
    /// Phases whose failure aborts the whole run
    pub critical_phases: HashSet<u8>,
    /// How long a human review waits for feedback before timing out
    #[serde(with = "duration_secs")]
    pub feedback_timeout: Duration,
    /// Maximum modification rounds per review session
    pub max_hitl_iterations: u32,
    /// Age beyond which the staleness sweep removes review sessions
    #[serde(with = "duration_secs")]
    pub stale_session_age: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_parallel_phases: 3,
            agent_timeout: Duration::from_secs(120),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(2),
            // Plot structure and draft composition block everything downstream
            critical_phases: HashSet::from([4, 5]),
            feedback_timeout: Duration::from_secs(30 * 60),
            max_hitl_iterations: 3,
            stale_session_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl PipelineConfig {
    /// Set the parallelism bound.
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel_phases = max;
        self
    }

    /// Set the default agent timeout.
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the base retry delay.
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Replace the set of critical phases.
    pub fn with_critical_phases(mut self, phases: impl IntoIterator<Item = u8>) -> Self {
        self.critical_phases = phases.into_iter().collect();
        self
    }

    /// Set the human feedback timeout.
    pub fn with_feedback_timeout(mut self, timeout: Duration) -> Self {
        self.feedback_timeout = timeout;
        self
    }

    /// Set the maximum modification rounds per review session.
    pub fn with_max_hitl_iterations(mut self, max: u32) -> Self {
        self.max_hitl_iterations = max;
        self
    }

    /// Check whether a phase is critical in this deployment.
    pub fn is_critical(&self, phase: u8) -> bool {
        self.critical_phases.contains(&phase)
    }
}

/// Serde helpers for Duration as whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_parallel_phases, 3);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_delay, Duration::from_secs(2));
        assert_eq!(config.feedback_timeout, Duration::from_secs(1800));
        assert_eq!(config.max_hitl_iterations, 3);
        assert!(config.is_critical(4));
        assert!(config.is_critical(5));
        assert!(!config.is_critical(7));
    }

    #[test]
    fn test_builders() {
        let config = PipelineConfig::default()
            .with_max_parallel(2)
            .with_critical_phases([7])
            .with_max_retries(1);
        assert_eq!(config.max_parallel_phases, 2);
        assert!(config.is_critical(7));
        assert!(!config.is_critical(4));
        assert_eq!(config.max_retries, 1);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = PipelineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.agent_timeout, config.agent_timeout);
        assert_eq!(back.critical_phases, config.critical_phases);
    }
}
