//! The agent seam: one generation collaborator per phase.
//!
//! The coordinator assumes nothing about how content gets produced. Each
//! phase's work is delegated to an [`Agent`] implementation injected at
//! construction time, keyed by phase number in an [`AgentRegistry`]. Dispatch
//! is through the trait object only; there is no runtime inspection of the
//! agent beyond `process` and `validate`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Structured output produced by one phase's agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentOutput {
    /// The generated content, shape owned by the phase's agent
    pub content: Value,
    /// Free-form notes from the agent (reasoning summary, caveats)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl AgentOutput {
    /// Wrap a JSON value as an output with no notes.
    pub fn new(content: Value) -> Self {
        Self {
            content,
            notes: None,
        }
    }
}

/// Results of phases that already completed, keyed by phase number.
pub type PreviousResults = HashMap<u8, AgentOutput>;

/// A generation collaborator for one phase.
///
/// `process` may take arbitrarily long; the executor bounds it with a timeout
/// and retries transient failures, so implementations should just fail fast
/// with an error rather than retrying internally.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Generate this phase's output from the run input and upstream results.
    async fn process(
        &self,
        input: &Value,
        previous_results: &PreviousResults,
    ) -> anyhow::Result<AgentOutput>;

    /// Cheap structural sanity check on an output before scoring.
    fn validate(&self, output: &AgentOutput) -> bool {
        !output.content.is_null()
    }
}

/// Registry mapping each phase number to its agent.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<u8, Arc<dyn Agent>>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the agent for a phase, replacing any existing one.
    pub fn register(mut self, phase: u8, agent: Arc<dyn Agent>) -> Self {
        self.agents.insert(phase, agent);
        self
    }

    /// Look up the agent for a phase.
    pub fn get(&self, phase: u8) -> Option<Arc<dyn Agent>> {
        self.agents.get(&phase).cloned()
    }

    /// Phase numbers that have no registered agent.
    pub fn missing_phases(&self, phases: impl IntoIterator<Item = u8>) -> Vec<u8> {
        phases
            .into_iter()
            .filter(|p| !self.agents.contains_key(p))
            .collect()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut phases: Vec<&u8> = self.agents.keys().collect();
        phases.sort();
        f.debug_struct("AgentRegistry")
            .field("phases", &phases)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        async fn process(
            &self,
            input: &Value,
            _previous_results: &PreviousResults,
        ) -> anyhow::Result<AgentOutput> {
            Ok(AgentOutput::new(input.clone()))
        }
    }

    #[tokio::test]
    async fn test_registry_lookup_and_missing() {
        let registry = AgentRegistry::new().register(1, Arc::new(EchoAgent));

        assert!(registry.get(1).is_some());
        assert!(registry.get(2).is_none());
        assert_eq!(registry.missing_phases(1..=3), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_default_validate_rejects_null() {
        let agent = EchoAgent;
        let out = agent
            .process(&json!({"genre": "fantasy"}), &HashMap::new())
            .await
            .unwrap();
        assert!(agent.validate(&out));
        assert!(!agent.validate(&AgentOutput::new(Value::Null)));
    }
}
