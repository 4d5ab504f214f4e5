//! Persistence seam for phase results and resumable pipeline state.
//!
//! The storage schema lives outside the core. The coordinator treats the
//! sink as at-least-once and keys every write by `(session_id, phase,
//! attempt)` so redelivered writes are idempotent. [`MemoryPersistence`] is
//! the reference implementation used by tests and embedders that do not need
//! durability.

use crate::agent::AgentOutput;
use crate::quality::QualityGateRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One durably recorded phase result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPhase {
    pub phase: u8,
    pub attempt: u32,
    pub output: AgentOutput,
    pub quality: QualityGateRecord,
}

/// Recoverable state of a previous run, keyed by phase number.
///
/// Only the latest attempt per phase is surfaced; earlier attempts remain in
/// the sink but are not needed to resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedRun {
    pub session_id: String,
    pub phases: HashMap<u8, PersistedPhase>,
}

/// Durable sink for phase results, consulted on restart to resume runs.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Record a phase result. Must be idempotent on (session, phase, attempt).
    async fn save_phase_result(
        &self,
        session_id: &str,
        phase: u8,
        attempt: u32,
        output: &AgentOutput,
        quality: &QualityGateRecord,
    ) -> anyhow::Result<()>;

    /// Load the recorded state of a session, if any exists.
    async fn load_pipeline_state(&self, session_id: &str) -> anyhow::Result<Option<PersistedRun>>;

    /// Record a review session state change. Optional for sinks that only
    /// care about phase results.
    async fn save_hitl_state(
        &self,
        _session_id: &str,
        _phase: u8,
        _state: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory persistence for tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct MemoryPersistence {
    runs: Arc<RwLock<HashMap<String, HashMap<(u8, u32), PersistedPhase>>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct (phase, attempt) records for a session.
    pub async fn record_count(&self, session_id: &str) -> usize {
        self.runs
            .read()
            .await
            .get(session_id)
            .map_or(0, |m| m.len())
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save_phase_result(
        &self,
        session_id: &str,
        phase: u8,
        attempt: u32,
        output: &AgentOutput,
        quality: &QualityGateRecord,
    ) -> anyhow::Result<()> {
        let mut runs = self.runs.write().await;
        runs.entry(session_id.to_string()).or_default().insert(
            (phase, attempt),
            PersistedPhase {
                phase,
                attempt,
                output: output.clone(),
                quality: quality.clone(),
            },
        );
        Ok(())
    }

    async fn load_pipeline_state(&self, session_id: &str) -> anyhow::Result<Option<PersistedRun>> {
        let runs = self.runs.read().await;
        let Some(records) = runs.get(session_id) else {
            return Ok(None);
        };

        let mut phases: HashMap<u8, PersistedPhase> = HashMap::new();
        for record in records.values() {
            let keep = phases
                .get(&record.phase)
                .is_none_or(|existing| record.attempt > existing.attempt);
            if keep {
                phases.insert(record.phase, record.clone());
            }
        }

        Ok(Some(PersistedRun {
            session_id: session_id.to_string(),
            phases,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::{GateStatus, QualityGateRecord};
    use serde_json::json;

    fn record(score: f64) -> QualityGateRecord {
        QualityGateRecord {
            quality_score: score,
            threshold: 0.7,
            status: GateStatus::Passed,
            retry_count: 0,
            max_retries: 3,
            is_critical_phase: false,
            components: Default::default(),
            override_audit: None,
        }
    }

    #[tokio::test]
    async fn test_save_is_idempotent_per_attempt() {
        let store = MemoryPersistence::new();
        let output = AgentOutput::new(json!({"genre": "fantasy"}));

        store
            .save_phase_result("s1", 1, 0, &output, &record(0.8))
            .await
            .unwrap();
        store
            .save_phase_result("s1", 1, 0, &output, &record(0.8))
            .await
            .unwrap();

        assert_eq!(store.record_count("s1").await, 1);
    }

    #[tokio::test]
    async fn test_load_surfaces_latest_attempt() {
        let store = MemoryPersistence::new();
        let first = AgentOutput::new(json!({"draft": 1}));
        let second = AgentOutput::new(json!({"draft": 2}));

        store
            .save_phase_result("s1", 5, 0, &first, &record(0.6))
            .await
            .unwrap();
        store
            .save_phase_result("s1", 5, 1, &second, &record(0.85))
            .await
            .unwrap();

        let run = store.load_pipeline_state("s1").await.unwrap().unwrap();
        assert_eq!(run.phases[&5].attempt, 1);
        assert_eq!(run.phases[&5].output, second);
    }

    #[tokio::test]
    async fn test_load_unknown_session_is_none() {
        let store = MemoryPersistence::new();
        assert!(store.load_pipeline_state("nope").await.unwrap().is_none());
    }
}
