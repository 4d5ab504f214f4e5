//! Quality gate: automated scoring of phase outputs against thresholds.
//!
//! Every phase output receives a weighted score from three components:
//! content quality (phase-specific heuristics behind the [`ContentScorer`]
//! seam), format compliance, and structural completeness, combined as
//! `0.5*content + 0.3*format + 0.2*completeness` and clamped to [0, 1].
//! The score is compared against the phase's threshold and the decision is
//! recorded in an injected [`GateStore`] keyed by (session, phase).
//!
//! Manual overrides are an explicit escape hatch: they unblock downstream
//! phases regardless of score and are audit-logged with who, when, and why.

use crate::agent::AgentOutput;
use crate::phase::PhaseSpec;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

mod scorer;

pub use scorer::{ContentScorer, HeuristicScorer};

/// Component weights for the combined score.
const CONTENT_WEIGHT: f64 = 0.5;
const FORMAT_WEIGHT: f64 = 0.3;
const COMPLETENESS_WEIGHT: f64 = 0.2;

/// Gate decision for one (session, phase) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    /// Not yet evaluated
    #[default]
    Pending,
    /// Score met the threshold
    Passed,
    /// Score fell short of the threshold
    Failed,
    /// Manually approved despite the score
    OverrideApproved,
}

impl GateStatus {
    /// Whether downstream phases may consume the output.
    pub fn unblocks_downstream(&self) -> bool {
        matches!(self, Self::Passed | Self::OverrideApproved)
    }
}

/// The three score components before weighting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub content: f64,
    pub format: f64,
    pub completeness: f64,
}

impl ScoreComponents {
    /// Weighted combination, clamped to [0, 1].
    pub fn combined(&self) -> f64 {
        let score = CONTENT_WEIGHT * self.content
            + FORMAT_WEIGHT * self.format
            + COMPLETENESS_WEIGHT * self.completeness;
        score.clamp(0.0, 1.0)
    }
}

/// Audit trail for a manual override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideAudit {
    pub approver: String,
    pub reason: String,
    pub approved_at: DateTime<Utc>,
}

/// Recorded gate decision for one (session, phase) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateRecord {
    /// Combined weighted score, 0.0 to 1.0
    pub quality_score: f64,
    /// Threshold the score was compared against
    pub threshold: f64,
    /// Gate decision
    pub status: GateStatus,
    /// How many times this phase has been re-evaluated
    pub retry_count: u32,
    /// Retry budget the executor works with
    pub max_retries: u32,
    /// Critical phases block downstream work on failure
    pub is_critical_phase: bool,
    /// Raw component scores behind `quality_score`
    pub components: ScoreComponents,
    /// Present only after a manual override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_audit: Option<OverrideAudit>,
}

/// Store for gate records, keyed by (session, phase).
#[async_trait]
pub trait GateStore: Send + Sync {
    async fn get(&self, session_id: &str, phase: u8) -> Option<QualityGateRecord>;
    async fn put(&self, session_id: &str, phase: u8, record: QualityGateRecord);
}

/// In-memory gate store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryGateStore {
    records: RwLock<HashMap<(String, u8), QualityGateRecord>>,
}

impl MemoryGateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GateStore for MemoryGateStore {
    async fn get(&self, session_id: &str, phase: u8) -> Option<QualityGateRecord> {
        self.records
            .read()
            .await
            .get(&(session_id.to_string(), phase))
            .cloned()
    }

    async fn put(&self, session_id: &str, phase: u8, record: QualityGateRecord) {
        self.records
            .write()
            .await
            .insert((session_id.to_string(), phase), record);
    }
}

/// Scores phase outputs and records pass/fail decisions.
///
/// Stateless per call; all state lives in the injected store.
#[derive(Clone)]
pub struct QualityGateService {
    scorer: Arc<dyn ContentScorer>,
    store: Arc<dyn GateStore>,
}

impl QualityGateService {
    pub fn new(store: Arc<dyn GateStore>) -> Self {
        Self {
            scorer: Arc::new(HeuristicScorer),
            store,
        }
    }

    /// Replace the content scorer (e.g. with a model-judgment scorer).
    pub fn with_scorer(mut self, scorer: Arc<dyn ContentScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Score an output and record the decision.
    ///
    /// Re-evaluating an existing (session, phase) record increments its
    /// retry count; an approved override is sticky across re-evaluations.
    pub async fn evaluate(
        &self,
        session_id: &str,
        spec: &PhaseSpec,
        output: &AgentOutput,
        is_critical: bool,
        max_retries: u32,
    ) -> QualityGateRecord {
        let components = ScoreComponents {
            content: self.scorer.score_content(spec, output),
            format: score_format(&output.content),
            completeness: score_completeness(spec, &output.content),
        };
        let score = components.combined();

        let previous = self.store.get(session_id, spec.number).await;
        let retry_count = previous.as_ref().map_or(0, |r| r.retry_count + 1);
        let overridden = previous
            .as_ref()
            .is_some_and(|r| r.status == GateStatus::OverrideApproved);

        let status = if overridden {
            GateStatus::OverrideApproved
        } else if score >= spec.quality_threshold {
            GateStatus::Passed
        } else {
            GateStatus::Failed
        };

        let record = QualityGateRecord {
            quality_score: score,
            threshold: spec.quality_threshold,
            status,
            retry_count,
            max_retries,
            is_critical_phase: is_critical,
            components,
            override_audit: previous.and_then(|r| r.override_audit),
        };

        self.store.put(session_id, spec.number, record.clone()).await;
        record
    }

    /// Manually approve a failed gate, unblocking downstream phases.
    ///
    /// Requires an existing record (the phase must have been evaluated at
    /// least once). The override is audit-logged.
    pub async fn apply_override(
        &self,
        session_id: &str,
        phase: u8,
        approver: &str,
        reason: &str,
    ) -> anyhow::Result<QualityGateRecord> {
        let mut record = self
            .store
            .get(session_id, phase)
            .await
            .ok_or_else(|| {
                anyhow::anyhow!("no quality record for session {session_id} phase {phase}")
            })?;

        let audit = OverrideAudit {
            approver: approver.to_string(),
            reason: reason.to_string(),
            approved_at: Utc::now(),
        };

        warn!(
            session_id,
            phase,
            approver,
            reason,
            previous_score = record.quality_score,
            "quality gate manually overridden"
        );

        record.status = GateStatus::OverrideApproved;
        record.override_audit = Some(audit);
        self.store.put(session_id, phase, record.clone()).await;
        Ok(record)
    }

    /// Fetch the current record for a (session, phase) pair.
    pub async fn record(&self, session_id: &str, phase: u8) -> Option<QualityGateRecord> {
        self.store.get(session_id, phase).await
    }
}

/// Format compliance: the pipeline's phases exchange JSON objects.
fn score_format(content: &Value) -> f64 {
    match content {
        Value::Object(map) if !map.is_empty() => 1.0,
        Value::Object(_) => 0.2,
        Value::Null => 0.0,
        _ => 0.4,
    }
}

/// Structural completeness: required-field presence ratio.
fn score_completeness(spec: &PhaseSpec, content: &Value) -> f64 {
    if spec.required_fields.is_empty() {
        return 1.0;
    }
    let Value::Object(map) = content else {
        return 0.0;
    };
    let present = spec
        .required_fields
        .iter()
        .filter(|f| map.get(f.as_str()).is_some_and(|v| !v.is_null()))
        .count();
    present as f64 / spec.required_fields.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> PhaseSpec {
        PhaseSpec::new(1, "Concept analysis", vec![], 0.7, vec!["genre", "premise", "tone"])
    }

    fn gate() -> QualityGateService {
        QualityGateService::new(Arc::new(MemoryGateStore::new()))
    }

    #[test]
    fn test_weighted_combination_is_clamped() {
        let components = ScoreComponents {
            content: 1.0,
            format: 1.0,
            completeness: 1.0,
        };
        assert!((components.combined() - 1.0).abs() < 1e-9);

        let partial = ScoreComponents {
            content: 0.5,
            format: 1.0,
            completeness: 0.0,
        };
        assert!((partial.combined() - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_completeness_presence_ratio() {
        let spec = spec();
        let full = json!({"genre": "fantasy", "premise": "a dragon", "tone": "epic"});
        assert!((score_completeness(&spec, &full) - 1.0).abs() < 1e-9);

        let partial = json!({"genre": "fantasy", "premise": null});
        assert!((score_completeness(&spec, &partial) - 1.0 / 3.0).abs() < 1e-9);

        assert_eq!(score_completeness(&spec, &json!("not an object")), 0.0);
    }

    #[tokio::test]
    async fn test_evaluate_passes_complete_output() {
        let gate = gate();
        let output = AgentOutput::new(json!({
            "genre": "fantasy",
            "premise": "a reluctant dragon keeper uncovers a conspiracy",
            "tone": "epic but wry",
        }));

        let record = gate.evaluate("s1", &spec(), &output, false, 3).await;
        assert_eq!(record.status, GateStatus::Passed);
        assert_eq!(record.retry_count, 0);
        assert!(record.quality_score >= 0.7);
    }

    #[tokio::test]
    async fn test_evaluate_fails_sparse_output() {
        let gate = gate();
        let output = AgentOutput::new(json!({"genre": null}));

        let record = gate.evaluate("s1", &spec(), &output, true, 3).await;
        assert_eq!(record.status, GateStatus::Failed);
        assert!(record.is_critical_phase);
        assert!(record.quality_score < 0.7);
    }

    #[tokio::test]
    async fn test_retry_count_increments_on_reevaluation() {
        let gate = gate();
        let output = AgentOutput::new(json!({"genre": "fantasy"}));

        let first = gate.evaluate("s1", &spec(), &output, false, 3).await;
        let second = gate.evaluate("s1", &spec(), &output, false, 3).await;
        let third = gate.evaluate("s1", &spec(), &output, false, 3).await;

        assert_eq!(first.retry_count, 0);
        assert_eq!(second.retry_count, 1);
        assert_eq!(third.retry_count, 2);
    }

    #[tokio::test]
    async fn test_override_unblocks_and_is_sticky() {
        let gate = gate();
        let output = AgentOutput::new(json!({"genre": null}));

        let record = gate.evaluate("s1", &spec(), &output, true, 3).await;
        assert!(!record.status.unblocks_downstream());

        let record = gate
            .apply_override("s1", 1, "editor@example.com", "manual review passed")
            .await
            .unwrap();
        assert_eq!(record.status, GateStatus::OverrideApproved);
        assert!(record.status.unblocks_downstream());
        let audit = record.override_audit.as_ref().unwrap();
        assert_eq!(audit.approver, "editor@example.com");

        // Re-evaluation keeps the override
        let record = gate.evaluate("s1", &spec(), &output, true, 3).await;
        assert_eq!(record.status, GateStatus::OverrideApproved);
        assert!(record.override_audit.is_some());
    }

    #[tokio::test]
    async fn test_override_requires_existing_record() {
        let gate = gate();
        assert!(
            gate.apply_override("s1", 2, "editor", "nothing to override")
                .await
                .is_err()
        );
    }
}
