//! Per-run bookkeeping: phase nodes, timing, and the run summary.

use crate::agent::PreviousResults;
use crate::executor::PhaseOutcome;
use crate::phase::{PhaseSpec, PhaseStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// One phase's state within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseNode {
    pub spec: PhaseSpec,
    pub status: PhaseStatus,
    pub outcome: Option<PhaseOutcome>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PhaseNode {
    fn new(spec: PhaseSpec) -> Self {
        Self {
            spec,
            status: PhaseStatus::Pending,
            outcome: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = PhaseStatus::Running;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
    }

    pub(crate) fn mark_completed(&mut self, outcome: PhaseOutcome) {
        self.status = PhaseStatus::Completed;
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn mark_failed(&mut self, error: String) {
        self.status = PhaseStatus::Failed { error };
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn mark_cancelled(&mut self, reason: String) {
        self.status = PhaseStatus::Cancelled { reason };
        self.finished_at = Some(Utc::now());
    }

    /// Reset to pending, discarding any previous result. Used when an
    /// upstream regeneration invalidates this phase.
    pub(crate) fn reset(&mut self) {
        self.status = PhaseStatus::Pending;
        self.outcome = None;
        self.started_at = None;
        self.finished_at = None;
    }

    /// Wall time this phase ran for, if it started and finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// Lifecycle of a run as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Initializing,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// State of one pipeline run across all phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub session_id: String,
    /// The original request input, shared by every phase
    pub input: Value,
    pub status: RunStatus,
    /// Most recently dispatched phase; cleared when the run ends
    pub current_phase: Option<u8>,
    pub nodes: BTreeMap<u8, PhaseNode>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(session_id: &str, input: Value, phases: &[PhaseSpec]) -> Self {
        Self {
            session_id: session_id.to_string(),
            input,
            status: RunStatus::Initializing,
            current_phase: None,
            nodes: phases
                .iter()
                .map(|spec| (spec.number, PhaseNode::new(spec.clone())))
                .collect(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Numbers of phases that completed successfully.
    pub fn completed_set(&self) -> HashSet<u8> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.status.is_completed())
            .map(|(&n, _)| n)
            .collect()
    }

    /// Numbers of phases not yet completed, ascending.
    pub fn remaining(&self) -> Vec<u8> {
        self.nodes
            .iter()
            .filter(|(_, node)| !node.status.is_completed())
            .map(|(&n, _)| n)
            .collect()
    }

    /// Completed outputs keyed by phase number, for downstream agents.
    ///
    /// `exclude` keeps a phase's own stale output out of its regeneration
    /// context.
    pub fn previous_results(&self, exclude: Option<u8>) -> PreviousResults {
        self.nodes
            .iter()
            .filter(|&(&n, node)| Some(n) != exclude && node.status.is_completed())
            .filter_map(|(&n, node)| {
                node.outcome
                    .as_ref()
                    .map(|o| (n, o.output.clone()))
            })
            .collect()
    }

    pub fn all_completed(&self) -> bool {
        self.nodes.values().all(|n| n.status.is_completed())
    }

    pub(crate) fn note_phase_started(&mut self, phase: u8) {
        self.status = RunStatus::Running;
        self.current_phase = Some(phase);
    }

    pub(crate) fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.current_phase = None;
        self.finished_at = Some(Utc::now());
    }

    /// Build the summary for a finished run.
    pub fn summary(&self) -> RunSummary {
        let completed = self.completed_set();
        let mut degraded_phases = Vec::new();
        let mut quality_scores = BTreeMap::new();
        let mut cache_hits = 0;
        let mut phase_millis: i64 = 0;

        for (&number, node) in &self.nodes {
            if let Some(outcome) = &node.outcome {
                quality_scores.insert(number, outcome.quality.quality_score);
                if outcome.degraded {
                    degraded_phases.push(number);
                }
                if outcome.from_cache {
                    cache_hits += 1;
                }
            }
            if let Some(duration) = node.duration() {
                phase_millis += duration.num_milliseconds().max(0);
            }
        }

        let wall_millis = (self.finished_at.unwrap_or_else(Utc::now) - self.started_at)
            .num_milliseconds()
            .max(0);

        // Fraction of summed phase time saved by overlap: 0 for a strictly
        // serial run, approaching 1 the more phases ran concurrently.
        let parallel_efficiency = if phase_millis > 0 {
            (1.0 - wall_millis as f64 / phase_millis as f64).max(0.0)
        } else {
            0.0
        };

        RunSummary {
            session_id: self.session_id.clone(),
            total_phases: self.nodes.len(),
            completed_phases: completed.len(),
            degraded_phases,
            cache_hits,
            total_duration_ms: wall_millis as u64,
            parallel_efficiency,
            quality_scores,
        }
    }
}

/// Aggregate result of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub session_id: String,
    pub total_phases: usize,
    pub completed_phases: usize,
    /// Non-critical phases that finished below threshold
    pub degraded_phases: Vec<u8>,
    /// Phases served from the result cache
    pub cache_hits: usize,
    pub total_duration_ms: u64,
    /// Fraction of summed phase time saved by running phases concurrently;
    /// 0.0 for a strictly serial run
    pub parallel_efficiency: f64,
    /// Final quality score per phase
    pub quality_scores: BTreeMap<u8, f64>,
}

impl RunSummary {
    /// Completion as a percentage of all phases.
    pub fn completion_percent(&self) -> f64 {
        if self.total_phases == 0 {
            return 0.0;
        }
        100.0 * self.completed_phases as f64 / self.total_phases as f64
    }
}
