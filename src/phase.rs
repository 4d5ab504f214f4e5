//! Phase catalog for the content-generation pipeline.
//!
//! This module provides:
//! - `PhaseSpec` describing one of the seven fixed generation phases
//! - `PhaseStatus` for runtime tracking of a phase within a run
//! - `default_phases()` returning the fixed catalog with its dependency graph
//!
//! The graph shape is fixed: phase 1 roots the pipeline, phases 2 and 3 share
//! a parallel group, and every later phase depends on all earlier ones.

use serde::{Deserialize, Serialize};

/// Total number of phases in the pipeline.
pub const PHASE_COUNT: u8 = 7;

/// Static description of a single generation phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseSpec {
    /// Phase number, 1 through 7, unique
    pub number: u8,
    /// Human-readable name of the phase
    pub name: String,
    /// Phase numbers that must complete before this phase starts
    #[serde(default)]
    pub dependencies: Vec<u8>,
    /// Phases sharing a group id may run concurrently once ready
    #[serde(default)]
    pub parallel_group: Option<String>,
    /// Minimum quality score the phase's output must reach
    pub quality_threshold: f64,
    /// Fields the output object must contain for full completeness credit
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Whether a human review checkpoint follows this phase
    #[serde(default)]
    pub hitl_enabled: bool,
    /// Per-phase agent timeout override in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl PhaseSpec {
    /// Create a new phase spec with the given graph position.
    pub fn new(
        number: u8,
        name: &str,
        dependencies: Vec<u8>,
        quality_threshold: f64,
        required_fields: Vec<&str>,
    ) -> Self {
        Self {
            number,
            name: name.to_string(),
            dependencies,
            parallel_group: None,
            quality_threshold,
            required_fields: required_fields.into_iter().map(String::from).collect(),
            hitl_enabled: false,
            timeout_secs: None,
        }
    }

    /// Place this phase in a parallel execution group.
    pub fn with_parallel_group(mut self, group: &str) -> Self {
        self.parallel_group = Some(group.to_string());
        self
    }

    /// Enable the human review checkpoint after this phase.
    pub fn with_hitl(mut self, enabled: bool) -> Self {
        self.hitl_enabled = enabled;
        self
    }

    /// Override the agent timeout for this phase.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Status of a phase within one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum PhaseStatus {
    /// Phase has not started
    #[default]
    Pending,
    /// Phase is currently executing
    Running,
    /// Phase produced an accepted result
    Completed,
    /// Phase failed with an error
    Failed { error: String },
    /// Phase was cancelled before completing
    Cancelled { reason: String },
}

impl PhaseStatus {
    /// Check if the phase is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }

    /// Check if the phase completed successfully.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// The fixed seven-phase content-generation catalog.
///
/// Phases 2 and 3 (character development and world building) are independent
/// given phase 1 and share the `narrative-foundation` parallel group. The
/// final assembly phase carries the strictest quality threshold.
pub fn default_phases() -> Vec<PhaseSpec> {
    vec![
        PhaseSpec::new(
            1,
            "Concept analysis",
            vec![],
            0.7,
            vec!["genre", "premise", "tone"],
        ),
        PhaseSpec::new(
            2,
            "Character development",
            vec![1],
            0.7,
            vec!["characters", "relationships"],
        )
        .with_parallel_group("narrative-foundation"),
        PhaseSpec::new(
            3,
            "World building",
            vec![1],
            0.7,
            vec!["setting", "rules", "locations"],
        )
        .with_parallel_group("narrative-foundation"),
        PhaseSpec::new(
            4,
            "Plot structure",
            vec![1, 2, 3],
            0.8,
            vec!["acts", "arcs", "conflicts"],
        ),
        PhaseSpec::new(
            5,
            "Draft composition",
            vec![1, 2, 3, 4],
            0.8,
            vec!["chapters", "word_count"],
        ),
        PhaseSpec::new(
            6,
            "Style refinement",
            vec![1, 2, 3, 4, 5],
            0.75,
            vec!["revisions", "style_notes"],
        ),
        PhaseSpec::new(
            7,
            "Final assembly",
            vec![1, 2, 3, 4, 5, 6],
            0.9,
            vec!["manuscript", "summary", "metadata"],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_shape() {
        let phases = default_phases();
        assert_eq!(phases.len(), PHASE_COUNT as usize);

        // Numbers are 1..=7 in order
        for (i, spec) in phases.iter().enumerate() {
            assert_eq!(spec.number, (i + 1) as u8);
        }

        // Phase 1 has no dependencies; 2 and 3 depend only on 1
        assert!(phases[0].dependencies.is_empty());
        assert_eq!(phases[1].dependencies, vec![1]);
        assert_eq!(phases[2].dependencies, vec![1]);

        // 2 and 3 share a parallel group
        assert!(phases[1].parallel_group.is_some());
        assert_eq!(phases[1].parallel_group, phases[2].parallel_group);

        // Later phases depend on all earlier phases
        assert_eq!(phases[3].dependencies, vec![1, 2, 3]);
        assert_eq!(phases[6].dependencies, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_final_assembly_threshold() {
        let phases = default_phases();
        assert!(phases[6].quality_threshold >= 0.9);
    }

    #[test]
    fn test_phase_status_terminal() {
        assert!(!PhaseStatus::Pending.is_terminal());
        assert!(!PhaseStatus::Running.is_terminal());
        assert!(PhaseStatus::Completed.is_terminal());
        assert!(
            PhaseStatus::Failed {
                error: "x".into()
            }
            .is_terminal()
        );
        assert!(
            PhaseStatus::Cancelled {
                reason: "x".into()
            }
            .is_terminal()
        );
    }

    #[test]
    fn test_spec_builders() {
        let spec = PhaseSpec::new(2, "Characters", vec![1], 0.7, vec!["characters"])
            .with_hitl(true)
            .with_timeout_secs(60);
        assert!(spec.hitl_enabled);
        assert_eq!(spec.timeout_secs, Some(60));
    }
}
