//! Typed error hierarchy for the pipeline coordinator.
//!
//! Four top-level enums cover the four subsystems:
//! - `PlannerError` — dependency graph construction failures
//! - `PhaseError` — per-phase execution failures (agent, timeout, quality)
//! - `HitlError` — human-in-the-loop session and state machine failures
//! - `PipelineError` — whole-run failures surfaced to the caller
//!
//! The split matters for propagation policy: `PhaseError` values are retried
//! or degraded inside the executor and only escape when fatal; `HitlError`
//! values abort at most one phase's feedback sub-flow; `PipelineError` values
//! terminate the run.

use crate::hitl::HitlState;
use thiserror::Error;

/// Errors detected while building or validating the phase dependency graph.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("Duplicate phase number: {0}")]
    DuplicatePhase(u8),

    #[error("Phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: u8, dependency: u8 },

    #[error("Phase {phase} depends on {dependency}, which is not an earlier phase")]
    ForwardDependency { phase: u8, dependency: u8 },

    #[error("Cycle detected in phase dependencies. Involved phases: {phases:?}")]
    Cycle { phases: Vec<u8> },

    #[error("Quality threshold {threshold} for phase {phase} is outside [0, 1]")]
    InvalidThreshold { phase: u8, threshold: f64 },
}

/// Errors from a single phase execution.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Agent for phase {phase} timed out after {timeout_secs}s")]
    AgentTimeout { phase: u8, timeout_secs: u64 },

    #[error("Agent for phase {phase} failed: {message}")]
    AgentProcessing { phase: u8, message: String },

    #[error(
        "Quality gate failed for critical phase {phase}: score {score:.2} < threshold {threshold:.2} after {attempts} attempts"
    )]
    QualityThreshold {
        phase: u8,
        score: f64,
        threshold: f64,
        attempts: u32,
    },

    #[error("Agent output for phase {phase} failed validation")]
    OutputRejected { phase: u8 },

    #[error("Phase {phase} cancelled: {reason}")]
    Cancelled { phase: u8, reason: String },

    #[error("No agent registered for phase {phase}")]
    NoAgent { phase: u8 },
}

impl PhaseError {
    /// Phase number this error belongs to.
    pub fn phase(&self) -> u8 {
        match self {
            Self::AgentTimeout { phase, .. }
            | Self::AgentProcessing { phase, .. }
            | Self::QualityThreshold { phase, .. }
            | Self::OutputRejected { phase }
            | Self::Cancelled { phase, .. }
            | Self::NoAgent { phase } => *phase,
        }
    }

    /// Whether the executor may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AgentTimeout { .. } | Self::AgentProcessing { .. })
    }
}

/// Errors from the human-in-the-loop subsystem.
#[derive(Debug, Error)]
pub enum HitlError {
    #[error("No HITL session found for id {session_id}")]
    SessionNotFound { session_id: String },

    #[error("HITL session {session_id} already exists in state {state}")]
    SessionExists { session_id: String, state: HitlState },

    #[error(
        "Invalid HITL transition for session {session_id} (phase {phase}): {attempted} is not legal from {from}"
    )]
    InvalidTransition {
        session_id: String,
        phase: u8,
        from: HitlState,
        attempted: &'static str,
    },

    #[error("Maximum iterations exceeded for session {session_id}: {iterations} > {max}")]
    IterationLimit {
        session_id: String,
        iterations: u32,
        max: u32,
    },

    #[error("Invalid feedback type: {0}")]
    InvalidFeedback(String),

    #[error("HITL persistence failure for session {session_id}: {message}")]
    Session { session_id: String, message: String },

    #[error("Regeneration failed for session {session_id}: {message}")]
    RegenerationFailed { session_id: String, message: String },
}

/// Errors that terminate a whole pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Planner(#[from] PlannerError),

    #[error("Pipeline stuck: no ready phases while {remaining:?} remain unexecuted")]
    DependencyGraph { remaining: Vec<u8> },

    #[error("Critical phase {phase} failed: {source}")]
    CriticalPhaseFailed {
        phase: u8,
        #[source]
        source: PhaseError,
    },

    #[error("Pipeline cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Review failed for critical phase {phase}: {message}")]
    ReviewFailed { phase: u8, message: String },

    #[error("Cannot regenerate phase {phase}: it has not completed")]
    RegenerateIncomplete { phase: u8 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_error_carries_phase_number() {
        let err = PhaseError::AgentTimeout {
            phase: 3,
            timeout_secs: 120,
        };
        assert_eq!(err.phase(), 3);
        assert!(err.to_string().contains("120"));
    }

    #[test]
    fn timeout_and_processing_are_retryable() {
        assert!(
            PhaseError::AgentTimeout {
                phase: 1,
                timeout_secs: 5
            }
            .is_retryable()
        );
        assert!(
            PhaseError::AgentProcessing {
                phase: 1,
                message: "boom".into()
            }
            .is_retryable()
        );
        assert!(
            !PhaseError::QualityThreshold {
                phase: 4,
                score: 0.55,
                threshold: 0.7,
                attempts: 3
            }
            .is_retryable()
        );
    }

    #[test]
    fn hitl_invalid_transition_names_states() {
        let err = HitlError::InvalidTransition {
            session_id: "s1".into(),
            phase: 2,
            from: HitlState::Completed,
            attempted: "process_feedback",
        };
        let msg = err.to_string();
        assert!(msg.contains("completed"));
        assert!(msg.contains("process_feedback"));
    }

    #[test]
    fn iteration_limit_carries_counts() {
        let err = HitlError::IterationLimit {
            session_id: "s1".into(),
            iterations: 4,
            max: 3,
        };
        match &err {
            HitlError::IterationLimit { iterations, max, .. } => {
                assert_eq!(*iterations, 4);
                assert_eq!(*max, 3);
            }
            _ => panic!("Expected IterationLimit"),
        }
    }

    #[test]
    fn pipeline_error_wraps_planner_error() {
        let inner = PlannerError::DuplicatePhase(2);
        let err: PipelineError = inner.into();
        assert!(matches!(err, PipelineError::Planner(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PlannerError::DuplicatePhase(1));
        assert_std_error(&PhaseError::NoAgent { phase: 1 });
        assert_std_error(&HitlError::InvalidFeedback("x".into()));
        assert_std_error(&PipelineError::Cancelled { reason: "x".into() });
    }
}
