//! Review session state machine types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// State of one review session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HitlState {
    /// Session created but not yet waiting (transient)
    #[default]
    Idle,
    /// Waiting on reviewer feedback
    WaitingFeedback,
    /// A modification round is regenerating the phase output
    Regenerating,
    /// Reviewer approved or skipped
    Completed,
    /// Feedback window elapsed
    Timeout,
    /// Iteration limit exceeded or regeneration failed
    Error,
    /// Pipeline cancellation reached this session
    Cancelled,
}

impl HitlState {
    /// No further transitions are legal from a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Timeout | Self::Error | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::WaitingFeedback => "waiting_feedback",
            Self::Regenerating => "regenerating",
            Self::Completed => "completed",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for HitlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the reviewer asked for.
///
/// Unrecognized types arriving from the transport layer deserialize to
/// `Unknown` and are rejected without a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    /// Accept the output as-is
    Approval,
    /// Request a regeneration round with changes
    Modification,
    /// Skip the checkpoint without judging the output
    Skip,
    #[serde(other)]
    Unknown,
}

/// One piece of reviewer feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(rename = "type")]
    pub kind: FeedbackKind,
    /// Reviewer-supplied data merged into the regeneration input
    #[serde(default)]
    pub data: Value,
}

impl Feedback {
    pub fn approval() -> Self {
        Self {
            kind: FeedbackKind::Approval,
            data: Value::Null,
        }
    }

    pub fn skip() -> Self {
        Self {
            kind: FeedbackKind::Skip,
            data: Value::Null,
        }
    }

    pub fn modification(data: Value) -> Self {
        Self {
            kind: FeedbackKind::Modification,
            data,
        }
    }
}

/// Signal delivered to whoever is driving the review checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum HitlOutcome {
    /// Reviewer approved the output
    Approved,
    /// Reviewer skipped the checkpoint
    Skipped,
    /// A modification round started; regenerate with this feedback
    Regenerate { feedback: Value, iteration: u32 },
    /// The feedback window elapsed
    TimedOut,
    /// The session failed (iteration limit or regeneration failure)
    Failed { message: String },
    /// The session was cancelled
    Cancelled { reason: String },
}

/// One review session's bookkeeping.
///
/// Owned by the manager; mutation happens only under the session's lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlSessionContext {
    pub session_id: String,
    pub phase: u8,
    pub state: HitlState,
    /// Modification rounds consumed so far
    pub iteration_count: u32,
    pub max_iterations: u32,
    /// Latest output preview shown to the reviewer
    pub preview: Value,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_state_change: DateTime<Utc>,
    /// Watchdog generation; bumped whenever the feedback window re-arms so a
    /// stale watchdog cannot time out a newer wait
    #[serde(skip)]
    pub(crate) watchdog_epoch: u64,
}

impl HitlSessionContext {
    pub fn new(session_id: &str, phase: u8, preview: Value, max_iterations: u32) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            phase,
            state: HitlState::WaitingFeedback,
            iteration_count: 0,
            max_iterations,
            preview,
            error_message: None,
            started_at: now,
            last_state_change: now,
            watchdog_epoch: 0,
        }
    }

    pub(crate) fn transition(&mut self, state: HitlState) {
        self.state = state;
        self.last_state_change = Utc::now();
    }

    /// Age since creation.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}
