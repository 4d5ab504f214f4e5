//! Human-in-the-loop review: per-session feedback state machine.
//!
//! A review session follows
//! `waiting_feedback → {regenerating → waiting_feedback}* → terminal`, where
//! the terminal states are `completed`, `timeout`, `error`, and `cancelled`.
//! Modification rounds are bounded; a watchdog times out sessions that never
//! hear back from the reviewer.
//!
//! The manager owns the active-session map. All reads and mutations of one
//! session go through its per-session lock, so feedback racing a timeout
//! resolves deterministically: whoever locks first wins, the loser observes
//! the terminal state and gets an invalid-transition error.

mod manager;
mod session;

pub use manager::HitlStateManager;
pub use session::{Feedback, FeedbackKind, HitlOutcome, HitlSessionContext, HitlState};
