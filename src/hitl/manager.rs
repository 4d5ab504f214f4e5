//! The review session manager.

use crate::errors::HitlError;
use crate::hitl::session::{
    Feedback, FeedbackKind, HitlOutcome, HitlSessionContext, HitlState,
};
use crate::persist::Persistence;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, warn};

/// Owns the active review sessions and drives their state machines.
///
/// Every mutation of a session happens under that session's lock, so
/// concurrent feedback and timeout calls on one id serialize: the first to
/// acquire the lock transitions the state, the second observes the terminal
/// state and fails with an invalid-transition error.
#[derive(Clone)]
pub struct HitlStateManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Mutex<HitlSessionContext>>>>>,
    signals: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<HitlOutcome>>>>,
    persistence: Arc<dyn Persistence>,
    feedback_timeout: Duration,
    max_iterations: u32,
}

impl HitlStateManager {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        feedback_timeout: Duration,
        max_iterations: u32,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            signals: Arc::new(RwLock::new(HashMap::new())),
            persistence,
            feedback_timeout,
            max_iterations,
        }
    }

    /// Create a session in `waiting_feedback` and arm its timeout watchdog.
    ///
    /// Returns the receiver the checkpoint driver waits on for outcomes. If
    /// the persistence write fails the in-memory session still exists (so
    /// the caller can retry or clean up deterministically) and the error is
    /// surfaced as `HitlError::Session`.
    pub async fn start_session(
        &self,
        session_id: &str,
        phase: u8,
        preview: Value,
    ) -> Result<mpsc::UnboundedReceiver<HitlOutcome>, HitlError> {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions.get(session_id) {
                let state = existing.lock().await.state;
                return Err(HitlError::SessionExists {
                    session_id: session_id.to_string(),
                    state,
                });
            }
            let ctx = HitlSessionContext::new(session_id, phase, preview, self.max_iterations);
            sessions.insert(session_id.to_string(), Arc::new(Mutex::new(ctx)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.signals.write().await.insert(session_id.to_string(), tx);

        self.spawn_watchdog(session_id.to_string(), 0);
        debug!(session_id, phase, "review session started");

        if let Err(err) = self
            .persistence
            .save_hitl_state(session_id, phase, HitlState::WaitingFeedback.as_str())
            .await
        {
            warn!(session_id, phase, error = %err, "review session persistence failed");
            return Err(HitlError::Session {
                session_id: session_id.to_string(),
                message: err.to_string(),
            });
        }

        Ok(rx)
    }

    /// Apply reviewer feedback. Only legal from `waiting_feedback`.
    pub async fn process_feedback(
        &self,
        session_id: &str,
        feedback: Feedback,
    ) -> Result<HitlState, HitlError> {
        let ctx_arc = self.context(session_id).await?;
        let mut ctx = ctx_arc.lock().await;

        if ctx.state != HitlState::WaitingFeedback {
            warn!(
                session_id,
                phase = ctx.phase,
                from = %ctx.state,
                attempted = "process_feedback",
                "illegal review transition"
            );
            return Err(HitlError::InvalidTransition {
                session_id: session_id.to_string(),
                phase: ctx.phase,
                from: ctx.state,
                attempted: "process_feedback",
            });
        }

        match feedback.kind {
            FeedbackKind::Unknown => Err(HitlError::InvalidFeedback(
                "expected approval, modification, or skip".to_string(),
            )),
            FeedbackKind::Approval => {
                ctx.transition(HitlState::Completed);
                self.persist_state(&ctx).await;
                self.signal(session_id, HitlOutcome::Approved).await;
                Ok(HitlState::Completed)
            }
            FeedbackKind::Skip => {
                ctx.transition(HitlState::Completed);
                self.persist_state(&ctx).await;
                self.signal(session_id, HitlOutcome::Skipped).await;
                Ok(HitlState::Completed)
            }
            FeedbackKind::Modification => {
                ctx.iteration_count += 1;
                if ctx.iteration_count > ctx.max_iterations {
                    let message = "Maximum iterations exceeded".to_string();
                    ctx.transition(HitlState::Error);
                    ctx.error_message = Some(message.clone());
                    warn!(
                        session_id,
                        phase = ctx.phase,
                        iterations = ctx.iteration_count,
                        max = ctx.max_iterations,
                        "review iteration limit exceeded"
                    );
                    self.persist_state(&ctx).await;
                    self.signal(session_id, HitlOutcome::Failed { message }).await;
                    return Err(HitlError::IterationLimit {
                        session_id: session_id.to_string(),
                        iterations: ctx.iteration_count,
                        max: ctx.max_iterations,
                    });
                }

                ctx.transition(HitlState::Regenerating);
                // Park the watchdog while regeneration runs.
                ctx.watchdog_epoch += 1;
                self.persist_state(&ctx).await;
                self.signal(
                    session_id,
                    HitlOutcome::Regenerate {
                        feedback: feedback.data,
                        iteration: ctx.iteration_count,
                    },
                )
                .await;
                Ok(HitlState::Regenerating)
            }
        }
    }

    /// Report the result of a modification round. Only legal from
    /// `regenerating`. On success the session re-enters `waiting_feedback`
    /// with the new preview and a re-armed watchdog.
    pub async fn handle_regeneration_complete(
        &self,
        session_id: &str,
        success: bool,
        new_preview: Value,
    ) -> Result<HitlState, HitlError> {
        let ctx_arc = self.context(session_id).await?;
        let mut ctx = ctx_arc.lock().await;

        if ctx.state != HitlState::Regenerating {
            warn!(
                session_id,
                phase = ctx.phase,
                from = %ctx.state,
                attempted = "handle_regeneration_complete",
                "illegal review transition"
            );
            return Err(HitlError::InvalidTransition {
                session_id: session_id.to_string(),
                phase: ctx.phase,
                from: ctx.state,
                attempted: "handle_regeneration_complete",
            });
        }

        if success {
            ctx.preview = new_preview;
            ctx.transition(HitlState::WaitingFeedback);
            ctx.watchdog_epoch += 1;
            let epoch = ctx.watchdog_epoch;
            self.persist_state(&ctx).await;
            self.spawn_watchdog(session_id.to_string(), epoch);
            Ok(HitlState::WaitingFeedback)
        } else {
            let message = "regeneration failed".to_string();
            ctx.transition(HitlState::Error);
            ctx.error_message = Some(message.clone());
            self.persist_state(&ctx).await;
            self.signal(session_id, HitlOutcome::Failed { message: message.clone() })
                .await;
            Err(HitlError::RegenerationFailed {
                session_id: session_id.to_string(),
                message,
            })
        }
    }

    /// Time out a waiting session. Safe to call for any id: unknown ids and
    /// sessions not in `waiting_feedback` are a no-op.
    pub async fn handle_timeout(&self, session_id: &str) {
        let Ok(ctx_arc) = self.context(session_id).await else {
            return;
        };
        let mut ctx = ctx_arc.lock().await;
        if ctx.state != HitlState::WaitingFeedback {
            return;
        }
        ctx.transition(HitlState::Timeout);
        warn!(session_id, phase = ctx.phase, "review session timed out");
        self.persist_state(&ctx).await;
        self.signal(session_id, HitlOutcome::TimedOut).await;
    }

    /// Force a non-terminal session to `cancelled`. Returns whether a
    /// transition happened.
    pub async fn cancel_session(&self, session_id: &str, reason: &str) -> bool {
        let Ok(ctx_arc) = self.context(session_id).await else {
            return false;
        };
        let mut ctx = ctx_arc.lock().await;
        if ctx.state.is_terminal() {
            return false;
        }
        ctx.transition(HitlState::Cancelled);
        ctx.error_message = Some(reason.to_string());
        self.persist_state(&ctx).await;
        self.signal(
            session_id,
            HitlOutcome::Cancelled {
                reason: reason.to_string(),
            },
        )
        .await;
        true
    }

    /// Remove a session. Callers do this after reaching a terminal state to
    /// bound memory growth.
    pub async fn cleanup_session(&self, session_id: &str) -> bool {
        self.signals.write().await.remove(session_id);
        self.sessions.write().await.remove(session_id).is_some()
    }

    /// Remove sessions older than `max_age` regardless of state. Returns the
    /// count removed. Intended as a periodic maintenance task.
    pub async fn force_cleanup_stale_sessions(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);

        let stale: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut stale = Vec::new();
            for (id, ctx_arc) in sessions.iter() {
                let ctx = ctx_arc.lock().await;
                if ctx.age() > max_age {
                    stale.push(id.clone());
                }
            }
            stale
        };

        let mut sessions = self.sessions.write().await;
        let mut signals = self.signals.write().await;
        let mut removed = 0;
        for id in stale {
            signals.remove(&id);
            if sessions.remove(&id).is_some() {
                warn!(session_id = %id, "stale review session swept");
                removed += 1;
            }
        }
        removed
    }

    /// Point-in-time copy of a session's context.
    pub async fn snapshot(&self, session_id: &str) -> Option<HitlSessionContext> {
        let sessions = self.sessions.read().await;
        let ctx_arc = sessions.get(session_id)?.clone();
        drop(sessions);
        Some(ctx_arc.lock().await.clone())
    }

    /// Number of live sessions.
    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn context(
        &self,
        session_id: &str,
    ) -> Result<Arc<Mutex<HitlSessionContext>>, HitlError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| HitlError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    async fn signal(&self, session_id: &str, outcome: HitlOutcome) {
        if let Some(tx) = self.signals.read().await.get(session_id) {
            // Receiver may be gone if the driver stopped listening; fine.
            tx.send(outcome).ok();
        }
    }

    async fn persist_state(&self, ctx: &HitlSessionContext) {
        if let Err(err) = self
            .persistence
            .save_hitl_state(&ctx.session_id, ctx.phase, ctx.state.as_str())
            .await
        {
            warn!(
                session_id = %ctx.session_id,
                phase = ctx.phase,
                error = %err,
                "review state persistence failed"
            );
        }
    }

    /// Arm a watchdog for the current feedback window. The epoch guards
    /// against a stale watchdog firing after the window re-armed.
    fn spawn_watchdog(&self, session_id: String, epoch: u64) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(manager.feedback_timeout).await;

            let Ok(ctx_arc) = manager.context(&session_id).await else {
                return;
            };
            let mut ctx = ctx_arc.lock().await;
            if ctx.state != HitlState::WaitingFeedback || ctx.watchdog_epoch != epoch {
                return;
            }
            ctx.transition(HitlState::Timeout);
            warn!(session_id = %session_id, phase = ctx.phase, "feedback window elapsed");
            manager.persist_state(&ctx).await;
            manager.signal(&session_id, HitlOutcome::TimedOut).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryPersistence;
    use async_trait::async_trait;
    use serde_json::json;

    fn manager() -> HitlStateManager {
        HitlStateManager::new(
            Arc::new(MemoryPersistence::new()),
            Duration::from_secs(30 * 60),
            3,
        )
    }

    #[tokio::test]
    async fn test_approval_completes_session() {
        let manager = manager();
        let mut rx = manager
            .start_session("s1", 4, json!({"acts": 3}))
            .await
            .unwrap();

        let state = manager
            .process_feedback("s1", Feedback::approval())
            .await
            .unwrap();
        assert_eq!(state, HitlState::Completed);
        assert_eq!(rx.recv().await, Some(HitlOutcome::Approved));
    }

    #[tokio::test]
    async fn test_skip_completes_session() {
        let manager = manager();
        let mut rx = manager
            .start_session("s1", 4, json!({}))
            .await
            .unwrap();

        manager
            .process_feedback("s1", Feedback::skip())
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(HitlOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_modification_rounds_increment_and_cap() {
        let manager = manager();
        let mut rx = manager
            .start_session("s1", 4, json!({}))
            .await
            .unwrap();

        for expected in 1..=3u32 {
            let state = manager
                .process_feedback("s1", Feedback::modification(json!({"round": expected})))
                .await
                .unwrap();
            assert_eq!(state, HitlState::Regenerating);

            match rx.recv().await.unwrap() {
                HitlOutcome::Regenerate { iteration, .. } => assert_eq!(iteration, expected),
                other => panic!("expected Regenerate, got {other:?}"),
            }

            manager
                .handle_regeneration_complete("s1", true, json!({"round": expected}))
                .await
                .unwrap();
        }

        // Fourth modification exceeds max_iterations = 3
        let err = manager
            .process_feedback("s1", Feedback::modification(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HitlError::IterationLimit {
                iterations: 4,
                max: 3,
                ..
            }
        ));

        let ctx = manager.snapshot("s1").await.unwrap();
        assert_eq!(ctx.state, HitlState::Error);
        assert_eq!(
            ctx.error_message.as_deref(),
            Some("Maximum iterations exceeded")
        );
    }

    #[tokio::test]
    async fn test_feedback_from_terminal_state_never_mutates() {
        let manager = manager();
        let _rx = manager.start_session("s1", 4, json!({})).await.unwrap();
        manager
            .process_feedback("s1", Feedback::approval())
            .await
            .unwrap();

        let err = manager
            .process_feedback("s1", Feedback::modification(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::InvalidTransition { .. }));

        let ctx = manager.snapshot("s1").await.unwrap();
        assert_eq!(ctx.state, HitlState::Completed);
        assert_eq!(ctx.iteration_count, 0);
    }

    #[tokio::test]
    async fn test_unknown_feedback_leaves_state_unchanged() {
        let manager = manager();
        let _rx = manager.start_session("s1", 4, json!({})).await.unwrap();

        let feedback: Feedback =
            serde_json::from_str(r#"{"type": "escalate"}"#).unwrap();
        let err = manager.process_feedback("s1", feedback).await.unwrap_err();
        assert!(matches!(err, HitlError::InvalidFeedback(_)));

        // Still waiting; approval succeeds afterwards
        let state = manager
            .process_feedback("s1", Feedback::approval())
            .await
            .unwrap();
        assert_eq!(state, HitlState::Completed);
    }

    #[tokio::test]
    async fn test_regeneration_failure_errors_session() {
        let manager = manager();
        let mut rx = manager.start_session("s1", 4, json!({})).await.unwrap();
        manager
            .process_feedback("s1", Feedback::modification(json!({})))
            .await
            .unwrap();
        rx.recv().await.unwrap();

        let err = manager
            .handle_regeneration_complete("s1", false, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::RegenerationFailed { .. }));
        assert!(matches!(
            rx.recv().await,
            Some(HitlOutcome::Failed { .. })
        ));

        let ctx = manager.snapshot("s1").await.unwrap();
        assert_eq!(ctx.state, HitlState::Error);
    }

    #[tokio::test]
    async fn test_regeneration_complete_only_legal_from_regenerating() {
        let manager = manager();
        let _rx = manager.start_session("s1", 4, json!({})).await.unwrap();

        let err = manager
            .handle_regeneration_complete("s1", true, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_handle_timeout_is_idempotent_and_safe_for_unknown_ids() {
        let manager = manager();
        manager.handle_timeout("no-such-session").await;

        let mut rx = manager.start_session("s1", 4, json!({})).await.unwrap();
        manager.handle_timeout("s1").await;
        manager.handle_timeout("s1").await;

        assert_eq!(rx.recv().await, Some(HitlOutcome::TimedOut));
        // Exactly one signal despite two calls
        assert!(rx.try_recv().is_err());

        let ctx = manager.snapshot("s1").await.unwrap();
        assert_eq!(ctx.state, HitlState::Timeout);
    }

    #[tokio::test]
    async fn test_feedback_after_timeout_loses_deterministically() {
        let manager = manager();
        let _rx = manager.start_session("s1", 4, json!({})).await.unwrap();
        manager.handle_timeout("s1").await;

        let err = manager
            .process_feedback("s1", Feedback::approval())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HitlError::InvalidTransition {
                from: HitlState::Timeout,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_after_feedback_window() {
        let manager = HitlStateManager::new(
            Arc::new(MemoryPersistence::new()),
            Duration::from_secs(30 * 60),
            3,
        );
        let mut rx = manager.start_session("s1", 4, json!({})).await.unwrap();

        // Paused clock auto-advances through the watchdog's sleep
        assert_eq!(rx.recv().await, Some(HitlOutcome::TimedOut));
        let ctx = manager.snapshot("s1").await.unwrap();
        assert_eq!(ctx.state, HitlState::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_watchdog_does_not_fire_rearmed_window() {
        let manager = HitlStateManager::new(
            Arc::new(MemoryPersistence::new()),
            Duration::from_secs(60),
            3,
        );
        let mut rx = manager.start_session("s1", 4, json!({})).await.unwrap();

        // Enter a modification round before the window elapses
        tokio::time::sleep(Duration::from_secs(10)).await;
        manager
            .process_feedback("s1", Feedback::modification(json!({})))
            .await
            .unwrap();
        rx.recv().await.unwrap();

        // Regeneration takes past the original deadline; the original
        // watchdog must not fire while regenerating
        tokio::time::sleep(Duration::from_secs(120)).await;
        let ctx = manager.snapshot("s1").await.unwrap();
        assert_eq!(ctx.state, HitlState::Regenerating);

        // Re-armed window times out on its own schedule
        manager
            .handle_regeneration_complete("s1", true, json!({}))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(HitlOutcome::TimedOut));
    }

    #[tokio::test]
    async fn test_start_session_conflicts_until_cleanup() {
        let manager = manager();
        let _rx = manager.start_session("s1", 4, json!({})).await.unwrap();
        manager
            .process_feedback("s1", Feedback::approval())
            .await
            .unwrap();

        let err = manager.start_session("s1", 4, json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            HitlError::SessionExists {
                state: HitlState::Completed,
                ..
            }
        ));

        assert!(manager.cleanup_session("s1").await);
        let _rx = manager.start_session("s1", 5, json!({})).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_session_forces_terminal() {
        let manager = manager();
        let mut rx = manager.start_session("s1", 4, json!({})).await.unwrap();

        assert!(manager.cancel_session("s1", "pipeline cancelled").await);
        assert!(matches!(
            rx.recv().await,
            Some(HitlOutcome::Cancelled { .. })
        ));

        // Already terminal; second cancel is a no-op
        assert!(!manager.cancel_session("s1", "again").await);
    }

    #[tokio::test]
    async fn test_stale_sweep_removes_old_sessions() {
        let manager = manager();
        let _rx = manager.start_session("s1", 4, json!({})).await.unwrap();
        let _rx2 = manager.start_session("s2", 5, json!({})).await.unwrap();

        let removed = manager.force_cleanup_stale_sessions(Duration::ZERO).await;
        assert_eq!(removed, 2);
        assert_eq!(manager.active_sessions().await, 0);
    }

    struct FailingPersistence;

    #[async_trait]
    impl Persistence for FailingPersistence {
        async fn save_phase_result(
            &self,
            _session_id: &str,
            _phase: u8,
            _attempt: u32,
            _output: &crate::agent::AgentOutput,
            _quality: &crate::quality::QualityGateRecord,
        ) -> anyhow::Result<()> {
            anyhow::bail!("database unavailable")
        }

        async fn load_pipeline_state(
            &self,
            _session_id: &str,
        ) -> anyhow::Result<Option<crate::persist::PersistedRun>> {
            Ok(None)
        }

        async fn save_hitl_state(
            &self,
            _session_id: &str,
            _phase: u8,
            _state: &str,
        ) -> anyhow::Result<()> {
            anyhow::bail!("database unavailable")
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_still_creates_context() {
        let manager = HitlStateManager::new(
            Arc::new(FailingPersistence),
            Duration::from_secs(60),
            3,
        );

        let err = manager.start_session("s1", 4, json!({})).await.unwrap_err();
        assert!(matches!(err, HitlError::Session { .. }));

        // Context exists so the caller can clean up deterministically
        assert!(manager.snapshot("s1").await.is_some());
        assert!(manager.cleanup_session("s1").await);
    }
}
