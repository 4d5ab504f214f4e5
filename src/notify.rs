//! Progress events and the outbound notifier seam.
//!
//! The coordinator publishes an event at every state transition. Transport
//! (WebSocket hub, SSE, log sink) lives outside the core behind the
//! [`ProgressNotifier`] trait; publishing is best-effort and a failed publish
//! never aborts the pipeline.

use crate::orchestrator::RunSummary;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Events emitted during pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A phase has started execution.
    PhaseStarted { phase: u8 },
    /// A phase produced an accepted result.
    PhaseCompleted {
        phase: u8,
        quality_score: f64,
        degraded: bool,
    },
    /// A human review checkpoint is waiting on feedback.
    FeedbackRequired { phase: u8, preview: Value },
    /// The reviewer approved the phase output.
    FeedbackApproved { phase: u8 },
    /// A modification round was applied and regeneration started.
    FeedbackModificationApplied { phase: u8, iteration: u32 },
    /// The reviewer skipped the checkpoint.
    FeedbackSkipped { phase: u8 },
    /// The feedback window elapsed; the last good result stands.
    FeedbackTimeout { phase: u8 },
    /// All phases reached a terminal state successfully.
    PipelineCompleted { summary: RunSummary },
    /// The run terminated with a fatal error.
    PipelineFailed { error: String },
    /// The run was cancelled.
    PipelineCancelled { reason: String },
}

/// Outbound notification seam, implemented by the excluded transport layer.
#[async_trait]
pub trait ProgressNotifier: Send + Sync {
    /// Publish one event for a session. Failures are the caller's to log.
    async fn publish(&self, session_id: &str, event: ProgressEvent) -> anyhow::Result<()>;
}

/// Notifier that discards all events.
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl ProgressNotifier for NoopNotifier {
    async fn publish(&self, _session_id: &str, _event: ProgressEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Notifier that forwards events onto an unbounded channel.
///
/// Used by tests to assert event sequences, and usable as a bridge to any
/// consumer that drains the receiver.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<(String, ProgressEvent)>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiver its events land on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, ProgressEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ProgressNotifier for ChannelNotifier {
    async fn publish(&self, session_id: &str, event: ProgressEvent) -> anyhow::Result<()> {
        self.tx
            .send((session_id.to_string(), event))
            .map_err(|_| anyhow::anyhow!("progress channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization_is_snake_case_tagged() {
        let event = ProgressEvent::FeedbackRequired {
            phase: 4,
            preview: json!({"acts": 3}),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"feedback_required\""));
        assert!(json.contains("\"phase\":4"));
    }

    #[tokio::test]
    async fn test_channel_notifier_delivers() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier
            .publish("session-1", ProgressEvent::PhaseStarted { phase: 1 })
            .await
            .unwrap();

        let (session, event) = rx.recv().await.unwrap();
        assert_eq!(session, "session-1");
        assert!(matches!(event, ProgressEvent::PhaseStarted { phase: 1 }));
    }

    #[tokio::test]
    async fn test_channel_notifier_errors_when_closed() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        let result = notifier
            .publish("session-1", ProgressEvent::PhaseStarted { phase: 1 })
            .await;
        assert!(result.is_err());
    }
}
