//! Cooperative cancellation for pipeline runs.
//!
//! A `CancelSource` is held by whoever may cancel the run; `CancelToken`
//! clones are handed to every suspension point (agent calls, feedback waits,
//! batch joins). Cancellation is effective-eventually: in-flight work observes
//! the token at its next suspension point and winds down; results produced in
//! the meantime are discarded by the orchestrator.

use std::sync::OnceLock;
use tokio::sync::watch;

/// The cancelling side of a run's cancellation signal.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<Option<String>>,
}

/// A cheap, cloneable handle checked at suspension points.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<Option<String>>,
}

impl CancelSource {
    /// Create a new cancellation pair.
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, CancelToken { rx })
    }

    /// Signal cancellation with a reason. Idempotent; the first reason wins.
    pub fn cancel(&self, reason: &str) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.to_string());
                true
            } else {
                false
            }
        });
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl CancelToken {
    /// A token that can never fire, for callers outside any run.
    pub fn never() -> Self {
        // One process-wide sender keeps the channel open for every
        // never-token, no matter how many are created and dropped.
        static NEVER: OnceLock<watch::Sender<Option<String>>> = OnceLock::new();
        let tx = NEVER.get_or_init(|| watch::channel(None).0);
        Self { rx: tx.subscribe() }
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The cancellation reason, if cancelled.
    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Resolve once cancellation is signalled, yielding the reason.
    ///
    /// If the source is dropped without cancelling, this pends forever, so it
    /// is safe to race against real work in a `select!`.
    pub async fn cancelled(&self) -> String {
        let mut rx = self.rx.clone();
        loop {
            {
                let value = rx.borrow_and_update();
                if let Some(reason) = value.as_ref() {
                    return reason.clone();
                }
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}
