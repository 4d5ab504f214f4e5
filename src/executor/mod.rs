//! Phase executor: runs one phase through its agent with timeout, retries,
//! quality gating, and result caching.
//!
//! Execution policy per attempt:
//! 1. The agent call runs under the phase's timeout and the run's cancel
//!    token. Timeouts and agent errors are retryable up to `max_retries`,
//!    with a backoff of `retry_base_delay * attempt`.
//! 2. Accepted outputs are scored by the quality gate. A passing (or
//!    overridden) score returns immediately; a failing score burns an attempt
//!    and keeps the best-scoring output seen so far.
//! 3. On exhaustion, a critical phase fails with `QualityThreshold` (or the
//!    last transient error); a non-critical phase returns its best output
//!    flagged `degraded`.
//!
//! Successful outcomes are cached by the fingerprint of `(phase, input)`;
//! concurrent identical requests coalesce onto a single agent invocation.

mod cache;

pub use cache::{SingleFlightCache, fingerprint};

use crate::agent::{AgentRegistry, AgentOutput, PreviousResults};
use crate::cancel::CancelToken;
use crate::config::PipelineConfig;
use crate::errors::PhaseError;
use crate::phase::PhaseSpec;
use crate::quality::{QualityGateRecord, QualityGateService};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Result of executing one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub phase: u8,
    pub output: AgentOutput,
    pub quality: QualityGateRecord,
    /// Set when a non-critical phase exhausted retries below threshold and
    /// the best-scoring output was kept
    pub degraded: bool,
    /// Agent invocations this outcome took (0 for a cache hit)
    pub attempts: u32,
    /// Whether this call was served from the cache
    #[serde(default)]
    pub from_cache: bool,
    /// Set by the orchestrator when the review subsystem failed and the
    /// last known-good result was kept
    #[serde(default)]
    pub hitl_error: bool,
}

/// Executes phases through their agents.
pub struct PhaseExecutor {
    agents: AgentRegistry,
    gate: QualityGateService,
    cache: SingleFlightCache<PhaseOutcome>,
    config: PipelineConfig,
}

impl PhaseExecutor {
    pub fn new(agents: AgentRegistry, gate: QualityGateService, config: PipelineConfig) -> Self {
        Self {
            agents,
            gate,
            cache: SingleFlightCache::new(),
            config,
        }
    }

    /// Execute a phase, serving identical inputs from the cache.
    ///
    /// At most one computation runs per fingerprint across concurrent
    /// callers; the rest wait on the in-flight result.
    pub async fn execute(
        &self,
        session_id: &str,
        spec: &PhaseSpec,
        input: &Value,
        previous_results: &PreviousResults,
        cancel: &CancelToken,
    ) -> Result<PhaseOutcome, PhaseError> {
        let key = fingerprint(spec.number, input);
        let cell = self.cache.cell(&key);

        let computed = AtomicBool::new(false);
        let outcome = cell
            .get_or_try_init(|| {
                computed.store(true, Ordering::SeqCst);
                self.run_phase(session_id, spec, input, previous_results, cancel)
            })
            .await?;

        let mut outcome = outcome.clone();
        outcome.from_cache = !computed.load(Ordering::SeqCst);
        if outcome.from_cache {
            debug!(phase = spec.number, %key, "phase result served from cache");
        }
        Ok(outcome)
    }

    /// Execute a phase, discarding any cached result for this input first.
    ///
    /// Used for explicit regeneration, where the caller wants a fresh agent
    /// invocation even for an identical input.
    pub async fn execute_fresh(
        &self,
        session_id: &str,
        spec: &PhaseSpec,
        input: &Value,
        previous_results: &PreviousResults,
        cancel: &CancelToken,
    ) -> Result<PhaseOutcome, PhaseError> {
        let key = fingerprint(spec.number, input);
        self.cache.invalidate(&key);
        self.execute(session_id, spec, input, previous_results, cancel)
            .await
    }

    /// One full attempt loop for a phase: agent call, gate, retries.
    async fn run_phase(
        &self,
        session_id: &str,
        spec: &PhaseSpec,
        input: &Value,
        previous_results: &PreviousResults,
        cancel: &CancelToken,
    ) -> Result<PhaseOutcome, PhaseError> {
        let phase = spec.number;
        let agent = self
            .agents
            .get(phase)
            .ok_or(PhaseError::NoAgent { phase })?;

        let timeout = spec
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.agent_timeout);
        let is_critical = self.config.is_critical(phase);

        let mut best: Option<(AgentOutput, QualityGateRecord)> = None;
        let mut last_error = PhaseError::AgentProcessing {
            phase,
            message: "agent never invoked".to_string(),
        };

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.config.retry_base_delay * attempt;
                tokio::select! {
                    reason = cancel.cancelled() => {
                        return Err(PhaseError::Cancelled { phase, reason });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if let Some(reason) = cancel.reason() {
                return Err(PhaseError::Cancelled { phase, reason });
            }

            let agent_result = tokio::select! {
                reason = cancel.cancelled() => {
                    return Err(PhaseError::Cancelled { phase, reason });
                }
                res = tokio::time::timeout(timeout, agent.process(input, previous_results)) => res,
            };

            let output = match agent_result {
                Err(_elapsed) => {
                    warn!(phase, attempt, timeout_secs = timeout.as_secs(), "agent timed out");
                    last_error = PhaseError::AgentTimeout {
                        phase,
                        timeout_secs: timeout.as_secs(),
                    };
                    continue;
                }
                Ok(Err(err)) => {
                    warn!(phase, attempt, error = %err, "agent failed");
                    last_error = PhaseError::AgentProcessing {
                        phase,
                        message: err.to_string(),
                    };
                    continue;
                }
                Ok(Ok(output)) => output,
            };

            if !agent.validate(&output) {
                warn!(phase, attempt, "agent output failed validation");
                last_error = PhaseError::OutputRejected { phase };
                continue;
            }

            let record = self
                .gate
                .evaluate(session_id, spec, &output, is_critical, self.config.max_retries)
                .await;

            if record.status.unblocks_downstream() {
                return Ok(PhaseOutcome {
                    phase,
                    output,
                    quality: record,
                    degraded: false,
                    attempts: attempt + 1,
                    from_cache: false,
                    hitl_error: false,
                });
            }

            debug!(
                phase,
                attempt,
                score = record.quality_score,
                threshold = record.threshold,
                "quality gate failed"
            );
            last_error = PhaseError::QualityThreshold {
                phase,
                score: record.quality_score,
                threshold: record.threshold,
                attempts: attempt + 1,
            };

            let better = best
                .as_ref()
                .is_none_or(|(_, b)| record.quality_score > b.quality_score);
            if better {
                best = Some((output, record));
            }
        }

        // Retry budget exhausted.
        if is_critical {
            return Err(last_error);
        }

        match best {
            Some((output, record)) => {
                warn!(
                    phase,
                    score = record.quality_score,
                    threshold = record.threshold,
                    "non-critical phase degraded to best-scoring output"
                );
                Ok(PhaseOutcome {
                    phase,
                    output,
                    quality: record,
                    degraded: true,
                    attempts: self.config.max_retries + 1,
                    from_cache: false,
                    hitl_error: false,
                })
            }
            // Never got an output at all; nothing to degrade to.
            None => Err(last_error),
        }
    }
}
