//! Pipeline orchestrator: wave scheduling, review checkpoints, and run state.
//!
//! One run proceeds in waves. Each wave asks the planner which phases are
//! ready given the completed set, partitions them into parallel batches, and
//! dispatches each batch under the parallelism bound. When a batch finishes,
//! phases flagged for human review run their checkpoint before the next wave
//! starts, so a reviewer always judges an output whose upstream inputs are
//! settled.
//!
//! Failure policy: an unrecoverable phase error ends the run. Criticality
//! governs what counts as unrecoverable inside the executor (quality
//! exhaustion degrades non-critical phases) and how review failures are
//! treated here. Cancellation wins over other failures observed in the same
//! batch.

mod run;

pub use run::{PhaseNode, PipelineRun, RunStatus, RunSummary};

use crate::agent::AgentRegistry;
use crate::cancel::{CancelSource, CancelToken};
use crate::config::PipelineConfig;
use crate::errors::{PhaseError, PipelineError, PlannerError};
use crate::executor::PhaseExecutor;
use crate::hitl::{Feedback, HitlOutcome, HitlSessionContext, HitlState, HitlStateManager};
use crate::notify::{NoopNotifier, ProgressEvent, ProgressNotifier};
use crate::persist::{MemoryPersistence, Persistence};
use crate::phase::{PhaseSpec, default_phases};
use crate::planner::ExecutionPlanner;
use crate::quality::{MemoryGateStore, QualityGateRecord, QualityGateService};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info, warn};

/// Coordinates pipeline runs end to end.
///
/// Construct once per deployment with the agent registry and configuration;
/// each call to [`execute_pipeline`](Self::execute_pipeline) drives one run.
/// Run state is retained after completion so phases can be regenerated.
pub struct PipelineOrchestrator {
    planner: ExecutionPlanner,
    executor: Arc<PhaseExecutor>,
    gate: QualityGateService,
    hitl: HitlStateManager,
    notifier: Arc<dyn ProgressNotifier>,
    persistence: Arc<dyn Persistence>,
    agents: AgentRegistry,
    config: PipelineConfig,
    runs: RwLock<HashMap<String, Arc<Mutex<PipelineRun>>>>,
    active: RwLock<HashMap<String, CancelSource>>,
}

impl PipelineOrchestrator {
    /// Orchestrator over the default seven-phase catalog.
    pub fn new(agents: AgentRegistry, config: PipelineConfig) -> Result<Self, PlannerError> {
        Self::with_phases(agents, config, default_phases())
    }

    /// Orchestrator over a custom phase catalog.
    pub fn with_phases(
        agents: AgentRegistry,
        config: PipelineConfig,
        phases: Vec<PhaseSpec>,
    ) -> Result<Self, PlannerError> {
        let planner = ExecutionPlanner::new(phases)?;
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let gate = QualityGateService::new(Arc::new(MemoryGateStore::new()));
        let executor = Arc::new(PhaseExecutor::new(
            agents.clone(),
            gate.clone(),
            config.clone(),
        ));
        let hitl = HitlStateManager::new(
            persistence.clone(),
            config.feedback_timeout,
            config.max_hitl_iterations,
        );

        Ok(Self {
            planner,
            executor,
            gate,
            hitl,
            notifier: Arc::new(NoopNotifier),
            persistence,
            agents,
            config,
            runs: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
        })
    }

    /// Replace the progress notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn ProgressNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Replace the persistence sink.
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.hitl = HitlStateManager::new(
            persistence.clone(),
            self.config.feedback_timeout,
            self.config.max_hitl_iterations,
        );
        self.persistence = persistence;
        self
    }

    /// Replace the quality gate service (e.g. to inject a model scorer or a
    /// durable gate store).
    pub fn with_gate(mut self, gate: QualityGateService) -> Self {
        self.executor = Arc::new(PhaseExecutor::new(
            self.agents.clone(),
            gate.clone(),
            self.config.clone(),
        ));
        self.gate = gate;
        self
    }

    /// Fresh v4 session id for callers that do not bring their own.
    pub fn new_session_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Execute a full pipeline run for a session.
    pub async fn execute_pipeline(
        &self,
        session_id: &str,
        input: Value,
    ) -> Result<RunSummary, PipelineError> {
        self.check_agents()?;
        let token = self.claim_session(session_id).await?;

        let run = Arc::new(Mutex::new(PipelineRun::new(
            session_id,
            input,
            self.planner.phases(),
        )));

        info!(session_id, "pipeline run started");
        self.drive(session_id, run, token, HashSet::new(), HashMap::new())
            .await
    }

    /// Resume a run from the persistence sink, re-executing only phases
    /// without an accepted persisted result.
    pub async fn resume_pipeline(
        &self,
        session_id: &str,
        input: Value,
    ) -> Result<RunSummary, PipelineError> {
        self.check_agents()?;
        let token = self.claim_session(session_id).await?;

        let mut run = PipelineRun::new(session_id, input, self.planner.phases());
        match self.persistence.load_pipeline_state(session_id).await {
            Ok(Some(persisted)) => {
                for (phase, record) in persisted.phases {
                    if !record.quality.status.unblocks_downstream() {
                        continue;
                    }
                    if let Some(node) = run.nodes.get_mut(&phase) {
                        node.mark_completed(crate::executor::PhaseOutcome {
                            phase,
                            output: record.output,
                            quality: record.quality,
                            degraded: false,
                            attempts: record.attempt + 1,
                            from_cache: true,
                            hitl_error: false,
                        });
                    }
                }
                info!(
                    session_id,
                    restored = run.completed_set().len(),
                    "pipeline run resumed from persisted state"
                );
            }
            Ok(None) => {}
            Err(err) => {
                self.release_session(session_id).await;
                return Err(err.into());
            }
        }

        let run = Arc::new(Mutex::new(run));
        self.drive(session_id, run, token, HashSet::new(), HashMap::new())
            .await
    }

    /// Re-run a completed phase and everything downstream of it.
    ///
    /// The phase's transitive dependents are reset to pending and recomputed
    /// from scratch, bypassing the result cache. Optional feedback is merged
    /// into the regenerated phase's input.
    pub async fn regenerate_phase(
        &self,
        session_id: &str,
        phase: u8,
        feedback: Option<Value>,
    ) -> Result<RunSummary, PipelineError> {
        let token = self.claim_session(session_id).await?;

        // Node resets happen only after the session is claimed, so a
        // regeneration racing an active run cannot clobber its state.
        match self.prepare_regeneration(session_id, phase, feedback).await {
            Ok((run, fresh, overrides)) => {
                self.drive(session_id, run, token, fresh, overrides).await
            }
            Err(err) => {
                self.release_session(session_id).await;
                Err(err)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    async fn prepare_regeneration(
        &self,
        session_id: &str,
        phase: u8,
        feedback: Option<Value>,
    ) -> Result<(Arc<Mutex<PipelineRun>>, HashSet<u8>, HashMap<u8, Value>), PipelineError> {
        let run = self
            .runs
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| {
                PipelineError::Other(anyhow::anyhow!("no run recorded for session {session_id}"))
            })?;

        let closure = self.planner.dependents_closure(phase);

        let overrides = {
            let mut run = run.lock().await;
            match run.nodes.get_mut(&phase) {
                Some(node) if node.status.is_completed() => node.reset(),
                Some(_) => return Err(PipelineError::RegenerateIncomplete { phase }),
                None => {
                    return Err(PipelineError::Other(anyhow::anyhow!(
                        "unknown phase {phase}"
                    )));
                }
            }
            for downstream in &closure {
                if let Some(node) = run.nodes.get_mut(downstream) {
                    node.reset();
                }
            }
            run.status = RunStatus::Initializing;
            run.current_phase = None;
            run.finished_at = None;

            let mut overrides = HashMap::new();
            if let Some(feedback) = feedback {
                overrides.insert(phase, merge_feedback(&run.input, &feedback));
            }
            overrides
        };

        info!(
            session_id,
            phase,
            invalidated = closure.len(),
            "phase regeneration requested"
        );

        let mut fresh = closure;
        fresh.insert(phase);
        Ok((run, fresh, overrides))
    }

    /// Cancel a running pipeline. Returns whether a run was signalled.
    pub async fn cancel_pipeline(&self, session_id: &str, reason: &str) -> bool {
        match self.active.read().await.get(session_id) {
            Some(source) => {
                source.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Forward reviewer feedback into a phase's open review session.
    pub async fn submit_feedback(
        &self,
        session_id: &str,
        phase: u8,
        feedback: Feedback,
    ) -> Result<HitlState, crate::errors::HitlError> {
        self.hitl
            .process_feedback(&review_id(session_id, phase), feedback)
            .await
    }

    /// Snapshot of a phase's open review session, if any.
    pub async fn review_session(&self, session_id: &str, phase: u8) -> Option<HitlSessionContext> {
        self.hitl.snapshot(&review_id(session_id, phase)).await
    }

    /// Manually approve a failed quality gate, unblocking downstream phases
    /// on the next regeneration or resume.
    pub async fn override_quality_gate(
        &self,
        session_id: &str,
        phase: u8,
        approver: &str,
        reason: &str,
    ) -> Result<QualityGateRecord, PipelineError> {
        Ok(self.gate.apply_override(session_id, phase, approver, reason).await?)
    }

    /// Snapshot of a run's state.
    pub async fn run_state(&self, session_id: &str) -> Option<PipelineRun> {
        let run = self.runs.read().await.get(session_id).cloned()?;
        let run = run.lock().await;
        Some(run.clone())
    }

    /// Drop a retained run. Regeneration is no longer possible afterwards.
    pub async fn remove_run(&self, session_id: &str) -> bool {
        self.runs.write().await.remove(session_id).is_some()
    }

    /// Sweep review sessions older than the configured staleness age.
    pub async fn sweep_stale_reviews(&self) -> usize {
        self.hitl
            .force_cleanup_stale_sessions(self.config.stale_session_age)
            .await
    }

    fn check_agents(&self) -> Result<(), PipelineError> {
        let missing = self.agents.missing_phases(self.planner.phase_numbers());
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Other(anyhow::anyhow!(
                "no agent registered for phases {missing:?}"
            )))
        }
    }

    /// Claim the single execution slot for a session. Must succeed before
    /// any run state for the session is created or mutated.
    async fn claim_session(&self, session_id: &str) -> Result<CancelToken, PipelineError> {
        let mut active = self.active.write().await;
        if active.contains_key(session_id) {
            return Err(PipelineError::Other(anyhow::anyhow!(
                "session {session_id} is already executing"
            )));
        }
        let (source, token) = CancelSource::new();
        active.insert(session_id.to_string(), source);
        Ok(token)
    }

    async fn release_session(&self, session_id: &str) {
        self.active.write().await.remove(session_id);
    }

    /// Drive a claimed run to a terminal state, emitting the terminal event.
    async fn drive(
        &self,
        session_id: &str,
        run: Arc<Mutex<PipelineRun>>,
        token: CancelToken,
        fresh: HashSet<u8>,
        overrides: HashMap<u8, Value>,
    ) -> Result<RunSummary, PipelineError> {
        self.runs
            .write()
            .await
            .insert(session_id.to_string(), run.clone());

        let result = self
            .drive_inner(session_id, &run, &token, &fresh, &overrides)
            .await;
        self.release_session(session_id).await;

        match result {
            Ok(summary) => {
                info!(
                    session_id,
                    duration_ms = summary.total_duration_ms,
                    "pipeline run completed"
                );
                self.emit(
                    session_id,
                    ProgressEvent::PipelineCompleted {
                        summary: summary.clone(),
                    },
                )
                .await;
                Ok(summary)
            }
            Err(PipelineError::Cancelled { reason }) => {
                {
                    let mut run = run.lock().await;
                    for node in run.nodes.values_mut() {
                        if !node.status.is_terminal() {
                            node.mark_cancelled(reason.clone());
                        }
                    }
                    run.finish(RunStatus::Cancelled);
                }
                info!(session_id, reason = %reason, "pipeline run cancelled");
                self.emit(
                    session_id,
                    ProgressEvent::PipelineCancelled {
                        reason: reason.clone(),
                    },
                )
                .await;
                Err(PipelineError::Cancelled { reason })
            }
            Err(err) => {
                run.lock().await.finish(RunStatus::Failed);
                warn!(session_id, error = %err, "pipeline run failed");
                self.emit(
                    session_id,
                    ProgressEvent::PipelineFailed {
                        error: err.to_string(),
                    },
                )
                .await;
                Err(err)
            }
        }
    }

    /// The wave loop.
    async fn drive_inner(
        &self,
        session_id: &str,
        run: &Arc<Mutex<PipelineRun>>,
        token: &CancelToken,
        fresh: &HashSet<u8>,
        overrides: &HashMap<u8, Value>,
    ) -> Result<RunSummary, PipelineError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_phases.max(1)));

        loop {
            if let Some(reason) = token.reason() {
                return Err(PipelineError::Cancelled { reason });
            }

            let (executed, done) = {
                let run = run.lock().await;
                (run.completed_set(), run.all_completed())
            };
            if done {
                break;
            }

            let ready: Vec<PhaseSpec> = self
                .planner
                .ready_phases(&executed)
                .into_iter()
                .cloned()
                .collect();
            if ready.is_empty() {
                let remaining = run.lock().await.remaining();
                return Err(PipelineError::DependencyGraph { remaining });
            }

            let ready_refs: Vec<&PhaseSpec> = ready.iter().collect();
            for batch in self.planner.group_for_parallel_execution(&ready_refs) {
                self.run_batch(session_id, run, token, &semaphore, &batch, fresh, overrides)
                    .await?;
            }
        }

        let mut run = run.lock().await;
        run.finish(RunStatus::Completed);
        Ok(run.summary())
    }

    /// Dispatch one batch of phases concurrently and settle their results.
    #[allow(clippy::too_many_arguments)]
    async fn run_batch(
        &self,
        session_id: &str,
        run: &Arc<Mutex<PipelineRun>>,
        token: &CancelToken,
        semaphore: &Arc<Semaphore>,
        batch: &[&PhaseSpec],
        fresh: &HashSet<u8>,
        overrides: &HashMap<u8, Value>,
    ) -> Result<(), PipelineError> {
        let mut handles = Vec::with_capacity(batch.len());

        for &spec in batch {
            let phase = spec.number;
            let (input, previous) = {
                let mut run = run.lock().await;
                let input = overrides
                    .get(&phase)
                    .cloned()
                    .unwrap_or_else(|| run.input.clone());
                let previous = run.previous_results(Some(phase));
                if let Some(node) = run.nodes.get_mut(&phase) {
                    node.mark_running();
                }
                run.note_phase_started(phase);
                (input, previous)
            };
            self.emit(session_id, ProgressEvent::PhaseStarted { phase })
                .await;

            let spec = spec.clone();
            let executor = self.executor.clone();
            let semaphore = semaphore.clone();
            let token = token.clone();
            let session = session_id.to_string();
            let force_fresh = fresh.contains(&phase);

            handles.push((
                phase,
                tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("semaphore never closed");
                    if force_fresh {
                        executor
                            .execute_fresh(&session, &spec, &input, &previous, &token)
                            .await
                    } else {
                        executor
                            .execute(&session, &spec, &input, &previous, &token)
                            .await
                    }
                }),
            ));
        }

        let mut reviews: Vec<u8> = Vec::new();
        let mut failure: Option<PipelineError> = None;
        let mut cancelled: Option<String> = None;

        for (phase, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => {
                    failure.get_or_insert(PipelineError::Other(anyhow::anyhow!(
                        "phase {phase} task panicked: {err}"
                    )));
                    continue;
                }
            };

            match result {
                Ok(outcome) => {
                    if let Err(err) = self
                        .persistence
                        .save_phase_result(
                            session_id,
                            phase,
                            outcome.quality.retry_count,
                            &outcome.output,
                            &outcome.quality,
                        )
                        .await
                    {
                        warn!(session_id, phase, error = %err, "phase result persistence failed");
                    }
                    self.emit(
                        session_id,
                        ProgressEvent::PhaseCompleted {
                            phase,
                            quality_score: outcome.quality.quality_score,
                            degraded: outcome.degraded,
                        },
                    )
                    .await;

                    let hitl_enabled = {
                        let mut run = run.lock().await;
                        match run.nodes.get_mut(&phase) {
                            Some(node) => {
                                node.mark_completed(outcome);
                                node.spec.hitl_enabled
                            }
                            None => false,
                        }
                    };
                    if hitl_enabled {
                        reviews.push(phase);
                    }
                }
                Err(PhaseError::Cancelled { reason, .. }) => {
                    cancelled.get_or_insert(reason);
                }
                Err(err) => {
                    {
                        let mut run = run.lock().await;
                        if let Some(node) = run.nodes.get_mut(&phase) {
                            node.mark_failed(err.to_string());
                        }
                    }
                    let wrapped = if self.config.is_critical(phase) {
                        PipelineError::CriticalPhaseFailed { phase, source: err }
                    } else {
                        PipelineError::Other(
                            anyhow::Error::new(err)
                                .context(format!("phase {phase} produced no usable output")),
                        )
                    };
                    failure.get_or_insert(wrapped);
                }
            }
        }

        // Cancellation wins over other failures observed in the same batch.
        if let Some(reason) = cancelled {
            return Err(PipelineError::Cancelled { reason });
        }
        if let Some(err) = failure {
            return Err(err);
        }

        for phase in reviews {
            if let Some(spec) = self.planner.get(phase) {
                let spec = spec.clone();
                self.review_checkpoint(session_id, run, &spec, token).await?;
            }
        }

        Ok(())
    }

    /// Run the human review checkpoint for one completed phase.
    ///
    /// Timeout keeps the last accepted result. A failed review (iteration
    /// limit or broken regeneration) aborts only this checkpoint unless the
    /// phase is critical, in which case the run fails.
    async fn review_checkpoint(
        &self,
        session_id: &str,
        run: &Arc<Mutex<PipelineRun>>,
        spec: &PhaseSpec,
        token: &CancelToken,
    ) -> Result<(), PipelineError> {
        let phase = spec.number;
        let review_id = review_id(session_id, phase);

        let preview = {
            let run = run.lock().await;
            run.nodes
                .get(&phase)
                .and_then(|n| n.outcome.as_ref())
                .map(|o| o.output.content.clone())
                .unwrap_or(Value::Null)
        };

        let mut rx = match self.hitl.start_session(&review_id, phase, preview.clone()).await {
            Ok(rx) => rx,
            Err(err) => {
                warn!(session_id, phase, error = %err, "review session unavailable, keeping result");
                self.hitl.cleanup_session(&review_id).await;
                self.flag_hitl_error(run, phase).await;
                return Ok(());
            }
        };

        self.emit(session_id, ProgressEvent::FeedbackRequired { phase, preview })
            .await;

        let result = loop {
            let outcome = tokio::select! {
                reason = token.cancelled() => {
                    self.hitl.cancel_session(&review_id, &reason).await;
                    break Err(PipelineError::Cancelled { reason });
                }
                outcome = rx.recv() => outcome,
            };

            match outcome {
                None => {
                    warn!(session_id, phase, "review signal channel closed, keeping result");
                    self.flag_hitl_error(run, phase).await;
                    break Ok(());
                }
                Some(HitlOutcome::Approved) => {
                    self.emit(session_id, ProgressEvent::FeedbackApproved { phase })
                        .await;
                    break Ok(());
                }
                Some(HitlOutcome::Skipped) => {
                    self.emit(session_id, ProgressEvent::FeedbackSkipped { phase })
                        .await;
                    break Ok(());
                }
                Some(HitlOutcome::TimedOut) => {
                    // Last accepted result stands.
                    self.emit(session_id, ProgressEvent::FeedbackTimeout { phase })
                        .await;
                    break Ok(());
                }
                Some(HitlOutcome::Cancelled { reason }) => {
                    break Err(PipelineError::Cancelled { reason });
                }
                Some(HitlOutcome::Failed { message }) => {
                    if self.config.is_critical(phase) {
                        break Err(PipelineError::ReviewFailed { phase, message });
                    }
                    warn!(session_id, phase, message = %message, "review failed, keeping last result");
                    self.flag_hitl_error(run, phase).await;
                    break Ok(());
                }
                Some(HitlOutcome::Regenerate { feedback, iteration }) => {
                    self.emit(
                        session_id,
                        ProgressEvent::FeedbackModificationApplied { phase, iteration },
                    )
                    .await;

                    match self
                        .regenerate_for_review(session_id, run, spec, &feedback, token)
                        .await
                    {
                        Ok(new_preview) => {
                            if let Err(err) = self
                                .hitl
                                .handle_regeneration_complete(&review_id, true, new_preview)
                                .await
                            {
                                warn!(session_id, phase, error = %err, "review session dropped regeneration result");
                                break Ok(());
                            }
                        }
                        Err(PipelineError::Cancelled { reason }) => {
                            self.hitl.cancel_session(&review_id, &reason).await;
                            break Err(PipelineError::Cancelled { reason });
                        }
                        Err(err) => {
                            let _ = self
                                .hitl
                                .handle_regeneration_complete(&review_id, false, Value::Null)
                                .await;
                            if self.config.is_critical(phase) {
                                break Err(err);
                            }
                            warn!(session_id, phase, error = %err, "regeneration failed, keeping last result");
                            self.flag_hitl_error(run, phase).await;
                            break Ok(());
                        }
                    }
                }
            }
        };

        self.hitl.cleanup_session(&review_id).await;
        result
    }

    /// One modification round: fresh agent call with feedback merged into
    /// the phase input, replacing the phase's result on success.
    async fn regenerate_for_review(
        &self,
        session_id: &str,
        run: &Arc<Mutex<PipelineRun>>,
        spec: &PhaseSpec,
        feedback: &Value,
        token: &CancelToken,
    ) -> Result<Value, PipelineError> {
        let phase = spec.number;
        let (input, previous) = {
            let run = run.lock().await;
            (
                merge_feedback(&run.input, feedback),
                run.previous_results(Some(phase)),
            )
        };

        match self
            .executor
            .execute_fresh(session_id, spec, &input, &previous, token)
            .await
        {
            Ok(outcome) => {
                if let Err(err) = self
                    .persistence
                    .save_phase_result(
                        session_id,
                        phase,
                        outcome.quality.retry_count,
                        &outcome.output,
                        &outcome.quality,
                    )
                    .await
                {
                    warn!(session_id, phase, error = %err, "phase result persistence failed");
                }
                self.emit(
                    session_id,
                    ProgressEvent::PhaseCompleted {
                        phase,
                        quality_score: outcome.quality.quality_score,
                        degraded: outcome.degraded,
                    },
                )
                .await;

                let preview = outcome.output.content.clone();
                let mut run = run.lock().await;
                if let Some(node) = run.nodes.get_mut(&phase) {
                    node.mark_completed(outcome);
                }
                Ok(preview)
            }
            Err(PhaseError::Cancelled { reason, .. }) => {
                Err(PipelineError::Cancelled { reason })
            }
            Err(err) => {
                if self.config.is_critical(phase) {
                    Err(PipelineError::CriticalPhaseFailed { phase, source: err })
                } else {
                    Err(PipelineError::Other(
                        anyhow::Error::new(err)
                            .context(format!("regeneration of phase {phase} failed")),
                    ))
                }
            }
        }
    }

    async fn flag_hitl_error(&self, run: &Arc<Mutex<PipelineRun>>, phase: u8) {
        let mut run = run.lock().await;
        if let Some(outcome) = run
            .nodes
            .get_mut(&phase)
            .and_then(|n| n.outcome.as_mut())
        {
            outcome.hitl_error = true;
        }
    }

    /// Best-effort event emission; a broken notifier never aborts the run.
    async fn emit(&self, session_id: &str, event: ProgressEvent) {
        if let Err(err) = self.notifier.publish(session_id, event).await {
            debug!(session_id, error = %err, "progress event dropped");
        }
    }
}

fn review_id(session_id: &str, phase: u8) -> String {
    format!("{session_id}:phase-{phase}")
}

/// Merge reviewer feedback into the run input for a regeneration round.
///
/// Object feedback overlays the input's keys; anything else rides alongside
/// the original request.
fn merge_feedback(base: &Value, feedback: &Value) -> Value {
    match (base, feedback) {
        (_, Value::Null) => base.clone(),
        (Value::Object(base_map), Value::Object(fb)) => {
            let mut merged = base_map.clone();
            for (key, value) in fb {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => serde_json::json!({"request": base, "feedback": feedback}),
    }
}
