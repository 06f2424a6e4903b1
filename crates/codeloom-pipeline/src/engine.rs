//! Session orchestrator: the stage → router → stage loop.
//!
//! One [`PipelineExecutor`] drives one session's state document to a
//! terminal phase. It owns the state exclusively for the duration of
//! [`PipelineExecutor::run`], invokes stages strictly one at a time, applies
//! each patch atomically and enforces the iteration budget.

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use codeloom_types::{
    ExecutionFeedback, Field, LoomError, SessionPhase, SessionState, StateUpdate, TaskStatus,
    Verdict,
};

use crate::checkpoint::{save_checkpoint, SessionCheckpoint};
use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::events::{EventEmitter, PipelineEvent};
use crate::retry::backoff;
use crate::router::{route, Route, Router};
use crate::stage::{StageId, StageRegistry};
use crate::stages::standard_registry;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// The core session executor. Owns a stage registry and drives the loop.
pub struct PipelineExecutor {
    registry: StageRegistry,
    config: EngineConfig,
    router: Router,
    events: EventEmitter,
    cancel: CancellationToken,
}

/// Why a session ended in `failed`.
#[derive(Debug)]
pub struct SessionFailure {
    pub session_id: String,
    /// Last stage that completed before the failure.
    pub last_stage: Option<StageId>,
    /// Phase the session was in when it failed.
    pub phase: SessionPhase,
    pub error: LoomError,
}

#[derive(Debug)]
pub enum SessionOutcome {
    Saved,
    Failed(SessionFailure),
    Cancelled { last_stage: Option<StageId> },
}

/// The result of driving one session.
#[derive(Debug)]
pub struct SessionReport {
    pub state: SessionState,
    pub outcome: SessionOutcome,
    /// Stage invocations made by this run.
    pub invocations: usize,
    pub duration_ms: u64,
}

impl SessionReport {
    pub fn is_saved(&self) -> bool {
        matches!(self.outcome, SessionOutcome::Saved)
    }

    pub fn failure(&self) -> Option<&SessionFailure> {
        match &self.outcome {
            SessionOutcome::Failed(f) => Some(f),
            _ => None,
        }
    }

    pub fn passed_tasks(&self) -> usize {
        self.state.tasks_with_status(TaskStatus::Passed).count()
    }

    pub fn abandoned_tasks(&self) -> usize {
        self.state.tasks_with_status(TaskStatus::Abandoned).count()
    }

    /// Saved with every task passing, as opposed to saved with some abandoned.
    pub fn all_passed(&self) -> bool {
        self.is_saved() && self.passed_tasks() == self.state.tasks.len()
    }
}

// ---------------------------------------------------------------------------
// PipelineExecutor
// ---------------------------------------------------------------------------

impl PipelineExecutor {
    /// Create an executor with the given stage registry.
    pub fn new(registry: StageRegistry, config: EngineConfig) -> Self {
        Self {
            registry,
            config,
            router: route,
            events: EventEmitter::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Create an executor with the built-in stages wired to `collaborators`.
    pub fn with_collaborators(collaborators: &Collaborators, config: EngineConfig) -> Self {
        let registry = standard_registry(collaborators, &config);
        Self::new(registry, config)
    }

    /// Replace the routing function.
    pub fn with_router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Stop the session at the next stage boundary once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Drive `state` to a terminal phase.
    ///
    /// A state loaded from a checkpoint continues from its phase.
    pub async fn run(&self, state: SessionState) -> SessionReport {
        let mut run = Run {
            state,
            invocations: 0,
            last_stage: None,
            started: Instant::now(),
        };
        let session_id = run.state.session_id.clone();
        tracing::info!(session = %session_id, phase = run.state.phase.as_str(), "Session started");
        self.events.emit(PipelineEvent::SessionStarted {
            session_id: session_id.clone(),
            phase: run.state.phase.as_str().into(),
        });

        if let Err(e) = self.config.validate() {
            return self.fail(run, e).await;
        }
        let missing = self.registry.missing();
        if !missing.is_empty() {
            let ids: Vec<String> = missing.iter().map(|id| id.to_string()).collect();
            return self.fail(run, LoomError::UnknownStage(ids.join(", "))).await;
        }
        if matches!(run.state.phase, SessionPhase::Failed | SessionPhase::Cancelled) {
            let phase = run.state.phase;
            return self
                .fail(
                    run,
                    LoomError::Invariant(format!(
                        "session already ended {}; resume it from a checkpoint",
                        phase.as_str()
                    )),
                )
                .await;
        }

        loop {
            if let Err(e) = self.ensure_running() {
                return self.cancelled(run, e).await;
            }

            let next = (self.router)(&run.state);
            tracing::debug!(session = %session_id, phase = run.state.phase.as_str(), next = %next, "Route selected");
            self.events.emit(PipelineEvent::RouteSelected {
                session_id: session_id.clone(),
                phase: run.state.phase.as_str().into(),
                next: next.to_string(),
            });

            let id = match next {
                Route::Done => break,
                Route::Advance => {
                    if let Err(e) = self.advance(&mut run.state).await {
                        return self.fail(run, e).await;
                    }
                    continue;
                }
                Route::Stage(id) => id,
            };

            if self.is_retry(&run.state) {
                if let Err(e) = self.wait_before_retry(&run.state).await {
                    return self.cancelled(run, e).await;
                }
            }

            if run.invocations >= self.config.iteration_budget {
                let last = run
                    .last_stage
                    .map_or_else(|| "none".to_string(), |s| s.to_string());
                let err = LoomError::IterationBudgetExceeded {
                    budget: self.config.iteration_budget,
                    last_stage: last,
                };
                return self.fail(run, err).await;
            }
            run.invocations += 1;

            match self.invoke(id, &mut run.state, run.invocations).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return self.fail(run, e).await,
                Err(e @ LoomError::Cancelled) => return self.cancelled(run, e).await,
                Err(e) if Self::is_attempt_stage(id) => {
                    if let Err(e) = self.absorb_attempt_error(&mut run.state, id, e) {
                        return self.fail(run, e).await;
                    }
                }
                Err(e) => return self.fail(run, e).await,
            }
            run.last_stage = Some(id);

            if id == StageId::Critique && run.state.retry.last_verdict == Some(Verdict::Failed) {
                self.events.emit(PipelineEvent::AttemptFailed {
                    session_id: session_id.clone(),
                    task: run.state.current_task,
                    attempt: run.state.retry.attempts,
                    kind: run
                        .state
                        .retry
                        .last_failure
                        .as_ref()
                        .map(|f| f.kind.as_str())
                        .unwrap_or("unknown")
                        .into(),
                });
            }
        }

        if run.state.phase != SessionPhase::Saved {
            let phase = run.state.phase;
            return self
                .fail(
                    run,
                    LoomError::Invariant(format!("router ended the session in phase {}", phase.as_str())),
                )
                .await;
        }
        self.saved(run).await
    }

    /// Invoke one stage and apply its patch.
    async fn invoke(&self, id: StageId, state: &mut SessionState, invocation: usize) -> codeloom_types::Result<()> {
        let stage = self
            .registry
            .get(id)
            .ok_or_else(|| LoomError::UnknownStage(id.to_string()))?;

        tracing::debug!(session = %state.session_id, stage = %id, invocation, "Stage started");
        self.events.emit(PipelineEvent::StageStarted {
            session_id: state.session_id.clone(),
            stage: id.to_string(),
            invocation,
        });
        let started = Instant::now();

        let result: codeloom_types::Result<Vec<Field>> = async {
            let update = stage.execute(state).await?;
            let fields = update.touched();
            if let Some(field) = fields.iter().find(|f| !id.owns(**f)) {
                return Err(LoomError::StageContract {
                    stage: id.to_string(),
                    field: field.as_str().into(),
                });
            }
            state.apply(update.with_phase(id.completed_phase()))?;
            Ok(fields)
        }
        .await;

        match result {
            Ok(fields) => {
                self.events.emit(PipelineEvent::StageCompleted {
                    session_id: state.session_id.clone(),
                    stage: id.to_string(),
                    fields: fields.iter().map(|f| f.as_str().to_string()).collect(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session = %state.session_id, stage = %id, error = %e, "Stage failed");
                self.events.emit(PipelineEvent::StageFailed {
                    session_id: state.session_id.clone(),
                    stage: id.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Stages whose errors belong to the active task's attempt.
    fn is_attempt_stage(id: StageId) -> bool {
        matches!(
            id,
            StageId::Retrieve | StageId::Generate | StageId::Accumulate | StageId::Execute
        )
    }

    /// Turn an attempt-local error into failing feedback so the critic
    /// consumes a retry for it.
    fn absorb_attempt_error(
        &self,
        state: &mut SessionState,
        id: StageId,
        error: LoomError,
    ) -> codeloom_types::Result<()> {
        let kind = match error.failure_kind() {
            Some(kind) => kind,
            None => return Err(error),
        };
        if state.current().is_none() {
            return Err(error);
        }
        tracing::warn!(
            session = %state.session_id,
            task = state.current_task,
            stage = %id,
            kind = kind.as_str(),
            error = %error,
            "Attempt failed before execution finished"
        );
        let feedback = ExecutionFeedback::from_error(kind, error.to_string());
        let mut update = StateUpdate::new()
            .with_feedback(feedback)
            .with_phase(SessionPhase::Executed);
        if id == StageId::Generate {
            update = update.clear_draft();
        }
        state.apply(update)
    }

    fn ensure_running(&self) -> codeloom_types::Result<()> {
        if self.cancel.is_cancelled() {
            Err(LoomError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep out the retry backoff unless the session is cancelled first.
    async fn wait_before_retry(&self, state: &SessionState) -> codeloom_types::Result<()> {
        tokio::select! {
            _ = backoff(&self.config.retry_backoff, state.retry.attempts, state.current_task) => Ok(()),
            _ = self.cancel.cancelled() => Err(LoomError::Cancelled),
        }
    }

    /// The next stage re-runs a task whose last attempt failed.
    fn is_retry(&self, state: &SessionState) -> bool {
        state.phase == SessionPhase::Critiqued
            && state.retry.last_verdict == Some(Verdict::Failed)
            && !state.all_tasks_processed()
    }

    /// Move past the active task: bump the pointer, reset the counters and
    /// clear the scratch slot.
    async fn advance(&self, state: &mut SessionState) -> codeloom_types::Result<()> {
        let index = state.current_task;
        let task = state
            .current()
            .ok_or_else(|| LoomError::Invariant("advance past the last task".into()))?;

        let mut status = task.status;
        let mut update = StateUpdate::new()
            .with_current_task(index + 1)
            .with_retry(state.retry.reset())
            .clear_scratch();
        if status == TaskStatus::Pending {
            status = if state.retry.last_verdict == Some(Verdict::Passed) {
                TaskStatus::Passed
            } else {
                TaskStatus::Abandoned
            };
            update = update.with_task_status(index, status, state.retry.attempts);
        }
        if status == TaskStatus::Abandoned {
            let attempts = state.retry.attempts;
            let err = LoomError::RetryBudgetExhausted { task: index, attempts };
            tracing::warn!(session = %state.session_id, task = index, "{}", err);
        }
        state.apply(update)?;

        tracing::info!(session = %state.session_id, task = index, status = status.as_str(), "Task finished");
        self.events.emit(PipelineEvent::TaskAdvanced {
            session_id: state.session_id.clone(),
            task: index,
            status: status.as_str().into(),
        });
        self.checkpoint(SessionCheckpoint::new(index, status.as_str(), state)).await;
        Ok(())
    }

    async fn checkpoint(&self, checkpoint: SessionCheckpoint) {
        if !self.config.checkpoints {
            return;
        }
        let session_id = checkpoint.state.session_id.clone();
        let task = checkpoint.task;
        match save_checkpoint(&checkpoint, &checkpoint.state.workspace).await {
            Ok(_) => self.events.emit(PipelineEvent::CheckpointSaved { session_id, task }),
            Err(e) => tracing::warn!(session = %session_id, task, error = %e, "Failed to write checkpoint"),
        }
    }

    /// Put the state into a terminal phase. A phase-only patch always passes
    /// the state checks.
    fn terminate(state: &mut SessionState, phase: SessionPhase) {
        if state.apply(StateUpdate::new().with_phase(phase)).is_err() {
            state.phase = phase;
        }
    }

    async fn fail(&self, mut run: Run, error: LoomError) -> SessionReport {
        let phase = run.state.phase;
        let session_id = run.state.session_id.clone();
        tracing::error!(
            session = %session_id,
            last_stage = ?run.last_stage,
            phase = phase.as_str(),
            error = %error,
            "Session failed"
        );
        self.events.emit(PipelineEvent::SessionFailed {
            session_id: session_id.clone(),
            last_stage: run.last_stage.map(|s| s.to_string()),
            error: error.to_string(),
        });
        if !phase.is_terminal() {
            Self::terminate(&mut run.state, SessionPhase::Failed);
            let checkpoint = SessionCheckpoint::new(run.state.current_task, "failed", &run.state)
                .with_resume_phase(phase);
            self.checkpoint(checkpoint).await;
        }
        let failure = SessionFailure {
            session_id,
            last_stage: run.last_stage,
            phase,
            error,
        };
        run.finish(SessionOutcome::Failed(failure))
    }

    async fn cancelled(&self, mut run: Run, reason: LoomError) -> SessionReport {
        let phase = run.state.phase;
        tracing::warn!(
            session = %run.state.session_id,
            phase = phase.as_str(),
            reason = %reason,
            "Session cancelled"
        );
        self.events.emit(PipelineEvent::SessionCancelled {
            session_id: run.state.session_id.clone(),
            last_stage: run.last_stage.map(|s| s.to_string()),
        });
        Self::terminate(&mut run.state, SessionPhase::Cancelled);
        let checkpoint = SessionCheckpoint::new(run.state.current_task, "cancelled", &run.state)
            .with_resume_phase(phase);
        self.checkpoint(checkpoint).await;
        let last_stage = run.last_stage;
        run.finish(SessionOutcome::Cancelled { last_stage })
    }

    async fn saved(&self, run: Run) -> SessionReport {
        let report = run.finish(SessionOutcome::Saved);
        tracing::info!(
            session = %report.state.session_id,
            passed = report.passed_tasks(),
            abandoned = report.abandoned_tasks(),
            invocations = report.invocations,
            "Session saved"
        );
        self.events.emit(PipelineEvent::SessionSaved {
            session_id: report.state.session_id.clone(),
            passed_tasks: report.passed_tasks(),
            abandoned_tasks: report.abandoned_tasks(),
            invocations: report.invocations,
            duration_ms: report.duration_ms,
        });
        self.checkpoint(SessionCheckpoint::new(report.state.current_task, "saved", &report.state))
            .await;
        report
    }
}

/// Bookkeeping for one call to [`PipelineExecutor::run`].
struct Run {
    state: SessionState,
    invocations: usize,
    last_stage: Option<StageId>,
    started: Instant,
}

impl Run {
    fn finish(self, outcome: SessionOutcome) -> SessionReport {
        SessionReport {
            state: self.state,
            outcome,
            invocations: self.invocations,
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
