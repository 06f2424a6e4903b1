//! Built-in stages, one per workflow node.
//!
//! Each stage wraps one collaborator (or one pure function) and answers with
//! a patch restricted to the fields its [`StageId`] owns.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use codeloom_types::{
    Draft, FileRecord, LoomError, Result, SessionState, StateUpdate, Task, Verdict,
};

use crate::accumulator::merge_draft;
use crate::collaborators::{
    ArtifactStore, CodeGenerator, Collaborators, ContextProvider, ExecutionRunner, Planner,
    TestGenerator,
};
use crate::config::EngineConfig;
use crate::critic::{critique, CriticPolicy};
use crate::plan_check::{validate_plan_or_raise, Severity};
use crate::stage::{Stage, StageId, StageRegistry};
use crate::summary::render_summary;

fn active_task(state: &SessionState) -> Result<&Task> {
    state.current().ok_or_else(|| {
        LoomError::Invariant(format!(
            "no active task (pointer {} of {})",
            state.current_task,
            state.tasks.len()
        ))
    })
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

pub struct PlanStage {
    planner: Arc<dyn Planner>,
}

impl PlanStage {
    pub fn new(planner: Arc<dyn Planner>) -> Self {
        Self { planner }
    }
}

#[async_trait]
impl Stage for PlanStage {
    fn id(&self) -> StageId {
        StageId::Plan
    }

    async fn execute(&self, state: &SessionState) -> Result<StateUpdate> {
        let plan = self.planner.plan(&state.requirements).await?;
        for diag in validate_plan_or_raise(&plan)? {
            match diag.severity {
                Severity::Warning => tracing::warn!(rule = %diag.rule, "{}", diag.message),
                _ => tracing::debug!(rule = %diag.rule, "{}", diag.message),
            }
        }

        let tasks: Vec<Task> = plan
            .tasks
            .into_iter()
            .enumerate()
            .map(|(index, t)| Task {
                index,
                target_file: t.target_file,
                description: t.description,
                action: t.action,
                status: Default::default(),
                attempts: 0,
            })
            .collect();
        let files: BTreeMap<String, FileRecord> = plan
            .files
            .into_iter()
            .map(|f| (f.path.clone(), FileRecord::new(f.path, f.purpose)))
            .collect();

        tracing::info!(
            session = %state.session_id,
            tasks = tasks.len(),
            files = files.len(),
            "Plan accepted"
        );
        Ok(StateUpdate::new().with_plan(tasks, files))
    }
}

// ---------------------------------------------------------------------------
// Retrieve
// ---------------------------------------------------------------------------

pub struct RetrieveStage {
    provider: Arc<dyn ContextProvider>,
}

impl RetrieveStage {
    pub fn new(provider: Arc<dyn ContextProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Stage for RetrieveStage {
    fn id(&self) -> StageId {
        StageId::Retrieve
    }

    async fn execute(&self, state: &SessionState) -> Result<StateUpdate> {
        let task = active_task(state)?;
        let record = state.files.get(&task.target_file);
        let context = self.provider.retrieve(task, record).await?;
        Ok(StateUpdate::new().with_context(context))
    }
}

// ---------------------------------------------------------------------------
// Generate
// ---------------------------------------------------------------------------

pub struct GenerateStage {
    generator: Arc<dyn CodeGenerator>,
}

impl GenerateStage {
    pub fn new(generator: Arc<dyn CodeGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Stage for GenerateStage {
    fn id(&self) -> StageId {
        StageId::Generate
    }

    async fn execute(&self, state: &SessionState) -> Result<StateUpdate> {
        let task = active_task(state)?;
        let context = state.scratch.context.as_deref().unwrap_or_default();
        let retry = match state.retry.last_verdict {
            Some(Verdict::Failed) => state.retry.last_failure.as_ref(),
            _ => None,
        };
        if let Some(ctx) = retry {
            tracing::debug!(
                task = task.index,
                attempt = ctx.attempt + 1,
                kind = ctx.kind.as_str(),
                "Regenerating with retry context"
            );
        }
        let generated = self.generator.generate(task, context, retry).await?;
        Ok(StateUpdate::new().with_draft(Draft {
            task: task.index,
            code: generated.code,
            symbols: generated.symbols,
            test_code: generated.test_code,
        }))
    }
}

// ---------------------------------------------------------------------------
// Accumulate
// ---------------------------------------------------------------------------

/// Merges the draft into its file. Pure: no collaborator.
pub struct AccumulateStage;

#[async_trait]
impl Stage for AccumulateStage {
    fn id(&self) -> StageId {
        StageId::Accumulate
    }

    async fn execute(&self, state: &SessionState) -> Result<StateUpdate> {
        let task = active_task(state)?;
        let draft = state
            .scratch
            .draft
            .as_ref()
            .filter(|d| d.task == task.index)
            .ok_or_else(|| LoomError::Invariant(format!("no draft for task {}", task.index)))?;
        let record = merge_draft(&state.files, task, draft)?;
        tracing::debug!(
            task = task.index,
            file = %record.path,
            fragments = record.fragments.len(),
            "Fragment accumulated"
        );
        Ok(StateUpdate::new().with_file(record))
    }
}

// ---------------------------------------------------------------------------
// Execute
// ---------------------------------------------------------------------------

pub struct ExecuteStage {
    runner: Arc<dyn ExecutionRunner>,
}

impl ExecuteStage {
    pub fn new(runner: Arc<dyn ExecutionRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Stage for ExecuteStage {
    fn id(&self) -> StageId {
        StageId::Execute
    }

    async fn execute(&self, state: &SessionState) -> Result<StateUpdate> {
        let task = active_task(state)?;
        let record = state.files.get(&task.target_file).ok_or_else(|| {
            LoomError::Invariant(format!("file '{}' was never accumulated", task.target_file))
        })?;
        let test_code = state
            .scratch
            .draft
            .as_ref()
            .and_then(|d| d.test_code.as_deref());
        let feedback = self.runner.run(task, record, test_code).await?;
        tracing::debug!(task = task.index, pass = feedback.overall_pass, summary = %feedback.summary, "Execution finished");
        Ok(StateUpdate::new().with_feedback(feedback))
    }
}

// ---------------------------------------------------------------------------
// Critique
// ---------------------------------------------------------------------------

pub struct CritiqueStage {
    policy: CriticPolicy,
}

impl CritiqueStage {
    pub fn new(policy: CriticPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Stage for CritiqueStage {
    fn id(&self) -> StageId {
        StageId::Critique
    }

    async fn execute(&self, state: &SessionState) -> Result<StateUpdate> {
        critique(state, self.policy)
    }
}

// ---------------------------------------------------------------------------
// GenerateTests
// ---------------------------------------------------------------------------

pub struct GenerateTestsStage {
    generator: Arc<dyn TestGenerator>,
}

impl GenerateTestsStage {
    pub fn new(generator: Arc<dyn TestGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Stage for GenerateTestsStage {
    fn id(&self) -> StageId {
        StageId::GenerateTests
    }

    /// A failing collaborator yields no test artifacts; the session still saves.
    async fn execute(&self, state: &SessionState) -> Result<StateUpdate> {
        let artifacts = match self.generator.generate_tests(&state.files).await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                tracing::warn!(session = %state.session_id, error = %e, "Test generation failed, continuing without tests");
                Vec::new()
            }
        };
        Ok(StateUpdate::new().with_test_artifacts(artifacts))
    }
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

pub struct SaveStage {
    store: Arc<dyn ArtifactStore>,
}

impl SaveStage {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage for SaveStage {
    fn id(&self) -> StageId {
        StageId::Save
    }

    async fn execute(&self, state: &SessionState) -> Result<StateUpdate> {
        let summary = render_summary(state);
        let saved = self
            .store
            .save(&state.workspace, &state.files, &state.test_artifacts, &summary)
            .await
            .map_err(|e| match e {
                LoomError::Persistence(_) => e,
                other => LoomError::Persistence(other.to_string()),
            })?;
        tracing::info!(session = %state.session_id, artifacts = saved.len(), "Artifacts saved");
        Ok(StateUpdate::new().with_saved_artifacts(saved))
    }
}

// ---------------------------------------------------------------------------
// Default registry factory
// ---------------------------------------------------------------------------

/// One stage for every workflow node, wired to `collaborators`.
pub fn standard_registry(collaborators: &Collaborators, config: &EngineConfig) -> StageRegistry {
    let mut reg = StageRegistry::new();
    reg.register(PlanStage::new(collaborators.planner.clone()));
    reg.register(RetrieveStage::new(collaborators.context.clone()));
    reg.register(GenerateStage::new(collaborators.generator.clone()));
    reg.register(AccumulateStage);
    reg.register(ExecuteStage::new(collaborators.runner.clone()));
    reg.register(CritiqueStage::new(CriticPolicy {
        findings: config.finding_policy,
        discard_abandoned: config.discard_abandoned_fragments,
    }));
    reg.register(GenerateTestsStage::new(collaborators.tests.clone()));
    reg.register(SaveStage::new(collaborators.store.clone()));
    reg
}
