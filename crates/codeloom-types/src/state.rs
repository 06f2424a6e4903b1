//! The session state document and the typed patch stages return.
//!
//! A [`SessionState`] has a fixed schema: every stage reads the same snapshot
//! and answers with a [`StateUpdate`] naming only the fields it changes. The
//! orchestrator applies the whole patch through [`SessionState::apply`], which
//! validates the invariants first and mutates nothing on rejection.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::feedback::{ExecutionFeedback, FailureKind};
use crate::{LoomError, Result};

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Create,
    #[default]
    Append,
    Modify,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::Create => "create",
            TaskAction::Append => "append",
            TaskAction::Modify => "modify",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Passed,
    Abandoned,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Passed => "passed",
            TaskStatus::Abandoned => "abandoned",
        }
    }
}

/// One unit of planned work targeting one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Ordinal position in the execution order. Never reassigned.
    pub index: usize,
    pub target_file: String,
    pub description: String,
    #[serde(default)]
    pub action: TaskAction,
    #[serde(default)]
    pub status: TaskStatus,
    /// Attempts consumed when the task reached its final status.
    #[serde(default)]
    pub attempts: usize,
}

/// A task as returned by the planner, before an index is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub target_file: String,
    pub description: String,
    #[serde(default)]
    pub action: TaskAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedFile {
    pub path: String,
    #[serde(default)]
    pub purpose: String,
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// A block of code contributed by one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub task: usize,
    pub code: String,
    #[serde(default)]
    pub symbols: Vec<String>,
}

/// Accumulated code for one output artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub purpose: String,
    #[serde(default)]
    pub fragments: Vec<Fragment>,
    #[serde(default)]
    pub symbols: BTreeSet<String>,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            purpose: purpose.into(),
            fragments: Vec::new(),
            symbols: BTreeSet::new(),
        }
    }

    /// Full file text: fragments joined by a blank line.
    pub fn content(&self) -> String {
        self.fragments
            .iter()
            .map(|f| f.code.trim_end())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn contains_symbol(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    /// The task whose fragment declared `symbol`, if any.
    pub fn symbol_owner(&self, symbol: &str) -> Option<usize> {
        self.fragments
            .iter()
            .find(|f| f.symbols.iter().any(|s| s == symbol))
            .map(|f| f.task)
    }

    pub fn fragment_for(&self, task: usize) -> Option<&Fragment> {
        self.fragments.iter().find(|f| f.task == task)
    }

    /// The symbol set derived from the fragments alone.
    pub fn declared_symbols(&self) -> BTreeSet<String> {
        self.fragments
            .iter()
            .flat_map(|f| f.symbols.iter().cloned())
            .collect()
    }
}

/// A named text blob handed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub content: String,
}

// ---------------------------------------------------------------------------
// Retry bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed,
}

/// Whether a retry re-runs retrieval or reuses the context already fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPolicy {
    #[default]
    Refresh,
    Reuse,
}

/// What the generator is told about the previous failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryContext {
    pub kind: FailureKind,
    pub details: String,
    /// The attempt that failed (1-based).
    pub attempt: usize,
    pub max_attempts: usize,
    /// Details of earlier failures for the same task, oldest first, at most 3.
    #[serde(default)]
    pub previous_errors: Vec<String>,
    #[serde(default)]
    pub failed_code: Option<String>,
}

/// Bounded-retry counters for the active task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Failed attempts so far. Never exceeds `max_attempts`.
    pub attempts: usize,
    pub max_attempts: usize,
    #[serde(default)]
    pub context_policy: ContextPolicy,
    #[serde(default)]
    pub last_verdict: Option<Verdict>,
    #[serde(default)]
    pub last_failure: Option<RetryContext>,
}

impl RetryState {
    pub fn fresh(max_attempts: usize, context_policy: ContextPolicy) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            context_policy,
            last_verdict: None,
            last_failure: None,
        }
    }

    /// Same limits, counters cleared. Used when the task pointer advances.
    pub fn reset(&self) -> Self {
        Self::fresh(self.max_attempts, self.context_policy)
    }

    /// No attempt of the active task has been judged yet.
    pub fn is_fresh(&self) -> bool {
        self.attempts == 0 && self.last_verdict.is_none()
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

// ---------------------------------------------------------------------------
// Scratch slot
// ---------------------------------------------------------------------------

/// Output of the generation stage for the active task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub task: usize,
    pub code: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub test_code: Option<String>,
}

/// Intermediate results passed between adjacent stages of one attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scratch {
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub draft: Option<Draft>,
    #[serde(default)]
    pub feedback: Option<ExecutionFeedback>,
}

// ---------------------------------------------------------------------------
// SessionPhase
// ---------------------------------------------------------------------------

/// Lifecycle phase of a session: the last stage that completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Created,
    Planned,
    Retrieved,
    Generated,
    Accumulated,
    Executed,
    Critiqued,
    Finalized,
    Saved,
    Failed,
    Cancelled,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionPhase::Saved | SessionPhase::Failed | SessionPhase::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Created => "created",
            SessionPhase::Planned => "planned",
            SessionPhase::Retrieved => "retrieved",
            SessionPhase::Generated => "generated",
            SessionPhase::Accumulated => "accumulated",
            SessionPhase::Executed => "executed",
            SessionPhase::Critiqued => "critiqued",
            SessionPhase::Finalized => "finalized",
            SessionPhase::Saved => "saved",
            SessionPhase::Failed => "failed",
            SessionPhase::Cancelled => "cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// The state document owned by exactly one session's orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub workspace: PathBuf,
    pub requirements: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub files: BTreeMap<String, FileRecord>,
    pub tasks: Vec<Task>,
    /// Index of the active task; `tasks.len()` once every task is processed.
    pub current_task: usize,
    pub retry: RetryState,
    #[serde(default)]
    pub scratch: Scratch,
    pub phase: SessionPhase,
    #[serde(default)]
    pub test_artifacts: Vec<Artifact>,
    #[serde(default)]
    pub saved_artifacts: Vec<String>,
    /// Incremented on every applied update.
    pub version: u64,
}

impl SessionState {
    pub fn new(
        session_id: impl Into<String>,
        workspace: impl Into<PathBuf>,
        requirements: impl Into<String>,
        max_attempts: usize,
        context_policy: ContextPolicy,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            workspace: workspace.into(),
            requirements: requirements.into(),
            created_at: chrono::Utc::now(),
            files: BTreeMap::new(),
            tasks: Vec::new(),
            current_task: 0,
            retry: RetryState::fresh(max_attempts, context_policy),
            scratch: Scratch::default(),
            phase: SessionPhase::Created,
            test_artifacts: Vec::new(),
            saved_artifacts: Vec::new(),
            version: 0,
        }
    }

    /// The active task, or `None` once every task has been processed.
    pub fn current(&self) -> Option<&Task> {
        self.tasks.get(self.current_task)
    }

    pub fn all_tasks_processed(&self) -> bool {
        self.current_task >= self.tasks.len()
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(move |t| t.status == status)
    }

    /// Apply a patch atomically: every check runs before anything is written.
    pub fn apply(&mut self, update: StateUpdate) -> Result<()> {
        self.check(&update)?;

        let StateUpdate {
            tasks,
            files,
            file,
            context,
            draft,
            feedback,
            retry,
            task_status,
            current_task,
            test_artifacts,
            saved_artifacts,
            phase,
        } = update;

        if let Some(tasks) = tasks {
            self.tasks = tasks;
        }
        if let Some(files) = files {
            self.files = files;
        }
        if let Some(record) = file {
            self.files.insert(record.path.clone(), record);
        }
        if let Some(context) = context {
            self.scratch.context = context;
        }
        if let Some(draft) = draft {
            self.scratch.draft = draft;
        }
        if let Some(feedback) = feedback {
            self.scratch.feedback = feedback;
        }
        if let Some(retry) = retry {
            self.retry = retry;
        }
        if let Some(change) = task_status {
            let task = &mut self.tasks[change.index];
            task.status = change.status;
            task.attempts = change.attempts;
        }
        if let Some(index) = current_task {
            self.current_task = index;
        }
        if let Some(artifacts) = test_artifacts {
            self.test_artifacts = artifacts;
        }
        if let Some(saved) = saved_artifacts {
            self.saved_artifacts = saved;
        }
        if let Some(phase) = phase {
            self.phase = phase;
        }
        self.version += 1;
        tracing::trace!(session = %self.session_id, version = self.version, "State update applied");
        Ok(())
    }

    fn check(&self, update: &StateUpdate) -> Result<()> {
        if let Some(tasks) = &update.tasks {
            if !self.tasks.is_empty() {
                return Err(LoomError::Invariant(
                    "task list is immutable once planned".into(),
                ));
            }
            if let Some(bad) = tasks.iter().enumerate().find(|(i, t)| t.index != *i) {
                return Err(LoomError::Invariant(format!(
                    "task at position {} carries index {}",
                    bad.0, bad.1.index
                )));
            }
        }
        let task_count = update.tasks.as_ref().map_or(self.tasks.len(), Vec::len);

        if let Some(index) = update.current_task {
            if index < self.current_task {
                return Err(LoomError::Invariant(format!(
                    "task pointer cannot move backwards ({} -> {})",
                    self.current_task, index
                )));
            }
            if index > task_count {
                return Err(LoomError::Invariant(format!(
                    "task pointer {} out of range (0..={})",
                    index, task_count
                )));
            }
        }

        if let Some(change) = &update.task_status {
            let task = self.tasks.get(change.index).ok_or_else(|| {
                LoomError::Invariant(format!("no task with index {}", change.index))
            })?;
            if task.status != TaskStatus::Pending && task.status != change.status {
                return Err(LoomError::Invariant(format!(
                    "task {} already finished as {:?}",
                    change.index, task.status
                )));
            }
        }

        if let Some(retry) = &update.retry {
            if retry.attempts > retry.max_attempts {
                return Err(LoomError::Invariant(format!(
                    "attempts {} exceed maximum {}",
                    retry.attempts, retry.max_attempts
                )));
            }
        }

        let records = update
            .files
            .iter()
            .flat_map(|m| m.values())
            .chain(update.file.iter());
        for record in records {
            if record.symbols != record.declared_symbols() {
                return Err(LoomError::Invariant(format!(
                    "symbol set of '{}' does not match its fragments",
                    record.path
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StateUpdate: typed partial update
// ---------------------------------------------------------------------------

/// Identifies one writable field of the state document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Tasks,
    Files,
    Context,
    Draft,
    Feedback,
    Retry,
    TaskStatus,
    CurrentTask,
    TestArtifacts,
    SavedArtifacts,
    Phase,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Tasks => "tasks",
            Field::Files => "files",
            Field::Context => "context",
            Field::Draft => "draft",
            Field::Feedback => "feedback",
            Field::Retry => "retry",
            Field::TaskStatus => "task_status",
            Field::CurrentTask => "current_task",
            Field::TestArtifacts => "test_artifacts",
            Field::SavedArtifacts => "saved_artifacts",
            Field::Phase => "phase",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusChange {
    pub index: usize,
    pub status: TaskStatus,
    pub attempts: usize,
}

/// A set of field→value pairs. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub tasks: Option<Vec<Task>>,
    pub files: Option<BTreeMap<String, FileRecord>>,
    pub file: Option<FileRecord>,
    pub context: Option<Option<String>>,
    pub draft: Option<Option<Draft>>,
    pub feedback: Option<Option<ExecutionFeedback>>,
    pub retry: Option<RetryState>,
    pub task_status: Option<TaskStatusChange>,
    pub current_task: Option<usize>,
    pub test_artifacts: Option<Vec<Artifact>>,
    pub saved_artifacts: Option<Vec<String>>,
    pub phase: Option<SessionPhase>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, tasks: Vec<Task>, files: BTreeMap<String, FileRecord>) -> Self {
        self.tasks = Some(tasks);
        self.files = Some(files);
        self
    }

    pub fn with_file(mut self, record: FileRecord) -> Self {
        self.file = Some(record);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(Some(context.into()));
        self
    }

    pub fn with_draft(mut self, draft: Draft) -> Self {
        self.draft = Some(Some(draft));
        self
    }

    /// Drop a draft that belongs to an earlier attempt.
    pub fn clear_draft(mut self) -> Self {
        self.draft = Some(None);
        self
    }

    pub fn with_feedback(mut self, feedback: ExecutionFeedback) -> Self {
        self.feedback = Some(Some(feedback));
        self
    }

    /// Drop the consumed feedback from the scratch slot.
    pub fn consume_feedback(mut self) -> Self {
        self.feedback = Some(None);
        self
    }

    /// Clear every scratch field. Used when the task pointer advances.
    pub fn clear_scratch(mut self) -> Self {
        self.context = Some(None);
        self.draft = Some(None);
        self.feedback = Some(None);
        self
    }

    pub fn with_retry(mut self, retry: RetryState) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_task_status(mut self, index: usize, status: TaskStatus, attempts: usize) -> Self {
        self.task_status = Some(TaskStatusChange {
            index,
            status,
            attempts,
        });
        self
    }

    pub fn with_current_task(mut self, index: usize) -> Self {
        self.current_task = Some(index);
        self
    }

    pub fn with_test_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.test_artifacts = Some(artifacts);
        self
    }

    pub fn with_saved_artifacts(mut self, saved: Vec<String>) -> Self {
        self.saved_artifacts = Some(saved);
        self
    }

    pub fn with_phase(mut self, phase: SessionPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Every field this patch writes.
    pub fn touched(&self) -> Vec<Field> {
        let mut fields = Vec::new();
        if self.tasks.is_some() {
            fields.push(Field::Tasks);
        }
        if self.files.is_some() || self.file.is_some() {
            fields.push(Field::Files);
        }
        if self.context.is_some() {
            fields.push(Field::Context);
        }
        if self.draft.is_some() {
            fields.push(Field::Draft);
        }
        if self.feedback.is_some() {
            fields.push(Field::Feedback);
        }
        if self.retry.is_some() {
            fields.push(Field::Retry);
        }
        if self.task_status.is_some() {
            fields.push(Field::TaskStatus);
        }
        if self.current_task.is_some() {
            fields.push(Field::CurrentTask);
        }
        if self.test_artifacts.is_some() {
            fields.push(Field::TestArtifacts);
        }
        if self.saved_artifacts.is_some() {
            fields.push(Field::SavedArtifacts);
        }
        if self.phase.is_some() {
            fields.push(Field::Phase);
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.touched().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(index: usize, file: &str) -> Task {
        Task {
            index,
            target_file: file.into(),
            description: format!("task {index}"),
            action: TaskAction::Append,
            status: TaskStatus::Pending,
            attempts: 0,
        }
    }

    fn planned_state(n: usize) -> SessionState {
        let mut state = SessionState::new("s1", "/tmp/s1", "build a calculator", 3, ContextPolicy::Refresh);
        let tasks = (0..n).map(|i| task(i, "calc.py")).collect();
        let mut files = BTreeMap::new();
        files.insert("calc.py".to_string(), FileRecord::new("calc.py", "arithmetic"));
        state.apply(StateUpdate::new().with_plan(tasks, files)).unwrap();
        state
    }

    #[test]
    fn new_state_is_created_and_empty() {
        let state = SessionState::new("s1", "/tmp/s1", "req", 3, ContextPolicy::Reuse);
        assert_eq!(state.phase, SessionPhase::Created);
        assert_eq!(state.current_task, 0);
        assert!(state.all_tasks_processed());
        assert!(state.retry.is_fresh());
        assert_eq!(state.retry.context_policy, ContextPolicy::Reuse);
        assert_eq!(state.version, 0);
    }

    #[test]
    fn apply_bumps_version_and_sets_fields() {
        let mut state = planned_state(2);
        assert_eq!(state.version, 1);
        state
            .apply(StateUpdate::new().with_context("ctx").with_phase(SessionPhase::Retrieved))
            .unwrap();
        assert_eq!(state.scratch.context.as_deref(), Some("ctx"));
        assert_eq!(state.phase, SessionPhase::Retrieved);
        assert_eq!(state.version, 2);
    }

    #[test]
    fn pointer_cannot_move_backwards() {
        let mut state = planned_state(2);
        state.apply(StateUpdate::new().with_current_task(1)).unwrap();
        let err = state.apply(StateUpdate::new().with_current_task(0)).unwrap_err();
        assert!(matches!(err, LoomError::Invariant(_)));
        assert_eq!(state.current_task, 1);
    }

    #[test]
    fn pointer_may_reach_but_not_pass_task_count() {
        let mut state = planned_state(1);
        state.apply(StateUpdate::new().with_current_task(1)).unwrap();
        assert!(state.all_tasks_processed());
        assert!(state.apply(StateUpdate::new().with_current_task(2)).is_err());
    }

    #[test]
    fn rejected_update_writes_nothing() {
        let mut state = planned_state(1);
        let before = state.clone();
        let bad = StateUpdate::new()
            .with_context("should not land")
            .with_current_task(5);
        assert!(state.apply(bad).is_err());
        assert_eq!(state, before);
    }

    #[test]
    fn tasks_are_immutable_once_planned() {
        let mut state = planned_state(1);
        let err = state
            .apply(StateUpdate::new().with_plan(vec![task(0, "x.py")], BTreeMap::new()))
            .unwrap_err();
        assert!(err.to_string().contains("immutable"));
    }

    #[test]
    fn task_indices_must_match_positions() {
        let mut state = SessionState::new("s", "/tmp/s", "r", 3, ContextPolicy::Refresh);
        let err = state
            .apply(StateUpdate::new().with_plan(vec![task(1, "a.py")], BTreeMap::new()))
            .unwrap_err();
        assert!(matches!(err, LoomError::Invariant(_)));
    }

    #[test]
    fn retry_attempts_bounded_by_max() {
        let mut state = planned_state(1);
        let mut retry = state.retry.clone();
        retry.attempts = 4;
        assert!(state.apply(StateUpdate::new().with_retry(retry)).is_err());
    }

    #[test]
    fn finished_task_status_is_final() {
        let mut state = planned_state(1);
        state
            .apply(StateUpdate::new().with_task_status(0, TaskStatus::Passed, 1))
            .unwrap();
        let err = state
            .apply(StateUpdate::new().with_task_status(0, TaskStatus::Abandoned, 3))
            .unwrap_err();
        assert!(matches!(err, LoomError::Invariant(_)));
        assert_eq!(state.tasks[0].status, TaskStatus::Passed);
        assert_eq!(state.tasks[0].attempts, 1);
    }

    #[test]
    fn file_symbols_must_match_fragments() {
        let mut state = planned_state(1);
        let mut record = FileRecord::new("calc.py", "arithmetic");
        record.symbols.insert("ghost".into());
        assert!(state.apply(StateUpdate::new().with_file(record)).is_err());
    }

    #[test]
    fn file_record_content_joins_fragments() {
        let mut record = FileRecord::new("calc.py", "arithmetic");
        record.fragments.push(Fragment {
            task: 0,
            code: "def add(a, b):\n    return a + b\n".into(),
            symbols: vec!["add".into()],
        });
        record.fragments.push(Fragment {
            task: 1,
            code: "def sub(a, b):\n    return a - b".into(),
            symbols: vec!["sub".into()],
        });
        record.symbols = record.declared_symbols();
        assert_eq!(
            record.content(),
            "def add(a, b):\n    return a + b\n\ndef sub(a, b):\n    return a - b"
        );
        assert_eq!(record.symbol_owner("sub"), Some(1));
        assert!(record.fragment_for(0).is_some());
        assert!(record.fragment_for(2).is_none());
    }

    #[test]
    fn touched_lists_written_fields() {
        let update = StateUpdate::new()
            .with_file(FileRecord::new("a.py", ""))
            .consume_feedback()
            .with_phase(SessionPhase::Accumulated);
        assert_eq!(update.touched(), vec![Field::Files, Field::Feedback, Field::Phase]);
        assert!(StateUpdate::new().is_empty());
    }

    #[test]
    fn retry_state_reset_keeps_limits() {
        let retry = RetryState {
            attempts: 2,
            max_attempts: 5,
            context_policy: ContextPolicy::Reuse,
            last_verdict: Some(Verdict::Failed),
            last_failure: None,
        };
        assert!(retry.can_retry());
        assert!(!retry.is_fresh());
        let reset = retry.reset();
        assert!(reset.is_fresh());
        assert_eq!(reset.max_attempts, 5);
        assert_eq!(reset.context_policy, ContextPolicy::Reuse);
    }

    #[test]
    fn session_state_serializes_through_json() {
        let state = planned_state(2);
        let json = serde_json::to_string(&state).unwrap();
        let restored: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }
}
