//! Stage trait, dynamic dispatch wrapper, and stage registry.
//!
//! A stage reads a snapshot of the [`SessionState`] and answers with a
//! [`StateUpdate`]. It never mutates the state itself: the orchestrator checks
//! the patch against the fields the stage owns and applies it whole.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use codeloom_types::{Field, Result, SessionPhase, SessionState, StateUpdate};

// ---------------------------------------------------------------------------
// StageId
// ---------------------------------------------------------------------------

/// Identifies one node of the workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Plan,
    Retrieve,
    Generate,
    Accumulate,
    Execute,
    Critique,
    GenerateTests,
    Save,
}

impl StageId {
    pub const ALL: [StageId; 8] = [
        StageId::Plan,
        StageId::Retrieve,
        StageId::Generate,
        StageId::Accumulate,
        StageId::Execute,
        StageId::Critique,
        StageId::GenerateTests,
        StageId::Save,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Plan => "plan",
            StageId::Retrieve => "retrieve",
            StageId::Generate => "generate",
            StageId::Accumulate => "accumulate",
            StageId::Execute => "execute",
            StageId::Critique => "critique",
            StageId::GenerateTests => "generate_tests",
            StageId::Save => "save",
        }
    }

    /// Fields a stage with this id may write.
    pub fn owned_fields(&self) -> &'static [Field] {
        match self {
            StageId::Plan => &[Field::Tasks, Field::Files],
            StageId::Retrieve => &[Field::Context],
            StageId::Generate => &[Field::Draft],
            StageId::Accumulate => &[Field::Files],
            StageId::Execute => &[Field::Feedback],
            StageId::Critique => &[Field::Retry, Field::TaskStatus, Field::Files, Field::Feedback],
            StageId::GenerateTests => &[Field::TestArtifacts],
            StageId::Save => &[Field::SavedArtifacts],
        }
    }

    pub fn owns(&self, field: Field) -> bool {
        self.owned_fields().contains(&field)
    }

    /// Phase the session enters once this stage's update is applied.
    pub fn completed_phase(&self) -> SessionPhase {
        match self {
            StageId::Plan => SessionPhase::Planned,
            StageId::Retrieve => SessionPhase::Retrieved,
            StageId::Generate => SessionPhase::Generated,
            StageId::Accumulate => SessionPhase::Accumulated,
            StageId::Execute => SessionPhase::Executed,
            StageId::Critique => SessionPhase::Critiqued,
            StageId::GenerateTests => SessionPhase::Finalized,
            StageId::Save => SessionPhase::Saved,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Stage trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Stage: Send + Sync {
    /// Which workflow node this stage implements.
    fn id(&self) -> StageId;

    /// Produce a partial update from a read-only view of the state.
    ///
    /// A failing stage contributes nothing: the orchestrator discards the
    /// whole invocation.
    async fn execute(&self, state: &SessionState) -> Result<StateUpdate>;
}

// ---------------------------------------------------------------------------
// DynStage: object-safe wrapper
// ---------------------------------------------------------------------------

pub struct DynStage(Box<dyn Stage>);

impl DynStage {
    pub fn new(stage: impl Stage + 'static) -> Self {
        Self(Box::new(stage))
    }

    pub fn id(&self) -> StageId {
        self.0.id()
    }

    pub async fn execute(&self, state: &SessionState) -> Result<StateUpdate> {
        self.0.execute(state).await
    }
}

// ---------------------------------------------------------------------------
// StageRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StageRegistry {
    stages: HashMap<StageId, DynStage>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage, replacing any earlier one with the same id.
    pub fn register(&mut self, stage: impl Stage + 'static) {
        self.stages.insert(stage.id(), DynStage::new(stage));
    }

    pub fn get(&self, id: StageId) -> Option<&DynStage> {
        self.stages.get(&id)
    }

    pub fn has(&self, id: StageId) -> bool {
        self.stages.contains_key(&id)
    }

    /// Ids with no registered stage.
    pub fn missing(&self) -> Vec<StageId> {
        StageId::ALL
            .into_iter()
            .filter(|id| !self.has(*id))
            .collect()
    }
}
