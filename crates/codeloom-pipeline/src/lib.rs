//! Session orchestration engine, stages, routing and session management.
//!
//! This crate implements the codeloom pipeline: the stage contract and
//! registry, the pure router, the file accumulator, the retry/critic
//! controller, the orchestrator loop with its iteration budget, checkpoints,
//! plan validation and the session/workspace manager.

pub mod accumulator;
pub mod checkpoint;
pub mod collaborators;
pub mod config;
pub mod critic;
pub mod engine;
pub mod events;
pub mod external;
pub mod fs_store;
pub mod plan_check;
pub mod retry;
pub mod router;
pub mod session;
pub mod stage;
pub mod stages;
pub mod summary;

pub use accumulator::{accumulate, infer_symbols, merge_draft, retract};
pub use checkpoint::{load_checkpoint, load_task_checkpoint, save_checkpoint, SessionCheckpoint};
pub use collaborators::{
    test_artifact_path, ArtifactStore, CodeGenerator, Collaborators, ContextProvider,
    ExecutionRunner, FileContextProvider, GeneratedCode, Plan, Planner, TestGenerator,
};
pub use config::EngineConfig;
pub use critic::{critique, CriticPolicy};
pub use engine::{PipelineExecutor, SessionFailure, SessionOutcome, SessionReport};
pub use events::{EventEmitter, PipelineEvent};
pub use external::{AgentCommand, ShellTestRunner, UncheckedRunner};
pub use fs_store::FsArtifactStore;
pub use plan_check::{validate_plan, validate_plan_or_raise, Diagnostic, PlanRule, Severity};
pub use retry::BackoffPolicy;
pub use router::{route, Route, Router};
pub use session::{
    resume_session, run_session, SessionFilter, SessionHandle, SessionManager, SessionRecord,
    SessionStatus,
};
pub use stage::{DynStage, Stage, StageId, StageRegistry};
pub use stages::standard_registry;
pub use summary::{render_summary, SUMMARY_FILE};
