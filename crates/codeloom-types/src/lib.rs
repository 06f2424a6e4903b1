//! Shared types, errors, and the session state document for the Codeloom pipeline.
//!
//! This crate provides the foundational types used across all other Codeloom crates:
//! - `LoomError`: unified error taxonomy
//! - `SessionState`: the typed state document threaded through every stage
//! - `StateUpdate`: the all-or-nothing patch a stage returns
//! - `ExecutionFeedback`: the outcome of running one attempt

pub mod feedback;
pub mod state;

pub use feedback::{
    AttemptError, ExecutionFeedback, FailureKind, Finding, FindingPolicy, FindingSeverity,
    TestOutcome,
};
pub use state::{
    Artifact, ContextPolicy, Draft, Field, FileRecord, Fragment, PlannedFile, PlannedTask,
    RetryContext, RetryState, Scratch, SessionPhase, SessionState, StateUpdate, Task, TaskAction,
    TaskStatus, TaskStatusChange, Verdict,
};

/// Unified error type for all Codeloom subsystems.
#[derive(Debug, thiserror::Error)]
pub enum LoomError {
    // === Collaborator Errors ===
    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Generation failed for task {task}: {message}")]
    Generation { task: usize, message: String },

    #[error("Execution environment error for task {task}: {message}")]
    ExecutionEnvironment { task: usize, message: String },

    #[error("Persistence failed: {0}")]
    Persistence(String),

    // === Accumulation Errors ===
    #[error("Symbol '{symbol}' already exists in '{file}'")]
    DuplicateSymbol { file: String, symbol: String },

    #[error("Malformed fragment for '{file}': {message}")]
    MalformedFragment { file: String, message: String },

    // === Orchestration Errors ===
    #[error("Iteration budget of {budget} stage invocations exceeded (last stage: {last_stage})")]
    IterationBudgetExceeded { budget: usize, last_stage: String },

    #[error("Retry budget exhausted for task {task} after {attempts} attempts")]
    RetryBudgetExhausted { task: usize, attempts: usize },

    #[error("Session cancelled")]
    Cancelled,

    #[error("Stage '{stage}' wrote field '{field}' it does not own")]
    StageContract { stage: String, field: String },

    #[error("State invariant violated: {0}")]
    Invariant(String),

    #[error("No stage registered for '{0}'")]
    UnknownStage(String),

    // === Session Errors ===
    #[error("Session '{0}' not found")]
    SessionNotFound(String),

    #[error("Session registry error: {0}")]
    Registry(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl LoomError {
    /// Returns `true` if the error belongs to a single task attempt and is
    /// resolved by the retry loop instead of terminating the session.
    pub fn is_attempt_local(&self) -> bool {
        matches!(
            self,
            LoomError::Generation { .. }
                | LoomError::ExecutionEnvironment { .. }
                | LoomError::DuplicateSymbol { .. }
                | LoomError::MalformedFragment { .. }
        )
    }

    /// Returns `true` if the error terminates the session in `failed`.
    pub fn is_fatal(&self) -> bool {
        !self.is_attempt_local()
            && !matches!(
                self,
                LoomError::RetryBudgetExhausted { .. } | LoomError::Cancelled
            )
    }

    /// The failure kind recorded against a task when this error consumes an attempt.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            LoomError::Generation { .. } => Some(FailureKind::Generation),
            LoomError::ExecutionEnvironment { .. } => Some(FailureKind::Environment),
            LoomError::DuplicateSymbol { .. } => Some(FailureKind::DuplicateSymbol),
            LoomError::MalformedFragment { .. } => Some(FailureKind::MalformedFragment),
            _ => None,
        }
    }
}

/// A convenience alias for `Result<T, LoomError>`.
pub type Result<T> = std::result::Result<T, LoomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_planning() {
        let err = LoomError::Planning("planner returned no tasks".into());
        assert_eq!(err.to_string(), "Planning failed: planner returned no tasks");
    }

    #[test]
    fn error_display_generation() {
        let err = LoomError::Generation {
            task: 2,
            message: "model refused".into(),
        };
        assert_eq!(err.to_string(), "Generation failed for task 2: model refused");
    }

    #[test]
    fn error_display_duplicate_symbol() {
        let err = LoomError::DuplicateSymbol {
            file: "calculator.py".into(),
            symbol: "add".into(),
        };
        assert_eq!(
            err.to_string(),
            "Symbol 'add' already exists in 'calculator.py'"
        );
    }

    #[test]
    fn error_display_iteration_budget() {
        let err = LoomError::IterationBudgetExceeded {
            budget: 5,
            last_stage: "generate".into(),
        };
        assert_eq!(
            err.to_string(),
            "Iteration budget of 5 stage invocations exceeded (last stage: generate)"
        );
    }

    #[test]
    fn error_display_stage_contract() {
        let err = LoomError::StageContract {
            stage: "retrieve".into(),
            field: "files".into(),
        };
        assert_eq!(
            err.to_string(),
            "Stage 'retrieve' wrote field 'files' it does not own"
        );
    }

    #[test]
    fn error_display_other() {
        let err = LoomError::Other("something went wrong".into());
        assert_eq!(err.to_string(), "something went wrong");
    }

    // --- classification ---

    #[test]
    fn attempt_local_errors() {
        assert!(LoomError::Generation { task: 0, message: "x".into() }.is_attempt_local());
        assert!(LoomError::ExecutionEnvironment { task: 0, message: "x".into() }.is_attempt_local());
        assert!(LoomError::DuplicateSymbol { file: "f".into(), symbol: "s".into() }.is_attempt_local());
        assert!(LoomError::MalformedFragment { file: "f".into(), message: "m".into() }.is_attempt_local());
        assert!(!LoomError::Planning("x".into()).is_attempt_local());
        assert!(!LoomError::Persistence("x".into()).is_attempt_local());
    }

    #[test]
    fn fatal_errors() {
        assert!(LoomError::Planning("x".into()).is_fatal());
        assert!(LoomError::Persistence("x".into()).is_fatal());
        assert!(LoomError::IterationBudgetExceeded { budget: 1, last_stage: "plan".into() }.is_fatal());
        assert!(LoomError::Invariant("x".into()).is_fatal());
        assert!(!LoomError::RetryBudgetExhausted { task: 0, attempts: 3 }.is_fatal());
        assert!(!LoomError::Cancelled.is_fatal());
        assert!(!LoomError::Generation { task: 0, message: "x".into() }.is_fatal());
    }

    #[test]
    fn failure_kind_mapping() {
        assert_eq!(
            LoomError::ExecutionEnvironment { task: 0, message: "x".into() }.failure_kind(),
            Some(FailureKind::Environment)
        );
        assert_eq!(
            LoomError::DuplicateSymbol { file: "f".into(), symbol: "s".into() }.failure_kind(),
            Some(FailureKind::DuplicateSymbol)
        );
        assert_eq!(LoomError::Persistence("x".into()).failure_kind(), None);
    }

    // --- From impls ---

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: LoomError = io_err.into();
        assert!(matches!(err, LoomError::Io(_)));
        assert!(err.to_string().contains("file not found"));
        assert!(err.is_fatal());
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: LoomError = json_err.into();
        assert!(matches!(err, LoomError::Json(_)));
    }
}
