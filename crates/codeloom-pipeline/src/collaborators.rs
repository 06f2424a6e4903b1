//! Boundary traits for the external collaborators the pipeline consumes.
//!
//! Planning, generation, execution, test generation and persistence are all
//! opaque to the orchestrator. Each is reached through one narrow async trait
//! and shared between stages as an `Arc<dyn _>`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use codeloom_types::{
    Artifact, ExecutionFeedback, FileRecord, PlannedFile, PlannedTask, Result, RetryContext, Task,
};

use crate::accumulator::retract;

// ---------------------------------------------------------------------------
// Collaborator payloads
// ---------------------------------------------------------------------------

/// What a planner returns: the ordered work list and the initial files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<PlannedTask>,
    #[serde(default)]
    pub files: Vec<PlannedFile>,
}

/// A code fragment from the generation collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedCode {
    pub code: String,
    /// Symbols the fragment defines. Inferred from the code when empty.
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Tests to run against this fragment, if the generator wrote any.
    #[serde(default)]
    pub test_code: Option<String>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Planner: Send + Sync {
    /// Break requirements into tasks. Empty or malformed output is a
    /// [`LoomError::Planning`](codeloom_types::LoomError::Planning) error.
    async fn plan(&self, requirements: &str) -> Result<Plan>;
}

#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Context for generating `task`, given its target file if one exists yet.
    async fn retrieve(&self, task: &Task, record: Option<&FileRecord>) -> Result<String>;
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Produce a fragment for `task`. `retry` describes the previous failed
    /// attempt when this is a retry.
    async fn generate(
        &self,
        task: &Task,
        context: &str,
        retry: Option<&RetryContext>,
    ) -> Result<GeneratedCode>;
}

#[async_trait]
pub trait ExecutionRunner: Send + Sync {
    /// Validate and test the file's current content after `task` merged
    /// into it.
    ///
    /// Test and lint failures belong in the returned feedback. Only
    /// infrastructure problems are errors.
    async fn run(
        &self,
        task: &Task,
        record: &FileRecord,
        test_code: Option<&str>,
    ) -> Result<ExecutionFeedback>;
}

#[async_trait]
pub trait TestGenerator: Send + Sync {
    async fn generate_tests(&self, files: &BTreeMap<String, FileRecord>) -> Result<Vec<Artifact>>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write every artifact under `root` and return the written identifiers.
    async fn save(
        &self,
        root: &Path,
        files: &BTreeMap<String, FileRecord>,
        tests: &[Artifact],
        summary: &str,
    ) -> Result<Vec<String>>;
}

/// The full set of collaborators one session needs.
#[derive(Clone)]
pub struct Collaborators {
    pub planner: Arc<dyn Planner>,
    pub context: Arc<dyn ContextProvider>,
    pub generator: Arc<dyn CodeGenerator>,
    pub runner: Arc<dyn ExecutionRunner>,
    pub tests: Arc<dyn TestGenerator>,
    pub store: Arc<dyn ArtifactStore>,
}

// ---------------------------------------------------------------------------
// Built-in context provider
// ---------------------------------------------------------------------------

/// Context built from the session's own accumulated code: the target file's
/// purpose and the fragments other tasks already committed to it.
pub struct FileContextProvider;

#[async_trait]
impl ContextProvider for FileContextProvider {
    async fn retrieve(&self, task: &Task, record: Option<&FileRecord>) -> Result<String> {
        let Some(record) = record else {
            return Ok(format!("File {} does not exist yet.", task.target_file));
        };
        let others = retract(record, task.index);
        let mut context = format!("File: {}\nPurpose: {}\n", record.path, record.purpose);
        if others.is_empty() {
            context.push_str("No existing code.");
        } else {
            let symbols: Vec<&str> = others.symbols.iter().map(String::as_str).collect();
            context.push_str(&format!(
                "Defined symbols: {}\n\n{}",
                symbols.join(", "),
                others.content()
            ));
        }
        Ok(context)
    }
}

// ---------------------------------------------------------------------------
// Test artifact naming
// ---------------------------------------------------------------------------

/// Path of the test file for `path`: `pkg/calc.py` becomes `pkg/test_calc.py`.
pub fn test_artifact_path(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, name)) => format!("{}/test_{}", dir, name),
        None => format!("test_{}", path),
    }
}

/// Files that should receive generated tests: non-empty and not already a
/// test file.
pub fn files_needing_tests(files: &BTreeMap<String, FileRecord>) -> Vec<&FileRecord> {
    files
        .values()
        .filter(|r| !r.is_empty())
        .filter(|r| {
            let name = r.path.rsplit('/').next().unwrap_or(&r.path);
            !name.starts_with("test_")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use codeloom_types::{Fragment, TaskAction, TaskStatus};

    use super::*;

    fn task(index: usize) -> Task {
        Task {
            index,
            target_file: "calc.py".into(),
            description: "add subtraction".into(),
            action: TaskAction::Append,
            status: TaskStatus::Pending,
            attempts: 0,
        }
    }

    fn record_with(fragments: &[(usize, &str, &str)]) -> FileRecord {
        let mut record = FileRecord::new("calc.py", "arithmetic");
        for (task, code, symbol) in fragments {
            record.fragments.push(Fragment {
                task: *task,
                code: code.to_string(),
                symbols: vec![symbol.to_string()],
            });
        }
        record.symbols = record.declared_symbols();
        record
    }

    #[tokio::test]
    async fn file_context_excludes_own_fragment() {
        let record = record_with(&[(0, "def add(a, b): ...", "add"), (1, "def sub(a, b): ...", "sub")]);
        let context = FileContextProvider
            .retrieve(&task(1), Some(&record))
            .await
            .unwrap();
        assert!(context.contains("Purpose: arithmetic"));
        assert!(context.contains("def add"));
        assert!(!context.contains("def sub"));
    }

    #[tokio::test]
    async fn file_context_for_missing_file() {
        let context = FileContextProvider.retrieve(&task(0), None).await.unwrap();
        assert!(context.contains("does not exist"));
    }

    #[test]
    fn test_paths_keep_directories() {
        assert_eq!(test_artifact_path("calc.py"), "test_calc.py");
        assert_eq!(test_artifact_path("pkg/calc.py"), "pkg/test_calc.py");
    }

    #[test]
    fn skips_empty_and_test_files() {
        let mut files = BTreeMap::new();
        files.insert("calc.py".to_string(), record_with(&[(0, "def add(a, b): ...", "add")]));
        files.insert("empty.py".to_string(), FileRecord::new("empty.py", ""));
        let mut existing = record_with(&[(1, "def test_add(): ...", "test_add")]);
        existing.path = "tests/test_calc.py".into();
        files.insert(existing.path.clone(), existing);

        let targets: Vec<&str> = files_needing_tests(&files)
            .into_iter()
            .map(|r| r.path.as_str())
            .collect();
        assert_eq!(targets, vec!["calc.py"]);
    }

    #[test]
    fn plan_deserializes_with_defaults() {
        let plan: Plan = serde_json::from_str(
            r#"{"tasks": [{"target_file": "calc.py", "description": "add"}]}"#,
        )
        .unwrap();
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].action, TaskAction::Append);
        assert!(plan.files.is_empty());
    }
}
