//! Plan validation: lint rules over a planner's output.
//!
//! Call [`validate_plan`] for advisory diagnostics or [`validate_plan_or_raise`]
//! to turn any `Error`-severity issue into a planning failure.

use std::collections::HashSet;
use std::path::{Component, Path};

use codeloom_types::LoomError;

use crate::checkpoint::CHECKPOINT_DIR;
use crate::collaborators::Plan;
use crate::summary::SUMMARY_FILE;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub task: Option<usize>,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// PlanRule trait
// ---------------------------------------------------------------------------

pub trait PlanRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, plan: &Plan) -> Vec<Diagnostic>;
}

/// A path stays inside the session workspace: relative, non-empty, no `..`.
pub fn is_safe_relative_path(path: &str) -> bool {
    let p = Path::new(path);
    !path.trim().is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Paths the session writes itself: the summary and the checkpoint directory.
pub fn is_reserved_path(path: &str) -> bool {
    let mut parts = Path::new(path)
        .components()
        .filter(|c| !matches!(c, Component::CurDir));
    match parts.next() {
        Some(Component::Normal(first)) => {
            first == CHECKPOINT_DIR || (first == SUMMARY_FILE && parts.next().is_none())
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct NonEmptyTasksRule;
impl PlanRule for NonEmptyTasksRule {
    fn name(&self) -> &str { "non_empty_tasks" }
    fn apply(&self, plan: &Plan) -> Vec<Diagnostic> {
        if plan.tasks.is_empty() {
            vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: "Plan contains no tasks".into(),
                task: None,
                file: None,
            }]
        } else {
            vec![]
        }
    }
}

struct TaskDescriptionRule;
impl PlanRule for TaskDescriptionRule {
    fn name(&self) -> &str { "task_description" }
    fn apply(&self, plan: &Plan) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (i, task) in plan.tasks.iter().enumerate() {
            if task.description.trim().is_empty() {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!("Task {} has an empty description", i),
                    task: Some(i),
                    file: Some(task.target_file.clone()),
                });
            }
        }
        diags
    }
}

struct UniqueFilesRule;
impl PlanRule for UniqueFilesRule {
    fn name(&self) -> &str { "unique_files" }
    fn apply(&self, plan: &Plan) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        let mut diags = Vec::new();
        for file in &plan.files {
            if !seen.insert(file.path.as_str()) {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!("File '{}' is planned more than once", file.path),
                    task: None,
                    file: Some(file.path.clone()),
                });
            }
        }
        diags
    }
}

struct SafePathRule;
impl PlanRule for SafePathRule {
    fn name(&self) -> &str { "safe_path" }
    fn apply(&self, plan: &Plan) -> Vec<Diagnostic> {
        let planned = plan.files.iter().map(|f| (None, f.path.as_str()));
        let targeted = plan
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (Some(i), t.target_file.as_str()));
        planned
            .chain(targeted)
            .filter(|(_, path)| !is_safe_relative_path(path))
            .map(|(task, path)| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Path '{}' escapes the session workspace", path),
                task,
                file: Some(path.to_string()),
            })
            .collect()
    }
}

struct ReservedPathRule;
impl PlanRule for ReservedPathRule {
    fn name(&self) -> &str { "reserved_path" }
    fn apply(&self, plan: &Plan) -> Vec<Diagnostic> {
        let planned = plan.files.iter().map(|f| (None, f.path.as_str()));
        let targeted = plan
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (Some(i), t.target_file.as_str()));
        planned
            .chain(targeted)
            .filter(|(_, path)| is_reserved_path(path))
            .map(|(task, path)| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Path '{}' is reserved for session output", path),
                task,
                file: Some(path.to_string()),
            })
            .collect()
    }
}

struct UnplannedTargetRule;
impl PlanRule for UnplannedTargetRule {
    fn name(&self) -> &str { "unplanned_target" }
    fn apply(&self, plan: &Plan) -> Vec<Diagnostic> {
        let planned: HashSet<&str> = plan.files.iter().map(|f| f.path.as_str()).collect();
        plan.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| !planned.contains(t.target_file.as_str()))
            .map(|(i, t)| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!(
                    "Task {} targets '{}' which is not in the file plan; it will be created",
                    i, t.target_file
                ),
                task: Some(i),
                file: Some(t.target_file.clone()),
            })
            .collect()
    }
}

struct IdleFileRule;
impl PlanRule for IdleFileRule {
    fn name(&self) -> &str { "idle_file" }
    fn apply(&self, plan: &Plan) -> Vec<Diagnostic> {
        let targeted: HashSet<&str> = plan.tasks.iter().map(|t| t.target_file.as_str()).collect();
        plan.files
            .iter()
            .filter(|f| !targeted.contains(f.path.as_str()))
            .map(|f| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Info,
                message: format!("File '{}' has no task and will stay empty", f.path),
                task: None,
                file: Some(f.path.clone()),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all rules and collect their diagnostics.
pub fn validate_plan(plan: &Plan) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn PlanRule>> = vec![
        Box::new(NonEmptyTasksRule),
        Box::new(TaskDescriptionRule),
        Box::new(UniqueFilesRule),
        Box::new(SafePathRule),
        Box::new(ReservedPathRule),
        Box::new(UnplannedTargetRule),
        Box::new(IdleFileRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(plan));
    }
    diagnostics
}

/// Run all rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_plan_or_raise(plan: &Plan) -> codeloom_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate_plan(plan);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(LoomError::Planning(messages.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use codeloom_types::{PlannedFile, PlannedTask, TaskAction};

    use super::*;

    fn plan(files: &[&str], tasks: &[(&str, &str)]) -> Plan {
        Plan {
            files: files
                .iter()
                .map(|p| PlannedFile {
                    path: p.to_string(),
                    purpose: String::new(),
                })
                .collect(),
            tasks: tasks
                .iter()
                .map(|(f, d)| PlannedTask {
                    target_file: f.to_string(),
                    description: d.to_string(),
                    action: TaskAction::Append,
                })
                .collect(),
        }
    }

    fn rules_hit(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.rule.as_str()).collect()
    }

    // Test 1: A well-formed plan has no errors or warnings
    #[test]
    fn clean_plan_passes() {
        let p = plan(&["calc.py"], &[("calc.py", "add"), ("calc.py", "subtract")]);
        let diags = validate_plan_or_raise(&p).unwrap();
        assert!(diags.is_empty());
    }

    // Test 2: Empty task list is a planning failure
    #[test]
    fn empty_plan_rejected() {
        let p = plan(&["calc.py"], &[]);
        let err = validate_plan_or_raise(&p).unwrap_err();
        assert!(matches!(err, LoomError::Planning(_)));
        assert!(err.to_string().contains("no tasks"));
    }

    // Test 3: Blank descriptions rejected
    #[test]
    fn blank_description_rejected() {
        let p = plan(&["calc.py"], &[("calc.py", "  ")]);
        let diags = validate_plan(&p);
        assert!(rules_hit(&diags).contains(&"task_description"));
        assert!(validate_plan_or_raise(&p).is_err());
    }

    // Test 4: Duplicate file paths rejected
    #[test]
    fn duplicate_files_rejected() {
        let p = plan(&["calc.py", "calc.py"], &[("calc.py", "add")]);
        assert!(rules_hit(&validate_plan(&p)).contains(&"unique_files"));
    }

    // Test 5: Paths escaping the workspace rejected
    #[test]
    fn unsafe_paths_rejected() {
        assert!(is_safe_relative_path("pkg/calc.py"));
        assert!(is_safe_relative_path("./calc.py"));
        assert!(!is_safe_relative_path("../calc.py"));
        assert!(!is_safe_relative_path("/etc/passwd"));
        assert!(!is_safe_relative_path(""));

        let p = plan(&["calc.py"], &[("../../evil.py", "escape")]);
        let diags = validate_plan(&p);
        let unsafe_diag = diags.iter().find(|d| d.rule == "safe_path").unwrap();
        assert_eq!(unsafe_diag.task, Some(0));
        assert!(validate_plan_or_raise(&p).is_err());
    }

    // Test 6: Unplanned targets warn, idle files inform, neither fails
    #[test]
    fn unplanned_and_idle_files_are_advisory() {
        let p = plan(&["readme.md"], &[("calc.py", "add")]);
        let diags = validate_plan_or_raise(&p).unwrap();
        let warning = diags.iter().find(|d| d.rule == "unplanned_target").unwrap();
        assert_eq!(warning.severity, Severity::Warning);
        let info = diags.iter().find(|d| d.rule == "idle_file").unwrap();
        assert_eq!(info.severity, Severity::Info);
    }

    // Test 7: Paths the session writes itself are rejected
    #[test]
    fn reserved_paths_rejected() {
        assert!(is_reserved_path("SUMMARY.md"));
        assert!(is_reserved_path("./SUMMARY.md"));
        assert!(is_reserved_path("checkpoints/latest.json"));
        assert!(!is_reserved_path("docs/SUMMARY.md"));
        assert!(!is_reserved_path("checkpoints.py"));

        let p = plan(&["SUMMARY.md", "calc.py"], &[("checkpoints/task_0.json", "x"), ("calc.py", "add")]);
        let diags = validate_plan(&p);
        let reserved: Vec<_> = diags.iter().filter(|d| d.rule == "reserved_path").collect();
        assert_eq!(reserved.len(), 2);
        assert!(reserved.iter().all(|d| d.severity == Severity::Error));
        assert_eq!(reserved[1].task, Some(0));
        assert!(matches!(validate_plan_or_raise(&p), Err(LoomError::Planning(_))));
    }
}
