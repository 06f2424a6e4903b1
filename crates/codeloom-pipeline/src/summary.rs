//! Markdown summary written next to the session's artifacts.

use std::fmt::Write;

use codeloom_types::{SessionState, TaskStatus};

pub const SUMMARY_FILE: &str = "SUMMARY.md";

/// Render `SUMMARY.md`: the file structure, then per-task status.
pub fn render_summary(state: &SessionState) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Implementation Summary\n");
    let _ = writeln!(out, "Session: {}\n", state.session_id);

    let _ = writeln!(out, "## File Structure\n");
    for record in state.files.values().filter(|r| !r.is_empty()) {
        let symbols = if record.symbols.is_empty() {
            "N/A".to_string()
        } else {
            record.symbols.iter().cloned().collect::<Vec<_>>().join(", ")
        };
        let _ = writeln!(out, "- **{}**: {}", record.path, record.purpose);
        let _ = writeln!(out, "  - Symbols: {}", symbols);
        let _ = writeln!(out, "  - Size: {} characters", record.content().chars().count());
    }

    let passed = state.tasks_with_status(TaskStatus::Passed).count();
    let abandoned = state.tasks_with_status(TaskStatus::Abandoned).count();
    let _ = writeln!(out, "\n## Task Completion\n");
    let _ = writeln!(out, "Total tasks: {}", state.tasks.len());
    let _ = writeln!(out, "Passed: {}", passed);
    let _ = writeln!(out, "Abandoned: {}", abandoned);

    let _ = writeln!(out, "\n## Task Details\n");
    for task in &state.tasks {
        let mark = match task.status {
            TaskStatus::Passed => "[x]",
            TaskStatus::Abandoned => "[!]",
            TaskStatus::Pending => "[ ]",
        };
        let _ = writeln!(
            out,
            "- {} Task {} ({}, {} attempt{}): {}",
            mark,
            task.index,
            task.target_file,
            task.attempts,
            if task.attempts == 1 { "" } else { "s" },
            task.description
        );
    }

    if !state.test_artifacts.is_empty() {
        let _ = writeln!(out, "\n## Generated Tests\n");
        for artifact in &state.test_artifacts {
            let _ = writeln!(out, "- {}", artifact.path);
        }
    }
    out
}
