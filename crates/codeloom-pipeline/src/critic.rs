//! Retry/critic controller.
//!
//! Judges the feedback of the current attempt and records the facts the
//! router conditions on: verdict, attempts consumed, task status and the
//! retry context for the next attempt. It never moves the task pointer.

use codeloom_types::{
    ExecutionFeedback, FailureKind, FindingPolicy, FindingSeverity, LoomError, Result,
    RetryContext, RetryState, SessionState, StateUpdate, TaskStatus, Verdict,
};

use crate::accumulator::retract;

/// How many earlier failures a retry context carries.
const ERROR_HISTORY: usize = 3;

/// Knobs the critic honours.
#[derive(Debug, Clone, Copy, Default)]
pub struct CriticPolicy {
    pub findings: FindingPolicy,
    /// Remove an abandoned task's last fragment from its file.
    pub discard_abandoned: bool,
}

/// Judge the feedback in the scratch slot and build the resulting update.
pub fn critique(state: &SessionState, policy: CriticPolicy) -> Result<StateUpdate> {
    let task = state
        .current()
        .ok_or_else(|| LoomError::Invariant("critique with no active task".into()))?;
    let feedback = state
        .scratch
        .feedback
        .as_ref()
        .ok_or_else(|| LoomError::Invariant(format!("no feedback to judge for task {}", task.index)))?;

    let mut retry = state.retry.clone();

    if feedback.passes(policy.findings) {
        let used = retry.attempts + 1;
        retry.last_verdict = Some(Verdict::Passed);
        retry.last_failure = None;
        log_warnings(task.index, feedback);
        tracing::info!(task = task.index, attempt = used, summary = %feedback.summary, "Task passed");
        return Ok(StateUpdate::new()
            .with_retry(retry)
            .with_task_status(task.index, TaskStatus::Passed, used)
            .consume_feedback());
    }

    let failed_code = state.scratch.draft.as_ref().map(|d| d.code.clone());
    let failed = retry_after_failure(&retry, feedback, policy.findings, failed_code);
    let attempts = failed.attempts;
    let mut update = StateUpdate::new().consume_feedback();

    if failed.can_retry() {
        tracing::warn!(
            task = task.index,
            attempt = attempts,
            max = failed.max_attempts,
            summary = %feedback.summary,
            "Attempt failed, retrying"
        );
    } else {
        tracing::warn!(
            task = task.index,
            attempts,
            summary = %feedback.summary,
            "Retry budget exhausted, abandoning task"
        );
        update = update.with_task_status(task.index, TaskStatus::Abandoned, attempts);
        if policy.discard_abandoned {
            if let Some(record) = state.files.get(&task.target_file) {
                if record.fragment_for(task.index).is_some() {
                    update = update.with_file(retract(record, task.index));
                }
            }
        }
    }
    Ok(update.with_retry(failed))
}

/// Counters after one more failed attempt, capped at the maximum.
fn retry_after_failure(
    retry: &RetryState,
    feedback: &ExecutionFeedback,
    findings: FindingPolicy,
    failed_code: Option<String>,
) -> RetryState {
    let attempts = (retry.attempts + 1).min(retry.max_attempts);
    let kind = feedback.failure_kind(findings).unwrap_or(FailureKind::Test);

    let mut previous_errors = Vec::new();
    if let Some(prev) = &retry.last_failure {
        previous_errors.extend(prev.previous_errors.iter().cloned());
        previous_errors.push(format!("{}: {}", prev.kind.as_str(), prev.details));
    }
    if previous_errors.len() > ERROR_HISTORY {
        previous_errors.drain(..previous_errors.len() - ERROR_HISTORY);
    }

    RetryState {
        attempts,
        max_attempts: retry.max_attempts,
        context_policy: retry.context_policy,
        last_verdict: Some(Verdict::Failed),
        last_failure: Some(RetryContext {
            kind,
            details: feedback.failure_details(findings),
            attempt: attempts,
            max_attempts: retry.max_attempts,
            previous_errors,
            failed_code,
        }),
    }
}

fn log_warnings(task: usize, feedback: &ExecutionFeedback) {
    let warnings = feedback
        .findings
        .iter()
        .filter(|f| f.severity != FindingSeverity::Info)
        .count();
    if warnings > 0 {
        tracing::debug!(task, findings = warnings, "Advisory findings recorded");
    }
}
