//! The workflow graph's edges as a pure function of the state.
//!
//! [`route`] looks only at the phase (the last completed stage), the task
//! pointer and the retry counters. Given equal snapshots it returns equal
//! routes. Loop-back for retries lives here and nowhere else.

use std::fmt;

use codeloom_types::{ContextPolicy, SessionPhase, SessionState, Verdict};

use crate::stage::StageId;

/// Next step chosen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Invoke this stage next.
    Stage(StageId),
    /// The active task is finished: move the pointer, reset the retry
    /// counters and route again.
    Advance,
    /// The session reached a terminal phase.
    Done,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Stage(id) => write!(f, "{}", id),
            Route::Advance => f.write_str("advance"),
            Route::Done => f.write_str("done"),
        }
    }
}

/// Signature of a routing function. The orchestrator accepts any of these so
/// that tests can inject a faulty graph.
pub type Router = fn(&SessionState) -> Route;

/// Default workflow routing.
pub fn route(state: &SessionState) -> Route {
    match state.phase {
        SessionPhase::Created => Route::Stage(StageId::Plan),
        SessionPhase::Planned | SessionPhase::Critiqued => next_for_task(state),
        SessionPhase::Retrieved => Route::Stage(StageId::Generate),
        SessionPhase::Generated => Route::Stage(StageId::Accumulate),
        SessionPhase::Accumulated => Route::Stage(StageId::Execute),
        SessionPhase::Executed => Route::Stage(StageId::Critique),
        SessionPhase::Finalized => Route::Stage(StageId::Save),
        SessionPhase::Saved | SessionPhase::Failed | SessionPhase::Cancelled => Route::Done,
    }
}

/// Decision table for the per-task loop, first match wins.
fn next_for_task(state: &SessionState) -> Route {
    let retry = &state.retry;
    if state.all_tasks_processed() {
        return Route::Stage(StageId::GenerateTests);
    }
    if retry.is_fresh() {
        return Route::Stage(StageId::Retrieve);
    }
    if retry.last_verdict == Some(Verdict::Passed) {
        return Route::Advance;
    }
    if retry.can_retry() {
        return match retry.context_policy {
            ContextPolicy::Refresh => Route::Stage(StageId::Retrieve),
            ContextPolicy::Reuse => Route::Stage(StageId::Generate),
        };
    }
    Route::Advance
}
