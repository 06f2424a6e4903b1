//! Checkpoint save/restore for session recovery.
//!
//! After each task finishes the orchestrator persists a [`SessionCheckpoint`]
//! into the session workspace:
//!
//! ```text
//! <workspace>/checkpoints/task_0.json
//! <workspace>/checkpoints/task_1.json
//! <workspace>/checkpoints/latest.json
//! ```
//!
//! On restart, [`load_checkpoint`] returns the latest snapshot so the session
//! resumes from the last finished task instead of starting over.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use codeloom_types::{Result, SessionPhase, SessionState};

pub const CHECKPOINT_DIR: &str = "checkpoints";
const LATEST: &str = "latest.json";

/// Snapshot of a session's state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    /// The task this checkpoint was taken for.
    pub task: usize,
    /// What happened at this point, e.g. `passed`, `abandoned`, `saved`.
    pub tag: String,
    /// RFC 3339 timestamp of when the checkpoint was created.
    pub timestamp: String,
    /// Phase to continue from when `state` ended failed or cancelled.
    #[serde(default)]
    pub resume_phase: Option<SessionPhase>,
    pub state: SessionState,
}

impl SessionCheckpoint {
    pub fn new(task: usize, tag: impl Into<String>, state: &SessionState) -> Self {
        Self {
            task,
            tag: tag.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            resume_phase: None,
            state: state.clone(),
        }
    }

    pub fn with_resume_phase(mut self, phase: SessionPhase) -> Self {
        self.resume_phase = Some(phase);
        self
    }

    /// The state to hand back to an orchestrator.
    ///
    /// A session that stopped in `failed` or `cancelled` is rewound to the
    /// phase it was in when it stopped, so the router picks up at the same
    /// stage.
    pub fn into_resumable_state(self) -> SessionState {
        let mut state = self.state;
        if matches!(state.phase, SessionPhase::Failed | SessionPhase::Cancelled) {
            if let Some(phase) = self.resume_phase {
                state.phase = phase;
            }
        }
        state
    }
}

pub fn checkpoint_dir(workspace: &Path) -> PathBuf {
    workspace.join(CHECKPOINT_DIR)
}

/// Write `task_<i>.json` and refresh `latest.json`. Each file is replaced
/// atomically, so a crash mid-write leaves the previous checkpoint readable.
pub async fn save_checkpoint(checkpoint: &SessionCheckpoint, workspace: &Path) -> Result<PathBuf> {
    let dir = checkpoint_dir(workspace);
    tokio::fs::create_dir_all(&dir).await?;
    let json = serde_json::to_string_pretty(checkpoint)?;
    let path = dir.join(format!("task_{}.json", checkpoint.task));
    write_atomic(&path, &json).await?;
    write_atomic(&dir.join(LATEST), &json).await?;
    tracing::debug!(path = %path.display(), tag = %checkpoint.tag, "Checkpoint saved");
    Ok(path)
}

async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("checkpoint");
    let tmp = path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Load the latest checkpoint. `Ok(None)` when none was ever written.
pub async fn load_checkpoint(workspace: &Path) -> Result<Option<SessionCheckpoint>> {
    read(&checkpoint_dir(workspace).join(LATEST)).await
}

/// Load the checkpoint written for a specific task.
pub async fn load_task_checkpoint(workspace: &Path, task: usize) -> Result<Option<SessionCheckpoint>> {
    read(&checkpoint_dir(workspace).join(format!("task_{}.json", task))).await
}

async fn read(path: &Path) -> Result<Option<SessionCheckpoint>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(path).await?;
    let checkpoint: SessionCheckpoint = serde_json::from_str(&json)?;
    Ok(Some(checkpoint))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
