//! Session / workspace manager.
//!
//! Every session gets a unique id derived from its label and creation time,
//! an exclusive workspace directory under the manager's root, and a record in
//! the shared registry file `<root>/sessions.json`. Every read-modify-write
//! of the registry holds an exclusive lock on `<root>/sessions.lock`, so
//! sessions running in separate processes never lose each other's records.
//! The file is replaced atomically so a reader never sees a half-written
//! registry.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use codeloom_types::{LoomError, Result, SessionState};

use crate::checkpoint::load_checkpoint;
use crate::config::EngineConfig;
use crate::engine::{PipelineExecutor, SessionOutcome, SessionReport};

pub const REGISTRY_FILE: &str = "sessions.json";
pub const REGISTRY_LOCK_FILE: &str = "sessions.lock";

/// Registry status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Complete,
    Failed,
    /// Cancelled or otherwise given up on; artifacts are left in place.
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Complete => "complete",
            SessionStatus::Failed => "failed",
            SessionStatus::Abandoned => "abandoned",
        }
    }

    /// Registry status for a finished run.
    pub fn from_outcome(outcome: &SessionOutcome) -> Self {
        match outcome {
            SessionOutcome::Saved => SessionStatus::Complete,
            SessionOutcome::Failed(_) => SessionStatus::Failed,
            SessionOutcome::Cancelled { .. } => SessionStatus::Abandoned,
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = LoomError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "complete" => Ok(SessionStatus::Complete),
            "failed" => Ok(SessionStatus::Failed),
            "abandoned" => Ok(SessionStatus::Abandoned),
            other => Err(LoomError::Other(format!("unknown session status '{}'", other))),
        }
    }
}

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub workspace: PathBuf,
}

/// What `open` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: String,
    pub label: String,
    pub workspace: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub label: Option<String>,
    pub status: Option<SessionStatus>,
}

impl SessionFilter {
    fn matches(&self, record: &SessionRecord) -> bool {
        self.label.as_ref().map_or(true, |l| *l == record.label)
            && self.status.map_or(true, |s| s == record.status)
    }
}

type Registry = BTreeMap<String, SessionRecord>;

/// Exclusive hold on the registry lock file; released on drop.
struct RegistryLock {
    file: File,
}

impl RegistryLock {
    async fn acquire(path: PathBuf) -> Result<Self> {
        tokio::task::spawn_blocking(move || -> Result<Self> {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            FileExt::lock_exclusive(&file).map_err(|e| {
                LoomError::Registry(format!("cannot lock {}: {}", path.display(), e))
            })?;
            Ok(Self { file })
        })
        .await
        .map_err(|e| LoomError::Registry(format!("registry lock task failed: {}", e)))?
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "Failed to release registry lock");
        }
    }
}

/// Owns the workspace root and the session registry.
pub struct SessionManager {
    root: PathBuf,
}

impl SessionManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    async fn lock(&self) -> Result<RegistryLock> {
        tokio::fs::create_dir_all(&self.root).await?;
        RegistryLock::acquire(self.root.join(REGISTRY_LOCK_FILE)).await
    }

    /// Reserve an id and workspace for a new session and register it as
    /// active. Returns the handle and the session's fresh state document.
    pub async fn open(
        &self,
        label: &str,
        requirements: &str,
        config: &EngineConfig,
    ) -> Result<(SessionHandle, SessionState)> {
        let _guard = self.lock().await?;
        let mut registry = self.load().await?;

        let created_at = Utc::now();
        let base = format!("{}_{}", sanitize(label), created_at.format("%Y%m%d_%H%M%S"));
        let mut suffix = 1;
        let (id, workspace) = loop {
            let id = if suffix == 1 {
                base.clone()
            } else {
                format!("{}_{}", base, suffix)
            };
            suffix += 1;
            if registry.contains_key(&id) {
                continue;
            }
            let workspace = self.root.join(&id);
            match tokio::fs::create_dir(&workspace).await {
                Ok(()) => break (id, workspace),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        };

        registry.insert(
            id.clone(),
            SessionRecord {
                id: id.clone(),
                label: label.to_string(),
                created_at,
                completed_at: None,
                status: SessionStatus::Active,
                workspace: workspace.clone(),
            },
        );
        self.store(&registry).await?;
        tracing::info!(session = %id, label, workspace = %workspace.display(), "Session opened");

        let mut state = SessionState::new(
            id.clone(),
            workspace.clone(),
            requirements,
            config.max_attempts,
            config.context_policy,
        );
        state.created_at = created_at;
        let handle = SessionHandle {
            id,
            label: label.to_string(),
            workspace,
            created_at,
        };
        Ok((handle, state))
    }

    /// Record the final status of a session. Never touches its artifacts.
    pub async fn close(&self, id: &str, status: SessionStatus) -> Result<SessionRecord> {
        self.update(id, |record| {
            record.status = status;
            record.completed_at = (status != SessionStatus::Active).then(Utc::now);
        })
        .await
        .inspect(|r| tracing::info!(session = %r.id, status = r.status.as_str(), "Session closed"))
    }

    /// Mark a finished session active again before resuming it.
    pub async fn reopen(&self, id: &str) -> Result<SessionRecord> {
        self.update(id, |record| {
            record.status = SessionStatus::Active;
            record.completed_at = None;
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<SessionRecord> {
        self.load()
            .await?
            .remove(id)
            .ok_or_else(|| LoomError::SessionNotFound(id.to_string()))
    }

    /// The most recently created session with `label`.
    pub async fn latest(&self, label: &str) -> Result<Option<SessionRecord>> {
        let filter = SessionFilter {
            label: Some(label.to_string()),
            status: None,
        };
        Ok(self.list(&filter).await?.into_iter().next())
    }

    /// Registry records matching `filter`, newest first.
    pub async fn list(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>> {
        let mut records: Vec<SessionRecord> = self
            .load()
            .await?
            .into_values()
            .filter(|r| filter.matches(r))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(records)
    }

    /// Remove finished sessions created more than `max_age` ago, including
    /// their workspaces. Active sessions are never removed. A record is
    /// dropped from the registry before its workspace is deleted.
    pub async fn cleanup(&self, max_age: chrono::Duration) -> Result<Vec<String>> {
        let _guard = self.lock().await?;
        let mut registry = self.load().await?;
        let cutoff = Utc::now() - max_age;
        let expired: Vec<String> = registry
            .values()
            .filter(|r| r.status != SessionStatus::Active && r.created_at <= cutoff)
            .map(|r| r.id.clone())
            .collect();

        for id in &expired {
            let Some(record) = registry.remove(id) else {
                continue;
            };
            self.store(&registry).await?;
            if tokio::fs::try_exists(&record.workspace).await? {
                tokio::fs::remove_dir_all(&record.workspace).await?;
            }
            tracing::info!(session = %id, "Session removed");
        }
        Ok(expired)
    }

    async fn update(
        &self,
        id: &str,
        change: impl FnOnce(&mut SessionRecord),
    ) -> Result<SessionRecord> {
        let _guard = self.lock().await?;
        let mut registry = self.load().await?;
        let record = registry
            .get_mut(id)
            .ok_or_else(|| LoomError::SessionNotFound(id.to_string()))?;
        change(record);
        let updated = record.clone();
        self.store(&registry).await?;
        Ok(updated)
    }

    async fn load(&self) -> Result<Registry> {
        let path = self.registry_path();
        if !tokio::fs::try_exists(&path).await? {
            return Ok(Registry::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        serde_json::from_str(&data)
            .map_err(|e| LoomError::Registry(format!("{}: {}", path.display(), e)))
    }

    async fn store(&self, registry: &Registry) -> Result<()> {
        let json = serde_json::to_string_pretty(registry)?;
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", REGISTRY_FILE, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, self.registry_path()).await?;
        Ok(())
    }
}

/// Keep ASCII alphanumerics, `-` and `_`; everything else becomes `_`.
pub fn sanitize(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "session".to_string()
    } else {
        cleaned
    }
}

// ---------------------------------------------------------------------------
// Session runs
// ---------------------------------------------------------------------------

/// Open a session, drive it to a terminal phase and record the outcome.
pub async fn run_session(
    manager: &SessionManager,
    executor: &PipelineExecutor,
    label: &str,
    requirements: &str,
) -> Result<(SessionHandle, SessionReport)> {
    let (handle, state) = manager.open(label, requirements, executor.config()).await?;
    let report = executor.run(state).await;
    manager
        .close(&handle.id, SessionStatus::from_outcome(&report.outcome))
        .await?;
    Ok((handle, report))
}

/// Continue a session from its latest checkpoint.
pub async fn resume_session(
    manager: &SessionManager,
    executor: &PipelineExecutor,
    id: &str,
) -> Result<SessionReport> {
    let record = manager.get(id).await?;
    let checkpoint = load_checkpoint(&record.workspace)
        .await?
        .ok_or_else(|| LoomError::Other(format!("session '{}' has no checkpoint to resume from", id)))?;
    tracing::info!(
        session = %id,
        task = checkpoint.task,
        tag = %checkpoint.tag,
        "Resuming session from checkpoint"
    );
    manager.reopen(id).await?;
    let report = executor.run(checkpoint.into_resumable_state()).await;
    manager
        .close(id, SessionStatus::from_outcome(&report.outcome))
        .await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize("my calc/app"), "my_calc_app");
        assert_eq!(sanitize("ok-name_1"), "ok-name_1");
        assert_eq!(sanitize("   "), "session");
        assert_eq!(sanitize("../x"), "___x");
    }

    #[test]
    fn status_parses_and_prints() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Complete,
            SessionStatus::Failed,
            SessionStatus::Abandoned,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[tokio::test]
    async fn open_reserves_workspace_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path());
        let (handle, state) = manager
            .open("calc", "build a calculator", &EngineConfig::default())
            .await
            .unwrap();

        assert!(handle.id.starts_with("calc_"));
        assert!(handle.workspace.is_dir());
        assert_eq!(state.session_id, handle.id);
        assert_eq!(state.workspace, handle.workspace);
        assert_eq!(state.retry.max_attempts, 3);

        let record = manager.get(&handle.id).await.unwrap();
        assert_eq!(record.status, SessionStatus::Active);
        assert_eq!(record.label, "calc");
        assert!(record.completed_at.is_none());
    }

    #[tokio::test]
    async fn same_label_gets_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path());
        let config = EngineConfig::default();
        let (a, b, c) = tokio::join!(
            manager.open("calc", "r", &config),
            manager.open("calc", "r", &config),
            manager.open("calc", "r", &config),
        );
        let ids = [a.unwrap().0.id, b.unwrap().0.id, c.unwrap().0.id];
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
        assert_ne!(ids[0], ids[2]);
        assert_eq!(manager.list(&SessionFilter::default()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn close_records_status_and_keeps_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path());
        let (handle, _) = manager.open("calc", "r", &EngineConfig::default()).await.unwrap();
        std::fs::write(handle.workspace.join("calc.py"), "x = 1").unwrap();

        let record = manager.close(&handle.id, SessionStatus::Complete).await.unwrap();
        assert_eq!(record.status, SessionStatus::Complete);
        assert!(record.completed_at.is_some());
        assert!(handle.workspace.join("calc.py").exists());

        let reopened = manager.reopen(&handle.id).await.unwrap();
        assert_eq!(reopened.status, SessionStatus::Active);
        assert!(reopened.completed_at.is_none());
    }

    #[tokio::test]
    async fn unknown_session_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path());
        assert!(matches!(
            manager.close("nope", SessionStatus::Failed).await,
            Err(LoomError::SessionNotFound(_))
        ));
        assert!(matches!(manager.get("nope").await, Err(LoomError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn list_filters_by_label_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path());
        let config = EngineConfig::default();
        let (calc, _) = manager.open("calc", "r", &config).await.unwrap();
        let (todo, _) = manager.open("todo", "r", &config).await.unwrap();
        manager.close(&todo.id, SessionStatus::Failed).await.unwrap();

        let only_calc = SessionFilter {
            label: Some("calc".into()),
            status: None,
        };
        let records = manager.list(&only_calc).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, calc.id);

        let failed = SessionFilter {
            label: None,
            status: Some(SessionStatus::Failed),
        };
        let records = manager.list(&failed).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, todo.id);

        assert_eq!(manager.latest("calc").await.unwrap().unwrap().id, calc.id);
        assert!(manager.latest("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_removes_only_finished_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path());
        let config = EngineConfig::default();
        let (done, _) = manager.open("done", "r", &config).await.unwrap();
        let (live, _) = manager.open("live", "r", &config).await.unwrap();
        manager.close(&done.id, SessionStatus::Complete).await.unwrap();

        // Nothing is older than a day yet.
        assert!(manager.cleanup(chrono::Duration::days(1)).await.unwrap().is_empty());

        let removed = manager.cleanup(chrono::Duration::zero()).await.unwrap();
        assert_eq!(removed, vec![done.id.clone()]);
        assert!(!done.workspace.exists());
        assert!(live.workspace.exists());
        assert!(manager.get(&live.id).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn separate_managers_on_one_root_keep_every_record() {
        for _ in 0..10 {
            let dir = tempfile::tempdir().unwrap();
            let first = SessionManager::new(dir.path());
            let second = SessionManager::new(dir.path());
            let config = EngineConfig::default();

            let (x, y) = tokio::join!(
                first.open("x", "r", &config),
                second.open("y", "r", &config),
            );
            let (x, y) = (x.unwrap().0, y.unwrap().0);

            let observer = SessionManager::new(dir.path());
            let records = observer.list(&SessionFilter::default()).await.unwrap();
            assert_eq!(records.len(), 2);

            first.close(&x.id, SessionStatus::Complete).await.unwrap();
            second.close(&y.id, SessionStatus::Complete).await.unwrap();
            assert!(dir.path().join(REGISTRY_LOCK_FILE).exists());
        }
    }

    #[tokio::test]
    async fn cleanup_drops_record_before_failed_delete() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path());
        let config = EngineConfig::default();
        let (a, _) = manager.open("a", "r", &config).await.unwrap();
        let (b, _) = manager.open("b", "r", &config).await.unwrap();
        manager.close(&a.id, SessionStatus::Complete).await.unwrap();
        manager.close(&b.id, SessionStatus::Failed).await.unwrap();

        // A plain file where a's workspace should be makes the delete fail.
        std::fs::remove_dir(&a.workspace).unwrap();
        std::fs::write(&a.workspace, "not a directory").unwrap();

        assert!(manager.cleanup(chrono::Duration::zero()).await.is_err());
        let records = manager.list(&SessionFilter::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, b.id);
        assert!(records[0].workspace.is_dir());
    }

    #[tokio::test]
    async fn corrupt_registry_is_a_registry_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(REGISTRY_FILE), "[not a map").unwrap();
        let manager = SessionManager::new(dir.path());
        assert!(matches!(
            manager.list(&SessionFilter::default()).await,
            Err(LoomError::Registry(_))
        ));
    }
}
