//! Filesystem artifact store: writes a session's files, tests and summary
//! under its workspace.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use codeloom_types::{Artifact, FileRecord, LoomError, Result};

use crate::collaborators::ArtifactStore;
use crate::plan_check::is_safe_relative_path;
use crate::summary::SUMMARY_FILE;

/// Writes every non-empty file record, every test artifact and `SUMMARY.md`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsArtifactStore;

impl FsArtifactStore {
    async fn write(root: &Path, relative: &str, content: &str) -> Result<()> {
        if !is_safe_relative_path(relative) {
            return Err(LoomError::Persistence(format!(
                "refusing to write '{}' outside the workspace",
                relative
            )));
        }
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LoomError::Persistence(format!("{}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| LoomError::Persistence(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), bytes = content.len(), "Artifact written");
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn save(
        &self,
        root: &Path,
        files: &BTreeMap<String, FileRecord>,
        tests: &[Artifact],
        summary: &str,
    ) -> Result<Vec<String>> {
        let mut written = Vec::new();
        for record in files.values().filter(|r| !r.is_empty()) {
            Self::write(root, &record.path, &record.content()).await?;
            written.push(record.path.clone());
        }
        for artifact in tests {
            Self::write(root, &artifact.path, &artifact.content).await?;
            written.push(artifact.path.clone());
        }
        Self::write(root, SUMMARY_FILE, summary).await?;
        written.push(SUMMARY_FILE.to_string());
        Ok(written)
    }
}
