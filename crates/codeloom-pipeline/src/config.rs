//! Engine configuration.

use std::path::Path;

use codeloom_types::{ContextPolicy, FindingPolicy, LoomError, Result};
use serde::{Deserialize, Serialize};

use crate::retry::BackoffPolicy;

/// Configuration for one orchestrator. Every field has a default, so a
/// partial JSON document is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Failed attempts allowed per task before it is abandoned.
    pub max_attempts: usize,
    /// Hard ceiling on stage invocations per session.
    pub iteration_budget: usize,
    pub finding_policy: FindingPolicy,
    pub context_policy: ContextPolicy,
    pub retry_backoff: BackoffPolicy,
    /// Write `checkpoints/*.json` into the session workspace.
    pub checkpoints: bool,
    /// Retract an abandoned task's last fragment from its file.
    pub discard_abandoned_fragments: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            iteration_budget: 200,
            finding_policy: FindingPolicy::Advisory,
            context_policy: ContextPolicy::Refresh,
            retry_backoff: BackoffPolicy::None,
            checkpoints: true,
            discard_abandoned_fragments: true,
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(LoomError::Config("max_attempts must be at least 1".into()));
        }
        if self.iteration_budget == 0 {
            return Err(LoomError::Config(
                "iteration_budget must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
