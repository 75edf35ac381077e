//! Reconciler configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use arborsync_common::{Error, Result};

use crate::policy::ConflictPolicies;

/// What happens to local objects when their node is deleted remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Remove the whole subtree's local objects and pending changesets.
    #[default]
    Cascade,
    /// Drop nodes and links but keep the local objects.
    Orphan,
}

/// When the sweep scanner runs besides startup and reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SweepMode {
    /// Only on startup, reconnect and explicit request.
    #[default]
    Manual,
    /// Additionally at a fixed interval.
    Periodic { interval: Duration },
}

/// Reconciler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Conflict policy per object kind.
    pub conflict_policies: ConflictPolicies,
    /// Handling of remote deletes.
    pub delete_policy: DeletePolicy,
    /// Upper bound on concurrently running fetches.
    pub max_concurrent_fetches: usize,
    /// Sweep schedule.
    pub sweep_mode: SweepMode,
    /// Directory for the node table, links and changesets.
    /// Everything stays in memory when unset.
    pub state_dir: Option<PathBuf>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            conflict_policies: ConflictPolicies::default(),
            delete_policy: DeletePolicy::default(),
            max_concurrent_fetches: 4,
            sweep_mode: SweepMode::default(),
            state_dir: None,
        }
    }
}

impl ReconcilerConfig {
    /// Set the state directory.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Set the delete policy.
    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    /// Set the conflict policies.
    pub fn with_conflict_policies(mut self, policies: ConflictPolicies) -> Self {
        self.conflict_policies = policies;
        self
    }

    /// Set the sweep mode.
    pub fn with_sweep_mode(mut self, mode: SweepMode) -> Self {
        self.sweep_mode = mode;
        self
    }

    /// Set the fetch concurrency limit.
    pub fn with_max_concurrent_fetches(mut self, limit: usize) -> Self {
        self.max_concurrent_fetches = limit;
        self
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_fetches == 0 {
            return Err(Error::InvalidInput(
                "max_concurrent_fetches must be at least 1".to_string(),
            ));
        }
        if let SweepMode::Periodic { interval } = &self.sweep_mode {
            if interval.is_zero() {
                return Err(Error::InvalidInput(
                    "Periodic sweep interval must be non-zero".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Load configuration from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::from_json(&fs::read_to_string(path).await?)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_json()?).await?;
        Ok(())
    }
}

/// Node table file name in the state directory.
pub const NODES_FILENAME: &str = "nodes.json";

/// Link table file name in the state directory.
pub const LINKS_FILENAME: &str = "links.json";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ConflictPolicy;
    use arborsync_common::ObjectKind;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReconcilerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.delete_policy, DeletePolicy::Cascade);
        assert_eq!(config.sweep_mode, SweepMode::Manual);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = ReconcilerConfig::default().with_max_concurrent_fetches(0);
        assert!(config.validate().is_err());

        let config = ReconcilerConfig::default().with_sweep_mode(SweepMode::Periodic {
            interval: Duration::ZERO,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ReconcilerConfig::from_json(r#"{"delete_policy":"orphan"}"#).unwrap();
        assert_eq!(config.delete_policy, DeletePolicy::Orphan);
        assert_eq!(config.max_concurrent_fetches, 4);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("reconciler.json");

        let config = ReconcilerConfig::default()
            .with_state_dir(temp.path().join("state"))
            .with_sweep_mode(SweepMode::Periodic {
                interval: Duration::from_secs(300),
            })
            .with_conflict_policies(
                ConflictPolicies::default().with(ObjectKind::Item, ConflictPolicy::Overwrite),
            );
        config.save(&path).await.unwrap();

        assert_eq!(ReconcilerConfig::load(&path).await.unwrap(), config);
    }
}
