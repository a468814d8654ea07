//! Installed packs: version capture for baselines and safe-mode disabling.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::store::{read_json_or_default, write_json, StateLocks};

/// Pack subsystem as seen by baselines and safe mode.
#[async_trait]
pub trait PackManager: Send + Sync {
    /// Disable every installed pack, recording `reason`.
    async fn disable_all_for_safe_mode(&self, reason: &str) -> Result<()>;

    /// Versions of the enabled packs, keyed by pack id.
    async fn installed_versions(&self) -> BTreeMap<String, String>;
}

/// Used when the host has no pack subsystem.
pub struct NoopPackManager;

#[async_trait]
impl PackManager for NoopPackManager {
    async fn disable_all_for_safe_mode(&self, _reason: &str) -> Result<()> {
        Ok(())
    }

    async fn installed_versions(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPack {
    pub id: String,
    pub version: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackRegistryFile {
    #[serde(default)]
    pub packs: Vec<InstalledPack>,
}

/// Pack registry kept in `{stateRoot}/packs/installed.json`.
pub struct JsonPackRegistry {
    path: PathBuf,
    locks: StateLocks,
}

impl JsonPackRegistry {
    pub fn new(state_root: &Path, locks: StateLocks) -> Self {
        Self {
            path: state_root.join("packs").join("installed.json"),
            locks,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn list(&self) -> Vec<InstalledPack> {
        read_json_or_default::<PackRegistryFile>(&self.path).await.packs
    }
}

#[async_trait]
impl PackManager for JsonPackRegistry {
    async fn disable_all_for_safe_mode(&self, reason: &str) -> Result<()> {
        let _guard = self.locks.lock(&self.path).await;
        let mut registry: PackRegistryFile = read_json_or_default(&self.path).await;

        let now = Utc::now();
        let mut disabled = 0;
        for pack in registry.packs.iter_mut().filter(|p| p.enabled) {
            pack.enabled = false;
            pack.disabled_reason = Some(reason.to_string());
            pack.disabled_at = Some(now);
            disabled += 1;
        }

        if disabled == 0 {
            debug!("No enabled packs to disable");
            return Ok(());
        }
        write_json(&self.path, &registry).await?;
        info!("Disabled {} packs for safe mode", disabled);
        Ok(())
    }

    async fn installed_versions(&self) -> BTreeMap<String, String> {
        self.list()
            .await
            .into_iter()
            .filter(|p| p.enabled)
            .map(|p| (p.id, p.version))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_disable_all_records_reason() {
        let tmp = TempDir::new().unwrap();
        let registry = JsonPackRegistry::new(tmp.path(), StateLocks::new());
        std::fs::create_dir_all(tmp.path().join("packs")).unwrap();
        std::fs::write(
            registry.path(),
            r#"{"packs": [
                {"id": "theme", "version": "1.2.0"},
                {"id": "old", "version": "0.1.0", "enabled": false}
            ]}"#,
        )
        .unwrap();

        let versions = registry.installed_versions().await;
        assert_eq!(versions.len(), 1);
        assert_eq!(versions["theme"], "1.2.0");

        registry.disable_all_for_safe_mode("boot failed").await.unwrap();
        let packs = registry.list().await;
        assert!(packs.iter().all(|p| !p.enabled));
        assert_eq!(packs[0].disabled_reason.as_deref(), Some("boot failed"));
        assert!(packs[1].disabled_reason.is_none());
        assert!(registry.installed_versions().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_registry_is_empty() {
        let tmp = TempDir::new().unwrap();
        let registry = JsonPackRegistry::new(tmp.path(), StateLocks::new());
        assert!(registry.installed_versions().await.is_empty());
        registry.disable_all_for_safe_mode("x").await.unwrap();
        assert!(!registry.path().exists());
    }
}
