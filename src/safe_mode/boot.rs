//! Boot record and safe-mode trigger files.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::paths::remove_file_if_exists;
use crate::store::{read_json, write_json, StateLocks};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootState {
    Starting,
    Healthy,
    Failed,
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BootState::Starting => "starting",
            BootState::Healthy => "healthy",
            BootState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// `{stateRoot}/startup/boot.json`, overwritten on every boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootStatus {
    pub boot_id: String,
    pub started_at: DateTime<Utc>,
    pub status: BootState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub safe_mode_applied: bool,
}

impl BootStatus {
    pub fn starting(boot_id: String) -> Self {
        Self {
            boot_id,
            started_at: Utc::now(),
            status: BootState::Starting,
            healthy_at: None,
            failure_reason: None,
            safe_mode_applied: false,
        }
    }
}

/// `{stateRoot}/safe-mode/trigger.json`: forces the next boot to be treated
/// as unhealthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeModeTrigger {
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Reads and writes the boot record and the trigger.
pub struct BootStore {
    boot_path: PathBuf,
    trigger_path: PathBuf,
    locks: StateLocks,
}

impl BootStore {
    pub fn new(state_root: &Path, locks: StateLocks) -> Self {
        Self {
            boot_path: state_root.join("startup").join("boot.json"),
            trigger_path: state_root.join("safe-mode").join("trigger.json"),
            locks,
        }
    }

    /// Directories the controller expects to exist.
    pub fn dirs(&self) -> Vec<&Path> {
        [self.boot_path.parent(), self.trigger_path.parent()]
            .into_iter()
            .flatten()
            .collect()
    }

    pub async fn read_boot(&self) -> Option<BootStatus> {
        read_json(&self.boot_path).await
    }

    /// Replace the boot record with a new boot.
    pub async fn start_boot(&self, status: &BootStatus) -> Result<()> {
        let _guard = self.locks.lock(&self.boot_path).await;
        write_json(&self.boot_path, status).await?;
        info!("Boot {} starting", status.boot_id);
        Ok(())
    }

    /// Mutate the boot record only if it still belongs to `boot_id`.
    /// Returns the updated record, or `None` when another boot owns the file.
    pub async fn update_boot(
        &self,
        boot_id: &str,
        mutate: impl FnOnce(&mut BootStatus),
    ) -> Result<Option<BootStatus>> {
        let _guard = self.locks.lock(&self.boot_path).await;
        let Some(mut status) = read_json::<BootStatus>(&self.boot_path).await else {
            warn!("No boot record to update for boot {}", boot_id);
            return Ok(None);
        };
        if status.boot_id != boot_id {
            warn!(
                "Boot record belongs to {}, not updating for {}",
                status.boot_id, boot_id
            );
            return Ok(None);
        }

        mutate(&mut status);
        write_json(&self.boot_path, &status).await?;
        info!("Boot {} is {}", boot_id, status.status);
        Ok(Some(status))
    }

    pub async fn read_trigger(&self) -> Option<SafeModeTrigger> {
        read_json(&self.trigger_path).await
    }

    pub async fn write_trigger(&self, reason: &str) -> Result<SafeModeTrigger> {
        let trigger = SafeModeTrigger {
            reason: reason.to_string(),
            created_at: Utc::now(),
        };
        let _guard = self.locks.lock(&self.trigger_path).await;
        write_json(&self.trigger_path, &trigger).await?;
        info!("Safe mode requested: {}", reason);
        Ok(trigger)
    }

    pub async fn clear_trigger(&self) -> Result<()> {
        let _guard = self.locks.lock(&self.trigger_path).await;
        if remove_file_if_exists(&self.trigger_path).await? {
            info!("Safe-mode trigger cleared");
        } else {
            debug!("No safe-mode trigger to clear");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_update_guarded_by_boot_id() {
        let tmp = TempDir::new().unwrap();
        let store = BootStore::new(tmp.path(), StateLocks::new());

        assert!(store.update_boot("a", |_| {}).await.unwrap().is_none());

        store.start_boot(&BootStatus::starting("a".into())).await.unwrap();
        store.start_boot(&BootStatus::starting("b".into())).await.unwrap();

        let stale = store
            .update_boot("a", |s| s.status = BootState::Healthy)
            .await
            .unwrap();
        assert!(stale.is_none());
        assert_eq!(store.read_boot().await.unwrap().status, BootState::Starting);

        let updated = store
            .update_boot("b", |s| s.status = BootState::Failed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, BootState::Failed);
    }

    #[tokio::test]
    async fn test_trigger_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = BootStore::new(tmp.path(), StateLocks::new());

        assert!(store.read_trigger().await.is_none());
        store.write_trigger("user asked").await.unwrap();
        assert_eq!(store.read_trigger().await.unwrap().reason, "user asked");
        store.clear_trigger().await.unwrap();
        assert!(store.read_trigger().await.is_none());
        store.clear_trigger().await.unwrap();
    }
}
