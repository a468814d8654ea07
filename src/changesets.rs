//! Changesets: a zone-level unit of work bracketed by a snapshot.
//!
//! Starting a changeset captures the selected zones; finishing it records what
//! changed (and can promote the result to a new baseline); rolling it back
//! restores the captured state. At most one changeset is open at a time.
//!
//! Layout under `{stateRoot}/changesets/`: `active.json`, then
//! `{id}/record.json` and `{id}/baseline.snapshot.json`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::baseline::{BaselineManager, BaselineRequest};
use crate::error::{Result, SelfModError};
use crate::paths::validate_id;
use crate::snapshot::{
    create_snapshot, diff_snapshots, require_snapshot, restore_snapshot, save_snapshot,
    RestoreOptions, SnapshotDiffEntry, SnapshotOptions,
};
use crate::store::{read_json, read_json_or_default, write_json, StateLocks};
use crate::zones::ZoneManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangesetStatus {
    Open,
    Completed,
    RolledBack,
}

impl fmt::Display for ChangesetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangesetStatus::Open => "open",
            ChangesetStatus::Completed => "completed",
            ChangesetStatus::RolledBack => "rolled back",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesetRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub zone_names: Vec<String>,
    pub status: ChangesetStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Virtual paths that differed from the start snapshot when finished.
    #[serde(default)]
    pub changed_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_baseline_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveChangeset {
    #[serde(default)]
    active_id: Option<String>,
}

/// A changeset after finish or rollback, with the diffs involved.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesetOutcome {
    pub record: ChangesetRecord,
    pub diffs: Vec<SnapshotDiffEntry>,
}

pub struct ChangesetStore {
    root: PathBuf,
    zones: Arc<ZoneManager>,
    baseline: Arc<BaselineManager>,
    locks: StateLocks,
}

impl ChangesetStore {
    pub fn new(
        state_root: &Path,
        zones: Arc<ZoneManager>,
        baseline: Arc<BaselineManager>,
        locks: StateLocks,
    ) -> Self {
        Self {
            root: state_root.join("changesets"),
            zones,
            baseline,
            locks,
        }
    }

    fn active_path(&self) -> PathBuf {
        self.root.join("active.json")
    }

    fn changeset_dir(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.root.join(id))
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.changeset_dir(id)?.join("record.json"))
    }

    fn snapshot_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.changeset_dir(id)?.join("baseline.snapshot.json"))
    }

    pub async fn get_changeset(&self, id: &str) -> Result<Option<ChangesetRecord>> {
        Ok(read_json(&self.record_path(id)?).await)
    }

    async fn require_changeset(&self, id: &str) -> Result<ChangesetRecord> {
        self.get_changeset(id)
            .await?
            .ok_or_else(|| SelfModError::ChangesetNotFound(id.to_string()))
    }

    async fn require_open(&self, id: &str) -> Result<ChangesetRecord> {
        let record = self.require_changeset(id).await?;
        if record.status != ChangesetStatus::Open {
            return Err(SelfModError::ChangesetClosed {
                id: id.to_string(),
                status: record.status.to_string(),
            });
        }
        Ok(record)
    }

    /// The open changeset, if any.
    pub async fn active_changeset(&self) -> Option<ChangesetRecord> {
        let active: ActiveChangeset = read_json_or_default(&self.active_path()).await;
        let id = active.active_id?;
        match self.get_changeset(&id).await {
            Ok(Some(record)) if record.status == ChangesetStatus::Open => Some(record),
            _ => {
                warn!("Active changeset {} is not open, ignoring", id);
                None
            }
        }
    }

    /// Open a changeset over the selected zones (all when `zone_names` is
    /// `None`). Returns the already open changeset if there is one.
    pub async fn start_changeset(
        &self,
        scope: Option<String>,
        zone_names: Option<Vec<String>>,
    ) -> Result<ChangesetRecord> {
        let _guard = self.locks.lock(&self.root).await;

        if let Some(open) = self.active_changeset().await {
            info!("Changeset {} already open", open.id);
            return Ok(open);
        }

        let snapshot = create_snapshot(
            &self.zones,
            &SnapshotOptions {
                zone_kinds: None,
                zone_names: zone_names.clone(),
                subset_paths: None,
            },
        )
        .await?;

        let id = Uuid::new_v4().to_string();
        save_snapshot(&self.snapshot_path(&id)?, &snapshot).await?;

        let record = ChangesetRecord {
            id: id.clone(),
            scope,
            zone_names: snapshot.zone_roots.keys().cloned().collect(),
            status: ChangesetStatus::Open,
            started_at: Utc::now(),
            finished_at: None,
            changed_paths: Vec::new(),
            promoted_baseline_id: None,
        };
        write_json(&self.record_path(&id)?, &record).await?;
        write_json(
            &self.active_path(),
            &ActiveChangeset {
                active_id: Some(id.clone()),
            },
        )
        .await?;

        info!(
            "Started changeset {} over {} ({} files)",
            id,
            record.zone_names.join(", "),
            snapshot.file_count()
        );
        Ok(record)
    }

    /// Record what changed since `id` started and close it. With `promote`,
    /// the current state becomes the new last-known-good baseline.
    pub async fn finish_changeset(&self, id: &str, promote: bool) -> Result<ChangesetOutcome> {
        let _guard = self.locks.lock(&self.root).await;
        let mut record = self.require_open(id).await?;
        let start = require_snapshot(&self.snapshot_path(id)?).await?;

        let current = create_snapshot(
            &self.zones,
            &SnapshotOptions {
                zone_kinds: None,
                zone_names: Some(record.zone_names.clone()),
                subset_paths: None,
            },
        )
        .await?;
        let diffs = diff_snapshots(&start, &current);

        if promote {
            let meta = self
                .baseline
                .create_baseline(BaselineRequest {
                    source_changeset_id: Some(record.id.clone()),
                    scope: record.scope.clone(),
                })
                .await?;
            record.promoted_baseline_id = Some(meta.baseline_id);
        }

        record.changed_paths = diffs.iter().map(|d| d.virtual_path.clone()).collect();
        record.status = ChangesetStatus::Completed;
        record.finished_at = Some(Utc::now());
        write_json(&self.record_path(id)?, &record).await?;
        self.clear_active(id).await?;

        info!(
            "Finished changeset {} ({} paths changed, promoted: {})",
            id,
            record.changed_paths.len(),
            promote
        );
        Ok(ChangesetOutcome { record, diffs })
    }

    /// Put the changeset's zones back to how they were when it started.
    pub async fn rollback_changeset(&self, id: &str) -> Result<ChangesetOutcome> {
        let _guard = self.locks.lock(&self.root).await;
        let mut record = self.require_open(id).await?;
        let start = require_snapshot(&self.snapshot_path(id)?).await?;

        let result = restore_snapshot(
            &start,
            &self.zones,
            &RestoreOptions {
                zone_names: Some(record.zone_names.clone()),
                subset_paths: None,
            },
        )
        .await?;

        record.changed_paths = result.diffs.iter().map(|d| d.virtual_path.clone()).collect();
        record.status = ChangesetStatus::RolledBack;
        record.finished_at = Some(Utc::now());
        write_json(&self.record_path(id)?, &record).await?;
        self.clear_active(id).await?;

        info!(
            "Rolled back changeset {} ({} paths restored)",
            id, result.restored_count
        );
        Ok(ChangesetOutcome {
            record,
            diffs: result.diffs,
        })
    }

    async fn clear_active(&self, id: &str) -> Result<()> {
        let active: ActiveChangeset = read_json_or_default(&self.active_path()).await;
        if active.active_id.as_deref() == Some(id) {
            write_json(&self.active_path(), &ActiveChangeset::default()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safe_mode::NoopPackManager;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> (ChangesetStore, Arc<BaselineManager>, PathBuf) {
        let root = tmp.path().join("app");
        std::fs::create_dir_all(&root).unwrap();
        let zones = Arc::new(ZoneManager::single_frontend(root.clone()));
        let locks = StateLocks::new();
        let state = tmp.path().join("state");
        let baseline = Arc::new(BaselineManager::new(
            &state,
            zones.clone(),
            Arc::new(NoopPackManager),
            locks.clone(),
        ));
        (
            ChangesetStore::new(&state, zones, baseline.clone(), locks),
            baseline,
            root,
        )
    }

    #[tokio::test]
    async fn test_start_returns_open_changeset() {
        let tmp = TempDir::new().unwrap();
        let (store, _, _) = store(&tmp);

        let first = store.start_changeset(Some("theme".into()), None).await.unwrap();
        assert_eq!(first.status, ChangesetStatus::Open);
        assert_eq!(first.zone_names, vec!["frontend"]);

        let second = store.start_changeset(None, None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.active_changeset().await.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_finish_with_promote() {
        let tmp = TempDir::new().unwrap();
        let (store, baseline, root) = store(&tmp);
        std::fs::write(root.join("a.ts"), "1").unwrap();

        let record = store.start_changeset(Some("s".into()), None).await.unwrap();
        std::fs::write(root.join("a.ts"), "2").unwrap();
        std::fs::write(root.join("b.ts"), "new").unwrap();

        let outcome = store.finish_changeset(&record.id, true).await.unwrap();
        assert_eq!(outcome.record.status, ChangesetStatus::Completed);
        assert_eq!(outcome.record.changed_paths, vec!["frontend/a.ts", "frontend/b.ts"]);
        assert!(store.active_changeset().await.is_none());

        let lkg = baseline.last_known_good().await.unwrap();
        assert_eq!(Some(lkg.baseline_id), outcome.record.promoted_baseline_id);
        assert_eq!(lkg.source_changeset_id.as_deref(), Some(record.id.as_str()));
        assert_eq!(lkg.scope.as_deref(), Some("s"));
    }

    #[tokio::test]
    async fn test_rollback_restores_start_state() {
        let tmp = TempDir::new().unwrap();
        let (store, _, root) = store(&tmp);
        std::fs::write(root.join("a.ts"), "1").unwrap();

        let record = store.start_changeset(None, None).await.unwrap();
        std::fs::write(root.join("a.ts"), "2").unwrap();
        std::fs::write(root.join("b.ts"), "new").unwrap();

        let outcome = store.rollback_changeset(&record.id).await.unwrap();
        assert_eq!(outcome.record.status, ChangesetStatus::RolledBack);
        assert_eq!(std::fs::read_to_string(root.join("a.ts")).unwrap(), "1");
        assert!(!root.join("b.ts").exists());
        assert!(store.active_changeset().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_changeset_cannot_be_reused() {
        let tmp = TempDir::new().unwrap();
        let (store, _, root) = store(&tmp);
        std::fs::write(root.join("a.ts"), "1").unwrap();

        let record = store.start_changeset(None, None).await.unwrap();
        std::fs::write(root.join("a.ts"), "2").unwrap();
        store.finish_changeset(&record.id, false).await.unwrap();

        // later work on top of the finished changeset
        std::fs::write(root.join("a.ts"), "3").unwrap();

        match store.rollback_changeset(&record.id).await {
            Err(SelfModError::ChangesetClosed { id, status }) => {
                assert_eq!(id, record.id);
                assert_eq!(status, "completed");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            store.finish_changeset(&record.id, true).await,
            Err(SelfModError::ChangesetClosed { .. })
        ));
        assert_eq!(std::fs::read_to_string(root.join("a.ts")).unwrap(), "3");
        assert_eq!(
            store.get_changeset(&record.id).await.unwrap().unwrap().status,
            ChangesetStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_unknown_changeset() {
        let tmp = TempDir::new().unwrap();
        let (store, _, _) = store(&tmp);
        assert!(matches!(
            store.finish_changeset("nope", false).await,
            Err(SelfModError::ChangesetNotFound(_))
        ));
    }
}
