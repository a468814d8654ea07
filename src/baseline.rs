//! Last-known-good baselines.
//!
//! A baseline is a full zone snapshot plus the context it was taken in
//! (VCS head, enabled pack versions, originating changeset). Safe mode always
//! rolls back to the current last-known-good baseline.
//!
//! Layout under `{stateRoot}/baseline/`:
//!
//! - `last_known_good.json`: [`BaselineMetadata`]
//! - `history.json`: most recent first, at most [`MAX_BASELINE_HISTORY`]
//! - `snapshots/{baselineId}.snapshot.json`

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SelfModError};
use crate::paths::remove_file_if_exists;
use crate::safe_mode::PackManager;
use crate::snapshot::{
    create_snapshot, require_snapshot, restore_snapshot, save_snapshot, RestoreOptions, Snapshot,
    SnapshotDiffEntry, SnapshotOptions,
};
use crate::store::{read_json, read_json_or_default, write_json, StateLocks};
use crate::zones::ZoneManager;

pub const MAX_BASELINE_HISTORY: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineMetadata {
    pub baseline_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_changeset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub snapshot_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcs_head: Option<String>,
    #[serde(default)]
    pub pack_versions: BTreeMap<String, String>,
    #[serde(default)]
    pub zone_roots: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub file_count: usize,
}

/// Origin of a new baseline.
#[derive(Debug, Clone, Default)]
pub struct BaselineRequest {
    pub source_changeset_id: Option<String>,
    pub scope: Option<String>,
}

/// Outcome of rolling back to the last-known-good baseline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineRollback {
    pub baseline_id: String,
    pub restored_count: usize,
    pub diffs: Vec<SnapshotDiffEntry>,
}

pub struct BaselineManager {
    root: PathBuf,
    zones: Arc<ZoneManager>,
    packs: Arc<dyn PackManager>,
    locks: StateLocks,
}

impl BaselineManager {
    pub fn new(
        state_root: &Path,
        zones: Arc<ZoneManager>,
        packs: Arc<dyn PackManager>,
        locks: StateLocks,
    ) -> Self {
        Self {
            root: state_root.join("baseline"),
            zones,
            packs,
            locks,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn zones(&self) -> &ZoneManager {
        &self.zones
    }

    fn last_known_good_path(&self) -> PathBuf {
        self.root.join("last_known_good.json")
    }

    fn history_path(&self) -> PathBuf {
        self.root.join("history.json")
    }

    fn snapshot_path(&self, baseline_id: &str) -> PathBuf {
        self.root
            .join("snapshots")
            .join(format!("{}.snapshot.json", baseline_id))
    }

    // ========== Queries ==========

    pub async fn last_known_good(&self) -> Option<BaselineMetadata> {
        read_json(&self.last_known_good_path()).await
    }

    /// Recorded baselines, most recent first.
    pub async fn history(&self) -> Vec<BaselineMetadata> {
        read_json_or_default(&self.history_path()).await
    }

    pub async fn load_snapshot(&self, meta: &BaselineMetadata) -> Result<Snapshot> {
        require_snapshot(&meta.snapshot_path).await
    }

    // ========== Mutations ==========

    /// Return the last-known-good baseline, capturing one first if none is
    /// usable.
    pub async fn ensure_baseline(&self) -> Result<BaselineMetadata> {
        if let Some(meta) = self.last_known_good().await {
            if meta.snapshot_path.is_file() {
                debug!("Baseline {} present", meta.baseline_id);
                return Ok(meta);
            }
            warn!(
                "Baseline {} snapshot missing at {}, capturing a new one",
                meta.baseline_id,
                meta.snapshot_path.display()
            );
        }
        self.create_baseline(BaselineRequest::default()).await
    }

    /// Capture every zone and make the result the last-known-good baseline.
    pub async fn create_baseline(&self, request: BaselineRequest) -> Result<BaselineMetadata> {
        let snapshot = create_snapshot(&self.zones, &SnapshotOptions::default()).await?;
        self.create_baseline_from(snapshot, request).await
    }

    /// Record an already captured snapshot as the new baseline.
    pub async fn create_baseline_from(
        &self,
        snapshot: Snapshot,
        request: BaselineRequest,
    ) -> Result<BaselineMetadata> {
        let _guard = self.locks.lock(&self.root).await;

        let baseline_id = Uuid::new_v4().to_string();
        let snapshot_path = self.snapshot_path(&baseline_id);
        save_snapshot(&snapshot_path, &snapshot).await?;

        let meta = BaselineMetadata {
            baseline_id,
            created_at: Utc::now(),
            source_changeset_id: request.source_changeset_id,
            scope: request.scope,
            snapshot_path,
            vcs_head: read_vcs_head(self.zones.project_root()).await,
            pack_versions: self.packs.installed_versions().await,
            zone_roots: snapshot.zone_roots.clone(),
            file_count: snapshot.file_count(),
        };

        write_json(&self.last_known_good_path(), &meta).await?;

        let mut history: Vec<BaselineMetadata> = read_json_or_default(&self.history_path()).await;
        history.insert(0, meta.clone());
        let pruned = if history.len() > MAX_BASELINE_HISTORY {
            history.split_off(MAX_BASELINE_HISTORY)
        } else {
            Vec::new()
        };
        write_json(&self.history_path(), &history).await?;
        self.prune_snapshots(&history, &pruned).await;

        info!(
            "Created baseline {} ({} files)",
            meta.baseline_id, meta.file_count
        );
        Ok(meta)
    }

    async fn prune_snapshots(&self, kept: &[BaselineMetadata], pruned: &[BaselineMetadata]) {
        let referenced: HashSet<&Path> = kept.iter().map(|m| m.snapshot_path.as_path()).collect();
        for meta in pruned {
            if referenced.contains(meta.snapshot_path.as_path()) {
                continue;
            }
            match remove_file_if_exists(&meta.snapshot_path).await {
                Ok(_) => debug!("Pruned baseline {}", meta.baseline_id),
                Err(e) => warn!("Failed to prune baseline {}: {}", meta.baseline_id, e),
            }
        }
    }

    /// Restore the last-known-good baseline over its zones.
    pub async fn rollback_to_last_known_good(&self, reason: &str) -> Result<BaselineRollback> {
        let meta = self.last_known_good().await.ok_or(SelfModError::NoBaseline)?;
        let snapshot = self.load_snapshot(&meta).await?;

        info!(
            "Rolling back to baseline {} ({})",
            meta.baseline_id, reason
        );
        let result = restore_snapshot(&snapshot, &self.zones, &RestoreOptions::default()).await?;

        Ok(BaselineRollback {
            baseline_id: meta.baseline_id,
            restored_count: result.restored_count,
            diffs: result.diffs,
        })
    }
}

/// Current commit of the repository at `project_root`, following one
/// `ref:` hop (loose ref, then `packed-refs`). A ref that cannot be resolved
/// is reported by name.
pub async fn read_vcs_head(project_root: &Path) -> Option<String> {
    let git_dir = git_dir(project_root).await?;
    let head = tokio::fs::read_to_string(git_dir.join("HEAD")).await.ok()?;
    let head = head.trim();

    let Some(reference) = head.strip_prefix("ref:").map(str::trim) else {
        return (!head.is_empty()).then(|| head.to_string());
    };

    if let Ok(commit) = tokio::fs::read_to_string(git_dir.join(reference)).await {
        let commit = commit.trim();
        if !commit.is_empty() {
            return Some(commit.to_string());
        }
    }

    if let Ok(packed) = tokio::fs::read_to_string(git_dir.join("packed-refs")).await {
        for line in packed.lines() {
            if let Some((commit, name)) = line.split_once(' ') {
                if name.trim() == reference {
                    return Some(commit.to_string());
                }
            }
        }
    }

    Some(reference.to_string())
}

/// `.git` is a directory, or a `gitdir:` pointer file in worktrees.
async fn git_dir(project_root: &Path) -> Option<PathBuf> {
    let dot_git = project_root.join(".git");
    let meta = tokio::fs::metadata(&dot_git).await.ok()?;
    if meta.is_dir() {
        return Some(dot_git);
    }
    let pointer = tokio::fs::read_to_string(&dot_git).await.ok()?;
    let target = pointer.trim().strip_prefix("gitdir:")?.trim();
    let target = PathBuf::from(target);
    Some(if target.is_absolute() {
        target
    } else {
        project_root.join(target)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safe_mode::NoopPackManager;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir) -> (BaselineManager, PathBuf) {
        let root = tmp.path().join("app");
        std::fs::create_dir_all(&root).unwrap();
        let zones = Arc::new(ZoneManager::single_frontend(root.clone()));
        let manager = BaselineManager::new(
            &tmp.path().join("state"),
            zones,
            Arc::new(NoopPackManager),
            StateLocks::new(),
        );
        (manager, root)
    }

    #[tokio::test]
    async fn test_ensure_creates_once() {
        let tmp = TempDir::new().unwrap();
        let (manager, root) = manager(&tmp);
        std::fs::write(root.join("a.ts"), "a").unwrap();

        assert!(manager.last_known_good().await.is_none());
        let first = manager.ensure_baseline().await.unwrap();
        assert_eq!(first.file_count, 1);
        assert!(first.snapshot_path.is_file());

        let second = manager.ensure_baseline().await.unwrap();
        assert_eq!(first.baseline_id, second.baseline_id);
        assert_eq!(manager.history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_restores_baseline() {
        let tmp = TempDir::new().unwrap();
        let (manager, root) = manager(&tmp);
        std::fs::write(root.join("a.ts"), "good").unwrap();
        let baseline = manager.ensure_baseline().await.unwrap();

        std::fs::write(root.join("a.ts"), "broken").unwrap();
        std::fs::write(root.join("junk.ts"), "junk").unwrap();

        let result = manager.rollback_to_last_known_good("test").await.unwrap();
        assert_eq!(result.baseline_id, baseline.baseline_id);
        assert_eq!(result.restored_count, 2);
        assert_eq!(std::fs::read_to_string(root.join("a.ts")).unwrap(), "good");
        assert!(!root.join("junk.ts").exists());

        let again = manager.rollback_to_last_known_good("test").await.unwrap();
        assert_eq!(again.restored_count, 0);
    }

    #[tokio::test]
    async fn test_rollback_without_baseline() {
        let tmp = TempDir::new().unwrap();
        let (manager, _root) = manager(&tmp);
        assert!(matches!(
            manager.rollback_to_last_known_good("x").await,
            Err(SelfModError::NoBaseline)
        ));
    }

    #[tokio::test]
    async fn test_history_is_capped_and_pruned() {
        let tmp = TempDir::new().unwrap();
        let (manager, root) = manager(&tmp);
        std::fs::write(root.join("a.ts"), "a").unwrap();

        let first = manager.create_baseline(BaselineRequest::default()).await.unwrap();
        for _ in 0..MAX_BASELINE_HISTORY {
            manager.create_baseline(BaselineRequest::default()).await.unwrap();
        }

        let history = manager.history().await;
        assert_eq!(history.len(), MAX_BASELINE_HISTORY);
        assert!(history.iter().all(|m| m.baseline_id != first.baseline_id));
        assert!(!first.snapshot_path.exists());
        assert_eq!(
            manager.last_known_good().await.unwrap().baseline_id,
            history[0].baseline_id
        );
    }

    #[tokio::test]
    async fn test_read_vcs_head() {
        let tmp = TempDir::new().unwrap();
        let git = tmp.path().join(".git");
        std::fs::create_dir_all(git.join("refs/heads")).unwrap();

        assert!(read_vcs_head(&tmp.path().join("nowhere")).await.is_none());

        std::fs::write(git.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::write(git.join("packed-refs"), "# pack-refs\nfeedbeef refs/heads/main\n").unwrap();
        assert_eq!(read_vcs_head(tmp.path()).await.as_deref(), Some("feedbeef"));

        std::fs::write(git.join("refs/heads/main"), "abc123\n").unwrap();
        assert_eq!(read_vcs_head(tmp.path()).await.as_deref(), Some("abc123"));

        std::fs::write(git.join("HEAD"), "0123456789abcdef\n").unwrap();
        assert_eq!(
            read_vcs_head(tmp.path()).await.as_deref(),
            Some("0123456789abcdef")
        );
    }
}
