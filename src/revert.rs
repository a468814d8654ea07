//! Per-batch snapshots and the revert engine.
//!
//! Before a batch writes anything, the files it is about to overwrite are
//! copied under `{featureId}/snapshots/{batchIndex}/files/` and described in
//! `{batchIndex}/manifest.json`. Files that did not exist are recorded as
//! `absent` so a revert deletes them instead of writing stale content.
//! Directories from older installs (no manifest, content stored directly and
//! `*.__new__` sentinels for absent files) are still readable.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SelfModError};
use crate::features::FeatureStatus;
use crate::paths::{
    join_relative, list_files, relative_posix, remove_file_if_exists, write_with_parents,
};
use crate::selfmod::SelfMod;
use crate::store::read_json;

const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";
const LEGACY_NEW_SUFFIX: &str = ".__new__";

/// What a batch snapshot knows about one path before the batch ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BatchEntryKind {
    /// The file existed; its bytes are stored under `files/`.
    Content { size: u64, sha256: String },
    /// The file did not exist.
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntry {
    pub path: String,
    #[serde(flatten)]
    pub kind: BatchEntryKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchManifest {
    pub batch_index: usize,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<BatchEntry>,
    #[serde(skip)]
    legacy: bool,
}

impl BatchManifest {
    pub fn new(batch_index: usize, entries: Vec<BatchEntry>) -> Self {
        Self {
            batch_index,
            created_at: Utc::now(),
            entries,
            legacy: false,
        }
    }

    pub fn files(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.path.clone()).collect()
    }

    pub fn entry(&self, path: &str) -> Option<&BatchEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Where the saved bytes of `relative` live inside `dir`.
    pub fn content_path(&self, dir: &Path, relative: &str) -> PathBuf {
        if self.legacy {
            join_relative(dir, relative)
        } else {
            join_relative(&dir.join(FILES_DIR), relative)
        }
    }
}

/// One available revert point.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSnapshotInfo {
    pub batch_index: usize,
    pub files: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Where a batch snapshot stores the bytes of `relative`.
pub(crate) fn batch_file_path(dir: &Path, relative: &str) -> PathBuf {
    join_relative(&dir.join(FILES_DIR), relative)
}

pub(crate) fn batch_manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILE)
}

/// True when `name` is a manifest or one of its temp/quarantine siblings.
fn is_manifest_name(name: &str) -> bool {
    name == MANIFEST_FILE
        || name
            .strip_prefix(MANIFEST_FILE)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Whether `dir` holds a manifest, readable or not, or a quarantined copy of
/// one. Such a directory is never a legacy snapshot.
pub(crate) async fn has_manifest_remains(dir: &Path) -> bool {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return false;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if is_manifest_name(&entry.file_name().to_string_lossy()) {
            return true;
        }
    }
    false
}

/// Read a batch snapshot directory. `None` if it does not exist, never got
/// as far as writing its manifest, or its manifest is corrupt.
pub async fn read_batch_manifest(dir: &Path, batch_index: usize) -> Option<BatchManifest> {
    if has_manifest_remains(dir).await {
        let manifest = read_json::<BatchManifest>(&batch_manifest_path(dir)).await;
        if manifest.is_none() {
            warn!("Batch snapshot {} has no readable manifest", dir.display());
        }
        return manifest;
    }
    if !dir.is_dir() || dir.join(FILES_DIR).is_dir() {
        return None;
    }

    let mut entries = Vec::new();
    for file in list_files(dir, &[]).await {
        let Some(rel) = relative_posix(&file, dir) else {
            continue;
        };
        if is_manifest_name(&rel) {
            continue;
        }
        match rel.strip_suffix(LEGACY_NEW_SUFFIX) {
            Some(original) => entries.push(BatchEntry {
                path: original.to_string(),
                kind: BatchEntryKind::Absent,
            }),
            None => {
                let size = tokio::fs::metadata(&file).await.map(|m| m.len()).unwrap_or(0);
                let sha256 = tokio::fs::read(&file)
                    .await
                    .map(|b| crate::snapshot::sha256_hex(&b))
                    .unwrap_or_default();
                entries.push(BatchEntry {
                    path: rel,
                    kind: BatchEntryKind::Content { size, sha256 },
                });
            }
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let created_at = dir_modified(dir).await;
    Some(BatchManifest {
        batch_index,
        created_at,
        entries,
        legacy: true,
    })
}

async fn dir_modified(dir: &Path) -> DateTime<Utc> {
    tokio::fs::metadata(dir)
        .await
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

impl SelfMod {
    /// Put every file recorded in batch `batch_index` back the way it was
    /// before that batch: saved content is rewritten, files that did not
    /// exist are deleted. Returns the relative paths touched. A batch with no
    /// snapshot touches nothing.
    pub async fn restore_batch(
        &self,
        feature_id: &str,
        batch_index: usize,
        frontend_root: &Path,
    ) -> Result<Vec<String>> {
        let feature_dir = self.features.feature_dir(feature_id)?;
        let _guard = self.locks.lock(&feature_dir).await;
        self.restore_batch_unlocked(feature_id, batch_index, frontend_root)
            .await
    }

    pub(crate) async fn restore_batch_unlocked(
        &self,
        feature_id: &str,
        batch_index: usize,
        frontend_root: &Path,
    ) -> Result<Vec<String>> {
        let dir = self.features.batch_snapshot_dir(feature_id, batch_index)?;
        let Some(manifest) = read_batch_manifest(&dir, batch_index).await else {
            if has_manifest_remains(&dir).await {
                return Err(SelfModError::UnreadableBatchSnapshot {
                    feature_id: feature_id.to_string(),
                    batch_index,
                    path: batch_manifest_path(&dir),
                });
            }
            debug!(
                "No snapshot for feature {} batch {}",
                feature_id, batch_index
            );
            return Ok(Vec::new());
        };

        let mut touched = Vec::with_capacity(manifest.entries.len());
        for entry in &manifest.entries {
            let target = join_relative(frontend_root, &entry.path);
            match &entry.kind {
                BatchEntryKind::Absent => {
                    remove_file_if_exists(&target).await?;
                }
                BatchEntryKind::Content { .. } => {
                    let source = manifest.content_path(&dir, &entry.path);
                    let bytes = tokio::fs::read(&source)
                        .await
                        .map_err(|e| SelfModError::io(&source, e))?;
                    write_with_parents(&target, &bytes).await?;
                }
            }
            touched.push(entry.path.clone());
        }

        info!(
            "Restored feature {} batch {} ({} files)",
            feature_id,
            batch_index,
            touched.len()
        );
        Ok(touched)
    }

    /// Restore a batch and record the feature as `reverted`.
    pub async fn revert_batch(
        &self,
        feature_id: &str,
        batch_index: usize,
        frontend_root: &Path,
    ) -> Result<Vec<String>> {
        let touched = self
            .restore_batch(feature_id, batch_index, frontend_root)
            .await?;
        if let Some(meta) = self.features.get_feature(feature_id).await? {
            if meta.status.can_transition_to(FeatureStatus::Reverted) {
                self.features
                    .mark_status(feature_id, FeatureStatus::Reverted)
                    .await?;
            } else {
                warn!(
                    "Feature {} is {}, not marking reverted",
                    feature_id, meta.status
                );
            }
        }
        Ok(touched)
    }

    /// Available revert points for a feature, oldest first.
    pub async fn list_snapshots(&self, feature_id: &str) -> Result<Vec<BatchSnapshotInfo>> {
        let snapshots_dir = self.features.snapshots_dir(feature_id)?;
        let mut entries = match tokio::fs::read_dir(&snapshots_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SelfModError::io(&snapshots_dir, e)),
        };

        let mut infos = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(batch_index) = entry.file_name().to_string_lossy().parse::<usize>() else {
                continue;
            };
            let dir = entry.path();
            if let Some(manifest) = read_batch_manifest(&dir, batch_index).await {
                infos.push(BatchSnapshotInfo {
                    batch_index,
                    files: manifest.files(),
                    created_at: dir_modified(&dir).await,
                });
            }
        }

        infos.sort_by_key(|i| i.batch_index);
        Ok(infos)
    }

    /// Manifest of one batch, if recorded.
    pub async fn batch_manifest(&self, feature_id: &str, batch_index: usize) -> Result<Option<BatchManifest>> {
        let dir = self.features.batch_snapshot_dir(feature_id, batch_index)?;
        Ok(read_batch_manifest(&dir, batch_index).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateLocks;
    use crate::zones::ZoneManager;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn selfmod(tmp: &TempDir) -> SelfMod {
        let zones = Arc::new(ZoneManager::single_frontend(tmp.path().join("app")));
        SelfMod::new(tmp.path().join("mods"), zones, StateLocks::new())
    }

    #[test]
    fn test_manifest_entry_serialization() {
        let entry = BatchEntry {
            path: "src/a.ts".into(),
            kind: BatchEntryKind::Absent,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json, serde_json::json!({"path": "src/a.ts", "kind": "absent"}));

        let entry: BatchEntry = serde_json::from_value(serde_json::json!({
            "path": "b.ts", "kind": "content", "size": 3, "sha256": "abc"
        }))
        .unwrap();
        assert_eq!(
            entry.kind,
            BatchEntryKind::Content {
                size: 3,
                sha256: "abc".into()
            }
        );
    }

    #[tokio::test]
    async fn test_legacy_sentinel_directory() {
        let tmp = TempDir::new().unwrap();
        let sm = selfmod(&tmp);
        let root = tmp.path().join("app");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("new.ts"), "added later").unwrap();
        std::fs::write(root.join("old.ts"), "changed").unwrap();

        let dir = sm.features.batch_snapshot_dir("f1", 0).unwrap();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("old.ts"), "original").unwrap();
        std::fs::write(dir.join("new.ts.__new__"), "").unwrap();

        let snaps = sm.list_snapshots("f1").await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].files, vec!["new.ts", "old.ts"]);

        let mut touched = sm.restore_batch("f1", 0, &root).await.unwrap();
        touched.sort();
        assert_eq!(touched, vec!["new.ts", "old.ts"]);
        assert!(!root.join("new.ts").exists());
        assert_eq!(std::fs::read_to_string(root.join("old.ts")).unwrap(), "original");
    }

    #[tokio::test]
    async fn test_list_snapshots_ignores_non_numeric() {
        let tmp = TempDir::new().unwrap();
        let sm = selfmod(&tmp);
        let snaps_dir = sm.features.snapshots_dir("f1").unwrap();
        for name in ["2", "0", "tmp", "10"] {
            let dir = snaps_dir.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("a.ts"), "x").unwrap();
        }

        let indices: Vec<usize> = sm
            .list_snapshots("f1")
            .await
            .unwrap()
            .iter()
            .map(|s| s.batch_index)
            .collect();
        assert_eq!(indices, vec![0, 2, 10]);
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_not_read_as_legacy() {
        let tmp = TempDir::new().unwrap();
        let sm = selfmod(&tmp);
        let root = tmp.path().join("app");
        std::fs::create_dir_all(&root).unwrap();

        sm.stage_file("f1", "new.ts", "created").await.unwrap();
        sm.apply_batch("f1", &root, None).await.unwrap();

        let dir = sm.features.batch_snapshot_dir("f1", 0).unwrap();
        assert!(!dir.join("files").exists());
        std::fs::write(dir.join("manifest.json"), "{truncated").unwrap();

        for _ in 0..2 {
            let err = sm.restore_batch("f1", 0, &root).await.unwrap_err();
            assert!(matches!(
                err,
                SelfModError::UnreadableBatchSnapshot { batch_index: 0, .. }
            ));
        }
        assert!(sm.list_snapshots("f1").await.unwrap().is_empty());

        let names: Vec<String> = std::fs::read_dir(&root)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["new.ts"]);
    }

    #[test]
    fn test_manifest_names() {
        assert!(is_manifest_name("manifest.json"));
        assert!(is_manifest_name("manifest.json.corrupt-20260101T000000.000Z"));
        assert!(is_manifest_name("manifest.json.tmp"));
        assert!(!is_manifest_name("manifest.jsonc"));
        assert!(!is_manifest_name("src/manifest.json"));
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_noop() {
        let tmp = TempDir::new().unwrap();
        let sm = selfmod(&tmp);
        assert!(sm
            .restore_batch("f1", 3, &tmp.path().join("app"))
            .await
            .unwrap()
            .is_empty());
        assert!(sm.list_snapshots("f1").await.unwrap().is_empty());
    }
}
