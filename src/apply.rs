//! Apply engine.
//!
//! `apply_batch` moves everything staged for a feature into the source tree:
//!
//! 1. list staged files (nothing staged is a no-op, batch index -1)
//! 2. next batch index = history length
//! 3. snapshot every file about to be overwritten, then write the manifest
//! 4. write staged content into place
//! 5. append the history entry
//! 6. clear staging
//! 7. mark the feature `applied`
//!
//! Step 3 finishes for every file before step 4 starts. The history entry is
//! the commit point: if step 4 or 5 fails the batch snapshot is restored
//! immediately, staging is kept so the edit can be retried, and no history
//! entry is recorded. Failures after the commit only log.
//!
//! A snapshot directory for the next batch index with no history entry means
//! an earlier apply was interrupted after it started writing. Its pre-images
//! are restored before the batch is snapshotted again.

use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SelfModError};
use crate::features::{FeatureStatus, HistoryEntry};
use crate::paths::{join_relative, write_with_parents};
use crate::revert::{
    batch_file_path, batch_manifest_path, has_manifest_remains, read_batch_manifest, BatchEntry,
    BatchEntryKind, BatchManifest,
};
use crate::selfmod::SelfMod;
use crate::snapshot::sha256_hex;
use crate::store::write_json;

/// Batch index reported when there was nothing to apply.
pub const NO_STAGED_FILES: i64 = -1;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    /// Zero-based batch index, or [`NO_STAGED_FILES`].
    pub batch_index: i64,
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApplyResult {
    pub fn is_noop(&self) -> bool {
        self.batch_index == NO_STAGED_FILES
    }

    fn noop() -> Self {
        Self {
            batch_index: NO_STAGED_FILES,
            files: Vec::new(),
            message: None,
        }
    }
}

impl SelfMod {
    /// Apply everything staged for `feature_id` to `frontend_root`.
    pub async fn apply_batch(
        &self,
        feature_id: &str,
        frontend_root: &Path,
        message: Option<&str>,
    ) -> Result<ApplyResult> {
        let feature_dir = self.features.feature_dir(feature_id)?;
        let _guard = self.locks.lock(&feature_dir).await;

        let mut files = self.staging.list_staged_files(feature_id).await?;
        if files.is_empty() {
            debug!("Nothing staged for feature {}", feature_id);
            return Ok(ApplyResult::noop());
        }
        files.sort();

        let batch_index = self.features.get_history(feature_id).await?.len();
        self.snapshot_before_write(feature_id, batch_index, &files, frontend_root)
            .await?;

        let entry = HistoryEntry {
            batch_index,
            message: message.map(str::to_string),
            files: files.clone(),
            applied_at: Utc::now(),
        };
        if let Err(apply_error) = self
            .write_and_record(feature_id, &files, frontend_root, entry)
            .await
        {
            error!(
                "Apply of feature {} batch {} failed: {}",
                feature_id, batch_index, apply_error
            );
            let rolled_back = match self
                .restore_batch_unlocked(feature_id, batch_index, frontend_root)
                .await
            {
                Ok(_) => true,
                Err(e) => {
                    error!("Automatic rollback of batch {} failed: {}", batch_index, e);
                    false
                }
            };
            return Err(SelfModError::ApplyFailed {
                feature_id: feature_id.to_string(),
                batch_index,
                rolled_back,
                source: Box::new(apply_error),
            });
        }

        if let Err(e) = self.staging.clear_staging(feature_id).await {
            warn!(
                "Batch {} of feature {} is recorded but staging was not cleared: {}",
                batch_index, feature_id, e
            );
        }

        if let Err(e) = self
            .features
            .mark_status(feature_id, FeatureStatus::Applied)
            .await
        {
            warn!("Failed to mark feature {} applied: {}", feature_id, e);
        }

        info!(
            "Applied feature {} batch {} ({} files)",
            feature_id,
            batch_index,
            files.len()
        );

        Ok(ApplyResult {
            batch_index: batch_index as i64,
            files,
            message: message.map(str::to_string),
        })
    }

    /// Record the current state of every path the batch will touch. The
    /// manifest is written last, so a directory without one never counts as
    /// a revert point.
    async fn snapshot_before_write(
        &self,
        feature_id: &str,
        batch_index: usize,
        files: &[String],
        frontend_root: &Path,
    ) -> Result<()> {
        let dir = self.features.batch_snapshot_dir(feature_id, batch_index)?;
        if dir.exists() {
            self.recover_interrupted_batch(feature_id, batch_index, &dir, frontend_root)
                .await?;
        }

        let mut entries = Vec::with_capacity(files.len());
        for relative in files {
            let current = join_relative(frontend_root, relative);
            let kind = match tokio::fs::read(&current).await {
                Ok(bytes) => {
                    write_with_parents(&batch_file_path(&dir, relative), &bytes).await?;
                    BatchEntryKind::Content {
                        size: bytes.len() as u64,
                        sha256: sha256_hex(&bytes),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => BatchEntryKind::Absent,
                Err(e) => return Err(SelfModError::io(current, e)),
            };
            entries.push(BatchEntry {
                path: relative.clone(),
                kind,
            });
        }

        write_json(
            &batch_manifest_path(&dir),
            &BatchManifest::new(batch_index, entries),
        )
        .await
    }

    /// Undo an apply of `batch_index` that never reached its history entry,
    /// then drop its snapshot directory. The tree may already hold part of
    /// that batch, and the directory holds the only copy of what was there
    /// before, so it is only dropped once restored.
    async fn recover_interrupted_batch(
        &self,
        feature_id: &str,
        batch_index: usize,
        dir: &Path,
        frontend_root: &Path,
    ) -> Result<()> {
        if read_batch_manifest(dir, batch_index).await.is_some() {
            let restored = self
                .restore_batch_unlocked(feature_id, batch_index, frontend_root)
                .await?;
            warn!(
                "Feature {} batch {} was interrupted, restored {} files before retrying",
                feature_id,
                batch_index,
                restored.len()
            );
        } else if has_manifest_remains(dir).await {
            return Err(SelfModError::UnreadableBatchSnapshot {
                feature_id: feature_id.to_string(),
                batch_index,
                path: batch_manifest_path(dir),
            });
        } else {
            // stopped before its manifest, so nothing was written yet
            debug!("Discarding incomplete snapshot {}", dir.display());
        }

        tokio::fs::remove_dir_all(dir)
            .await
            .map_err(|e| SelfModError::io(dir, e))
    }

    async fn write_and_record(
        &self,
        feature_id: &str,
        files: &[String],
        frontend_root: &Path,
        entry: HistoryEntry,
    ) -> Result<()> {
        self.write_staged(feature_id, files, frontend_root).await?;
        self.features.append_history(feature_id, entry).await
    }

    async fn write_staged(&self, feature_id: &str, files: &[String], frontend_root: &Path) -> Result<()> {
        let staging_dir = self.staging.feature_dir(feature_id)?;
        for relative in files {
            let content = self
                .staging
                .read_staged(feature_id, relative)
                .await?
                .ok_or_else(|| {
                    SelfModError::io(
                        join_relative(&staging_dir, relative),
                        std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "staged file disappeared during apply",
                        ),
                    )
                })?;
            write_with_parents(&join_relative(frontend_root, relative), &content).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::NewFeature;
    use crate::store::StateLocks;
    use crate::zones::ZoneManager;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SelfMod, std::path::PathBuf) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("app");
        std::fs::create_dir_all(&root).unwrap();
        let zones = Arc::new(ZoneManager::single_frontend(root.clone()));
        let sm = SelfMod::new(tmp.path().join("mods"), zones, StateLocks::new());
        (tmp, sm, root)
    }

    #[tokio::test]
    async fn test_apply_writes_and_records_history() {
        let (_tmp, sm, root) = setup();
        sm.create_feature(NewFeature {
            id: "f1".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        std::fs::write(root.join("existing.ts"), "old").unwrap();

        sm.stage_file("f1", "existing.ts", "new").await.unwrap();
        sm.stage_file("f1", "src/fresh.ts", "fresh").await.unwrap();

        let result = sm.apply_batch("f1", &root, Some("first")).await.unwrap();
        assert_eq!(result.batch_index, 0);
        assert_eq!(result.files, vec!["existing.ts", "src/fresh.ts"]);

        assert_eq!(std::fs::read_to_string(root.join("existing.ts")).unwrap(), "new");
        assert_eq!(std::fs::read_to_string(root.join("src/fresh.ts")).unwrap(), "fresh");
        assert!(sm.list_staged_files("f1").await.unwrap().is_empty());

        let history = sm.get_history("f1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message.as_deref(), Some("first"));

        let manifest = sm.batch_manifest("f1", 0).await.unwrap().unwrap();
        assert!(matches!(
            manifest.entry("existing.ts").unwrap().kind,
            BatchEntryKind::Content { size: 3, .. }
        ));
        assert_eq!(manifest.entry("src/fresh.ts").unwrap().kind, BatchEntryKind::Absent);

        let meta = sm.get_feature("f1").await.unwrap().unwrap();
        assert_eq!(meta.status, FeatureStatus::Applied);
    }

    #[tokio::test]
    async fn test_nothing_staged_is_noop() {
        let (_tmp, sm, root) = setup();
        let result = sm.apply_batch("f1", &root, None).await.unwrap();
        assert!(result.is_noop());
        assert_eq!(result.batch_index, -1);
        assert!(sm.get_history("f1").await.unwrap().is_empty());
        assert!(!sm.features.snapshots_dir("f1").unwrap().exists());
    }

    #[tokio::test]
    async fn test_batch_indices_increase_by_one() {
        let (_tmp, sm, root) = setup();
        for i in 0..3 {
            sm.stage_file("f1", "a.txt", format!("v{}", i)).await.unwrap();
            let result = sm.apply_batch("f1", &root, None).await.unwrap();
            assert_eq!(result.batch_index, i);
        }
        // staging was cleared, so applying again reports nothing to do
        assert!(sm.apply_batch("f1", &root, None).await.unwrap().is_noop());

        let history = sm.get_history("f1").await.unwrap();
        let indices: Vec<usize> = history.iter().map(|h| h.batch_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_retry_after_interrupted_apply_keeps_original() {
        let (_tmp, sm, root) = setup();
        std::fs::write(root.join("a.txt"), "orig").unwrap();
        sm.stage_file("f1", "a.txt", "v1").await.unwrap();
        sm.stage_file("f1", "b.txt", "new").await.unwrap();

        // first attempt dies after snapshotting and writing one file
        let files = vec!["a.txt".to_string(), "b.txt".to_string()];
        sm.snapshot_before_write("f1", 0, &files, &root).await.unwrap();
        std::fs::write(root.join("a.txt"), "v1").unwrap();

        let result = sm.apply_batch("f1", &root, None).await.unwrap();
        assert_eq!(result.batch_index, 0);
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "v1");
        assert_eq!(std::fs::read_to_string(root.join("b.txt")).unwrap(), "new");

        sm.restore_batch("f1", 0, &root).await.unwrap();
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "orig");
        assert!(!root.join("b.txt").exists());
    }

    #[tokio::test]
    async fn test_retry_refuses_unreadable_interrupted_snapshot() {
        let (_tmp, sm, root) = setup();
        std::fs::write(root.join("a.txt"), "orig").unwrap();
        sm.stage_file("f1", "a.txt", "v1").await.unwrap();

        sm.snapshot_before_write("f1", 0, &["a.txt".to_string()], &root)
            .await
            .unwrap();
        std::fs::write(root.join("a.txt"), "v1").unwrap();
        let dir = sm.features.batch_snapshot_dir("f1", 0).unwrap();
        std::fs::write(dir.join("manifest.json"), "{").unwrap();

        let err = sm.apply_batch("f1", &root, None).await.unwrap_err();
        assert!(matches!(err, SelfModError::UnreadableBatchSnapshot { .. }));
        // the saved pre-image is still there for manual recovery
        assert_eq!(
            std::fs::read_to_string(dir.join("files/a.txt")).unwrap(),
            "orig"
        );
        assert_eq!(sm.list_staged_files("f1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_history_write_rolls_back() {
        let (_tmp, sm, root) = setup();
        std::fs::write(root.join("a.txt"), "orig").unwrap();
        sm.stage_file("f1", "a.txt", "v1").await.unwrap();
        let history = sm.features.feature_dir("f1").unwrap().join("history.json");
        std::fs::create_dir_all(history.join("blocker")).unwrap();

        let err = sm.apply_batch("f1", &root, None).await.unwrap_err();
        match err {
            SelfModError::ApplyFailed {
                batch_index,
                rolled_back,
                ..
            } => {
                assert_eq!(batch_index, 0);
                assert!(rolled_back);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "orig");
        assert_eq!(sm.list_staged_files("f1").await.unwrap(), vec!["a.txt"]);

        // once the history file is usable again the retry goes through
        std::fs::remove_dir_all(&history).unwrap();
        let result = sm.apply_batch("f1", &root, None).await.unwrap();
        assert_eq!(result.batch_index, 0);
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "v1");
        sm.restore_batch("f1", 0, &root).await.unwrap();
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "orig");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_write_rolls_back() {
        use std::os::unix::fs::PermissionsExt;

        let (_tmp, sm, root) = setup();
        std::fs::write(root.join("a.ts"), "a-original").unwrap();
        std::fs::create_dir_all(root.join("locked")).unwrap();

        sm.stage_file("f1", "a.ts", "a-new").await.unwrap();
        sm.stage_file("f1", "locked/b.ts", "b-new").await.unwrap();

        std::fs::set_permissions(root.join("locked"), std::fs::Permissions::from_mode(0o555))
            .unwrap();
        // root ignores permission bits; nothing to exercise then
        if std::fs::write(root.join("locked/probe"), "x").is_ok() {
            return;
        }

        let err = sm.apply_batch("f1", &root, None).await.unwrap_err();
        std::fs::set_permissions(root.join("locked"), std::fs::Permissions::from_mode(0o755))
            .unwrap();

        match err {
            SelfModError::ApplyFailed {
                batch_index,
                rolled_back,
                ..
            } => {
                assert_eq!(batch_index, 0);
                assert!(rolled_back);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(std::fs::read_to_string(root.join("a.ts")).unwrap(), "a-original");
        assert!(sm.get_history("f1").await.unwrap().is_empty());
        assert_eq!(sm.list_staged_files("f1").await.unwrap().len(), 2);
    }
}
