//! Per-feature staging area.
//!
//! Pending edits live under `{modsRoot}/staging/{featureId}/{relativePath}`,
//! mirroring the layout of the source tree they will be applied to. Nothing
//! here touches the real source tree.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, SelfModError};
use crate::paths::{
    join_relative, list_files, relative_posix, sanitize_relative_path, validate_id,
    write_with_parents,
};

/// Staging store rooted at `{modsRoot}/staging`.
#[derive(Debug, Clone)]
pub struct StagingStore {
    root: PathBuf,
}

impl StagingStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging directory for one feature.
    pub fn feature_dir(&self, feature_id: &str) -> Result<PathBuf> {
        validate_id(feature_id)?;
        Ok(self.root.join(feature_id))
    }

    /// Stage `content` for `relative_path`, overwriting any previous version.
    pub async fn stage_file(
        &self,
        feature_id: &str,
        relative_path: &str,
        content: impl AsRef<[u8]>,
    ) -> Result<String> {
        let relative = sanitize_relative_path(relative_path)?;
        let target = join_relative(&self.feature_dir(feature_id)?, &relative);
        write_with_parents(&target, content.as_ref()).await?;
        debug!(
            "Staged {} for feature {} ({} bytes)",
            relative,
            feature_id,
            content.as_ref().len()
        );
        Ok(relative)
    }

    /// Read a staged file. Returns `None` when nothing is staged at that path.
    pub async fn read_staged(&self, feature_id: &str, relative_path: &str) -> Result<Option<Vec<u8>>> {
        let relative = sanitize_relative_path(relative_path)?;
        let target = join_relative(&self.feature_dir(feature_id)?, &relative);
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SelfModError::io(target, e)),
        }
    }

    /// All staged relative paths (posix-separated), in no particular order.
    pub async fn list_staged_files(&self, feature_id: &str) -> Result<Vec<String>> {
        let dir = self.feature_dir(feature_id)?;
        let files = list_files(&dir, &[]).await;
        Ok(files
            .iter()
            .filter_map(|f| relative_posix(f, &dir))
            .collect())
    }

    /// Drop everything staged for a feature. Already-gone is fine.
    pub async fn clear_staging(&self, feature_id: &str) -> Result<()> {
        let dir = self.feature_dir(feature_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("Cleared staging for feature {}", feature_id);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SelfModError::io(dir, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stage_read_list_clear() {
        let tmp = TempDir::new().unwrap();
        let store = StagingStore::new(tmp.path().join("staging"));

        store.stage_file("f1", "src/a.ts", "one").await.unwrap();
        store.stage_file("f1", "src\\deep\\b.ts", b"two").await.unwrap();
        store.stage_file("f1", "src/a.ts", "one-again").await.unwrap();

        let content = store.read_staged("f1", "src/a.ts").await.unwrap().unwrap();
        assert_eq!(content, b"one-again");

        let mut files = store.list_staged_files("f1").await.unwrap();
        files.sort();
        assert_eq!(files, vec!["src/a.ts", "src/deep/b.ts"]);

        store.clear_staging("f1").await.unwrap();
        assert!(store.list_staged_files("f1").await.unwrap().is_empty());
        store.clear_staging("f1").await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_feature_degrades_to_empty() {
        let tmp = TempDir::new().unwrap();
        let store = StagingStore::new(tmp.path().join("staging"));

        assert!(store.read_staged("ghost", "a.txt").await.unwrap().is_none());
        assert!(store.list_staged_files("ghost").await.unwrap().is_empty());
        store.clear_staging("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let tmp = TempDir::new().unwrap();
        let store = StagingStore::new(tmp.path().join("staging"));

        assert!(store.stage_file("f1", "../outside.txt", "x").await.is_err());
        assert!(store.stage_file("../f1", "a.txt", "x").await.is_err());
        assert!(!tmp.path().join("outside.txt").exists());
    }
}
