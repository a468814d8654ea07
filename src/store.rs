//! JSON state files.
//!
//! Every state file is pretty-printed JSON written whole. Writes go through a
//! temp file and a rename so readers never observe a torn file. Reads treat a
//! missing file as the type's default; an unparseable file is moved aside to
//! `<name>.corrupt-<timestamp>` and logged before falling back, so corrupted
//! state is never silently overwritten.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::error::{Result, SelfModError};

const TMP_SUFFIX: &str = "tmp";

/// Read and parse a JSON state file.
///
/// Returns `None` when the file is absent, unreadable or corrupt.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "state file unreadable, using default"
            );
            return None;
        }
    };

    match serde_json::from_str::<T>(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "state file corrupt, moving it aside and using default"
            );
            quarantine(path).await;
            None
        }
    }
}

/// Like [`read_json`], falling back to `T::default()`.
pub async fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    read_json(path).await.unwrap_or_default()
}

async fn quarantine(path: &Path) {
    let Some(name) = path.file_name() else {
        return;
    };
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let target = path.with_file_name(format!("{}.corrupt-{}", name.to_string_lossy(), stamp));
    if let Err(e) = tokio::fs::rename(path, &target).await {
        warn!("Failed to move corrupt state file {}: {}", path.display(), e);
    }
}

/// Serialize `value` and atomically replace `path` with it.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let encoded = serde_json::to_string_pretty(value).map_err(|e| SelfModError::Encode {
        what: path.display().to_string(),
        source: e,
    })?;
    write_atomic(path, encoded.as_bytes()).await?;
    debug!("Saved {}", path.display());
    Ok(())
}

/// Write bytes to a sibling temp file, fsync it, then rename over `path`.
pub async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SelfModError::io(parent, e))?;
    }

    let tmp_path = tmp_path_for(path);
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| SelfModError::io(&tmp_path, e))?;
    file.write_all(content)
        .await
        .map_err(|e| SelfModError::io(&tmp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| SelfModError::io(&tmp_path, e))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| SelfModError::io(path, e))
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{}.{}", name, TMP_SUFFIX))
}

/// In-process locks keyed by path.
///
/// Held around each read-modify-write of a state file, and around whole
/// apply/revert operations per feature. Cloning shares the same lock table.
/// Entries nobody holds or waits on are pruned on the next `lock` call, so the
/// table only holds paths that are in use.
#[derive(Clone, Default)]
pub struct StateLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl StateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &Path) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut table = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            // the table's own reference is the only one left once released
            table.retain(|_, mutex| Arc::strong_count(mutex) > 1);
            table.entry(key.to_path_buf()).or_default().clone()
        };
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        count: u32,
    }

    #[tokio::test]
    async fn test_missing_file_is_default() {
        let tmp = TempDir::new().unwrap();
        let value: Sample = read_json_or_default(&tmp.path().join("absent.json")).await;
        assert_eq!(value, Sample::default());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/state.json");
        write_json(&path, &Sample { count: 3 }).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n  \"count\": 3"));
        assert!(!tmp_path_for(&path).exists());

        let value: Sample = read_json_or_default(&path).await;
        assert_eq!(value.count, 3);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_quarantined() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        let value: Option<Sample> = read_json(&path).await;
        assert!(value.is_none());
        assert!(!path.exists());

        let moved: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("state.json.corrupt-"))
            .collect();
        assert_eq!(moved.len(), 1);
    }

    #[tokio::test]
    async fn test_locks_serialize_same_key() {
        let locks = StateLocks::new();
        let guard = locks.lock(Path::new("/tmp/a.json")).await;

        let other = locks.clone();
        let handle = tokio::spawn(async move {
            let _g = other.lock(Path::new("/tmp/a.json")).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        drop(guard);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_released_locks_are_pruned() {
        let locks = StateLocks::new();
        for i in 0..10 {
            let _g = locks.lock(&PathBuf::from(format!("/tmp/feature-{i}"))).await;
        }
        let held = locks.lock(Path::new("/tmp/held.json")).await;
        let _other = locks.lock(Path::new("/tmp/other.json")).await;

        {
            let table = locks.inner.lock().unwrap();
            let mut keys: Vec<_> = table.keys().cloned().collect();
            keys.sort();
            assert_eq!(
                keys,
                vec![PathBuf::from("/tmp/held.json"), PathBuf::from("/tmp/other.json")]
            );
        }
        drop(held);
    }
}
