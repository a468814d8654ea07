//! Path helpers shared by staging, snapshots and zone classification.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, SelfModError};

/// Directory names never descended into when capturing zone snapshots.
pub const SKIPPED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "dist-electron",
    "release",
    "coverage",
    "bundles",
    "cache",
];

/// Paths compare case-insensitively on the platforms whose default
/// filesystems do.
pub const CASE_INSENSITIVE_PATHS: bool = cfg!(any(windows, target_os = "macos"));

/// Validate a caller-supplied relative path and return it posix-separated.
///
/// Rejects empty paths, absolute paths, drive prefixes and `..` components so
/// nothing staged or restored can land outside its root.
pub fn sanitize_relative_path(raw: &str) -> Result<String> {
    let unified = raw.replace('\\', "/");
    if unified.starts_with('/') || Path::new(raw).is_absolute() {
        return Err(SelfModError::invalid_path(raw, "path must be relative"));
    }

    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(SelfModError::invalid_path(
                    raw,
                    "parent directory components are not allowed",
                ))
            }
            p if p.ends_with(':') => {
                return Err(SelfModError::invalid_path(raw, "drive prefixes are not allowed"))
            }
            p => parts.push(p),
        }
    }

    if parts.is_empty() {
        return Err(SelfModError::invalid_path(raw, "path is empty"));
    }
    Ok(parts.join("/"))
}

/// Validate an identifier used as a single directory name (feature ids,
/// changeset ids, baseline ids).
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id == "."
        || id == ".."
        || id.contains('/')
        || id.contains('\\')
        || id.contains(':')
    {
        return Err(SelfModError::invalid_path(
            id,
            "identifier must be a single path segment",
        ));
    }
    Ok(())
}

/// Join a sanitized posix relative path onto a root.
pub fn join_relative(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|p| !p.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// Resolve `.` and `..` without touching the filesystem.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Posix-separated relative form of `path` under `root`, if it is under it.
pub fn relative_posix(path: &Path, root: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
}

/// List every regular file under `root`, skipping directories named in
/// `skip_dirs`. Symlinks are not followed. A missing root yields nothing.
pub fn list_files_blocking(root: &Path, skip_dirs: &[&str]) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !skip_dirs.iter().any(|skip| *skip == name)
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error walking directory {}: {}", root.display(), e);
                continue;
            }
        };
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }

    debug!("Listed {} files under {}", files.len(), root.display());
    files
}

/// Async wrapper around [`list_files_blocking`] that keeps the directory walk
/// off the runtime threads.
pub async fn list_files(root: &Path, skip_dirs: &'static [&'static str]) -> Vec<PathBuf> {
    let root = root.to_path_buf();
    match tokio::task::spawn_blocking(move || list_files_blocking(&root, skip_dirs)).await {
        Ok(files) => files,
        Err(e) => {
            warn!("Directory walk task failed: {}", e);
            Vec::new()
        }
    }
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SelfModError::io(path, e)),
    }
}

/// Write bytes to `path`, creating parent directories first.
pub async fn write_with_parents(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SelfModError::io(parent, e))?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| SelfModError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_relative_path() {
        assert_eq!(sanitize_relative_path("src/App.tsx").unwrap(), "src/App.tsx");
        assert_eq!(sanitize_relative_path("./src//a.ts").unwrap(), "src/a.ts");
        assert_eq!(sanitize_relative_path("src\\win\\b.ts").unwrap(), "src/win/b.ts");
        assert!(sanitize_relative_path("../etc/passwd").is_err());
        assert!(sanitize_relative_path("src/../../x").is_err());
        assert!(sanitize_relative_path("/abs/path").is_err());
        assert!(sanitize_relative_path("C:/x").is_err());
        assert!(sanitize_relative_path("").is_err());
        assert!(sanitize_relative_path("./").is_err());
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("feature-1").is_ok());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("..").is_err());
        assert!(validate_id("").is_err());
    }

    #[test]
    fn test_lexical_normalize() {
        assert_eq!(
            lexical_normalize(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }

    #[test]
    fn test_list_files_skips_vendor_dirs() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::create_dir_all(tmp.path().join("node_modules/pkg")).unwrap();
        std::fs::write(tmp.path().join("src/main.ts"), "x").unwrap();
        std::fs::write(tmp.path().join("node_modules/pkg/index.js"), "y").unwrap();

        let files = list_files_blocking(tmp.path(), SKIPPED_DIRS);
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("src/main.ts"));
    }

    #[test]
    fn test_list_files_missing_root() {
        let tmp = TempDir::new().unwrap();
        assert!(list_files_blocking(&tmp.path().join("nope"), SKIPPED_DIRS).is_empty());
    }
}
