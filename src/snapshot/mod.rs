//! Zone snapshots: capture, diff and restore.
//!
//! A snapshot records every file of the selected zones (or of a subset of
//! virtual paths) with its sha256 and content. Restores never overwrite
//! blindly: the live tree is captured with the same scope, diffed against the
//! target, and only the differing paths are touched. Running the same restore
//! twice therefore does nothing the second time, and a restore interrupted
//! halfway can simply be re-run.

mod types;

pub use types::{
    ContentEncoding, DiffKind, RestoreOptions, RestoreResult, Snapshot, SnapshotDiffEntry,
    SnapshotFile, SnapshotOptions,
};

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SelfModError};
use crate::paths::{
    join_relative, list_files, remove_file_if_exists, write_with_parents, SKIPPED_DIRS,
};
use crate::store::{read_json, write_json};
use crate::zones::{matches_subset, Zone, ZoneManager};

/// Lowercase hex sha256 of `content`.
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Capture the selected zones.
pub async fn create_snapshot(zones: &ZoneManager, options: &SnapshotOptions) -> Result<Snapshot> {
    let selected = zones.select_zones(options.zone_kinds.as_deref(), options.zone_names.as_deref());
    let subset = options
        .subset_paths
        .as_ref()
        .map(|paths| zones.resolve_subset(paths));

    let mut files: BTreeMap<String, SnapshotFile> = BTreeMap::new();

    for zone in &selected {
        for candidate in candidate_files(zone, subset.as_deref()).await {
            let Some(class) = zones.classify_path(&candidate) else {
                continue;
            };
            // nested roots of another zone take precedence
            if class.zone != zone.name || files.contains_key(&class.virtual_path) {
                continue;
            }
            if let Some(prefixes) = &subset {
                if !matches_subset(&class.virtual_path, prefixes) {
                    continue;
                }
            }

            let bytes = match tokio::fs::read(&candidate).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to read {} for snapshot: {}", candidate.display(), e);
                    continue;
                }
            };

            let (encoding, content) = encode_content(bytes.as_slice());
            files.insert(
                class.virtual_path.clone(),
                SnapshotFile {
                    absolute_path: class.absolute_path,
                    virtual_path: class.virtual_path,
                    zone: class.zone,
                    zone_relative_path: class.zone_relative_path,
                    size: bytes.len() as u64,
                    sha256: sha256_hex(&bytes),
                    encoding,
                    content,
                },
            );
        }
    }

    let zone_roots = zones
        .get_zone_roots()
        .into_iter()
        .filter(|(name, _)| selected.iter().any(|z| z.name == *name))
        .collect();

    let snapshot = Snapshot {
        id: Uuid::new_v4().to_string(),
        created_at: Utc::now(),
        zone_roots,
        subset,
        files,
    };

    debug!(
        "Snapshot {}: {} files, {} bytes",
        snapshot.id,
        snapshot.file_count(),
        snapshot.total_bytes()
    );
    Ok(snapshot)
}

/// Files to consider for one zone. With a subset only the named files and
/// directories are visited instead of the whole zone.
async fn candidate_files(zone: &Zone, subset: Option<&[String]>) -> Vec<PathBuf> {
    let Some(prefixes) = subset else {
        let mut all = Vec::new();
        for root in &zone.roots {
            all.extend(list_files(root, SKIPPED_DIRS).await);
        }
        return all;
    };

    let mut out = Vec::new();
    for prefix in prefixes {
        let rest = if *prefix == zone.name {
            ""
        } else if let Some(rest) = prefix.strip_prefix(&format!("{}/", zone.name)) {
            rest
        } else {
            continue;
        };

        for root in &zone.roots {
            let path = join_relative(root, rest);
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => out.push(path),
                Ok(meta) if meta.is_dir() => out.extend(list_files(&path, SKIPPED_DIRS).await),
                _ => {}
            }
        }
    }
    out
}

fn encode_content(bytes: &[u8]) -> (ContentEncoding, String) {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.contains('\0') => (ContentEncoding::Utf8, text.to_string()),
        _ => (ContentEncoding::Base64, STANDARD.encode(bytes)),
    }
}

/// Differences from `before` to `after`, sorted by virtual path.
///
/// Only in `after` is `added`, only in `before` is `deleted`, in both with a
/// different hash is `modified`. Equal hashes are omitted.
pub fn diff_snapshots(before: &Snapshot, after: &Snapshot) -> Vec<SnapshotDiffEntry> {
    let keys: BTreeSet<&String> = before.files.keys().chain(after.files.keys()).collect();

    keys.into_iter()
        .filter_map(|key| {
            let b = before.files.get(key);
            let a = after.files.get(key);
            let kind = match (b, a) {
                (None, Some(_)) => DiffKind::Added,
                (Some(_), None) => DiffKind::Deleted,
                (Some(b), Some(a)) if b.sha256 != a.sha256 => DiffKind::Modified,
                _ => return None,
            };
            Some(SnapshotDiffEntry {
                virtual_path: key.clone(),
                kind,
                before_hash: b.map(|f| f.sha256.clone()),
                after_hash: a.map(|f| f.sha256.clone()),
                before: b.cloned(),
                after: a.cloned(),
            })
        })
        .collect()
}

/// Bring the live tree back to `target`, touching only paths that differ.
///
/// Scope defaults to the zones recorded in `target`, so a snapshot of one
/// zone never deletes files from another.
pub async fn restore_snapshot(
    target: &Snapshot,
    zones: &ZoneManager,
    options: &RestoreOptions,
) -> Result<RestoreResult> {
    let zone_names = options
        .zone_names
        .clone()
        .unwrap_or_else(|| target.zone_roots.keys().cloned().collect());
    let subset = options
        .subset_paths
        .as_ref()
        .map(|paths| zones.resolve_subset(paths))
        .or_else(|| target.subset.clone());

    let current = create_snapshot(
        zones,
        &SnapshotOptions {
            zone_kinds: None,
            zone_names: Some(zone_names.clone()),
            subset_paths: subset.clone(),
        },
    )
    .await?;

    // target -> current: "added" exists now but not in the target
    let diffs: Vec<SnapshotDiffEntry> = diff_snapshots(target, &current)
        .into_iter()
        .filter(|d| zone_names.iter().any(|z| z == d.zone()))
        .filter(|d| {
            subset
                .as_deref()
                .map_or(true, |prefixes| matches_subset(&d.virtual_path, prefixes))
        })
        .collect();

    let mut restored_count = 0;
    for diff in &diffs {
        match diff.kind {
            DiffKind::Added => {
                if let Some(live) = &diff.after {
                    remove_file_if_exists(&live.absolute_path).await?;
                    debug!("Removed {}", diff.virtual_path);
                    restored_count += 1;
                }
            }
            DiffKind::Modified | DiffKind::Deleted => {
                let Some(wanted) = &diff.before else {
                    continue;
                };
                let Some(path) = restore_location(zones, wanted, diff.after.as_ref()) else {
                    warn!("No zone root for {}, skipping", diff.virtual_path);
                    continue;
                };
                write_with_parents(&path, &wanted.decode()?).await?;
                debug!("Restored {}", diff.virtual_path);
                restored_count += 1;
            }
        }
    }

    info!(
        "Restored snapshot {}: {} paths changed",
        target.id, restored_count
    );
    Ok(RestoreResult {
        restored_count,
        diffs,
    })
}

/// Where to write a file being restored: the live file if there is one, the
/// recorded absolute path if it still maps to the same virtual path, else the
/// zone root on this machine.
fn restore_location(
    zones: &ZoneManager,
    wanted: &SnapshotFile,
    live: Option<&SnapshotFile>,
) -> Option<PathBuf> {
    if let Some(live) = live {
        return Some(live.absolute_path.clone());
    }
    let recorded_matches = zones
        .classify_path(&wanted.absolute_path)
        .is_some_and(|c| c.virtual_path == wanted.virtual_path);
    if recorded_matches {
        return Some(wanted.absolute_path.clone());
    }
    zones.resolve_virtual_path(&wanted.virtual_path)
}

/// Persist a snapshot as pretty JSON.
pub async fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    write_json(path, snapshot).await
}

/// Load a persisted snapshot. Missing or corrupt files yield `None`.
pub async fn load_snapshot(path: &Path) -> Option<Snapshot> {
    read_json(path).await
}

/// Load a persisted snapshot the caller cannot do without.
pub async fn require_snapshot(path: &Path) -> Result<Snapshot> {
    load_snapshot(path)
        .await
        .ok_or_else(|| SelfModError::BaselineSnapshotMissing(path.to_path_buf()))
}
