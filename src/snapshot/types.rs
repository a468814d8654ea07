//! Snapshot data types.

use std::collections::BTreeMap;
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SelfModError};

/// How [`SnapshotFile::content`] is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    Utf8,
    Base64,
}

/// One captured file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFile {
    pub absolute_path: PathBuf,
    pub virtual_path: String,
    pub zone: String,
    pub zone_relative_path: String,
    pub size: u64,
    /// Lowercase hex sha256 of the raw bytes.
    pub sha256: String,
    pub encoding: ContentEncoding,
    pub content: String,
}

impl SnapshotFile {
    /// Raw bytes of the captured content.
    pub fn decode(&self) -> Result<Vec<u8>> {
        match self.encoding {
            ContentEncoding::Utf8 => Ok(self.content.clone().into_bytes()),
            ContentEncoding::Base64 => STANDARD.decode(&self.content).map_err(|e| {
                SelfModError::Config(format!(
                    "snapshot content for {} is not valid base64: {}",
                    self.virtual_path, e
                ))
            }),
        }
    }
}

/// A point-in-time capture of one or more zones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Zone name to roots at capture time.
    pub zone_roots: BTreeMap<String, Vec<String>>,
    /// Present when the capture was limited to a subset of virtual paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<Vec<String>>,
    /// Keyed by virtual path.
    pub files: BTreeMap<String, SnapshotFile>,
}

impl Snapshot {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }
}

/// Scope of a capture.
#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    pub zone_kinds: Option<Vec<String>>,
    pub zone_names: Option<Vec<String>>,
    /// Absolute, virtual or project-relative paths (files or directories).
    pub subset_paths: Option<Vec<String>>,
}

/// Scope of a zone restore.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub zone_names: Option<Vec<String>>,
    pub subset_paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Added,
    Modified,
    Deleted,
}

/// One difference between two snapshots, keyed by virtual path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDiffEntry {
    pub virtual_path: String,
    pub kind: DiffKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_hash: Option<String>,
    #[serde(skip)]
    pub before: Option<SnapshotFile>,
    #[serde(skip)]
    pub after: Option<SnapshotFile>,
}

impl SnapshotDiffEntry {
    pub fn zone(&self) -> &str {
        self.virtual_path
            .split_once('/')
            .map(|(z, _)| z)
            .unwrap_or(&self.virtual_path)
    }
}

/// Outcome of a zone restore.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub restored_count: usize,
    pub diffs: Vec<SnapshotDiffEntry>,
}
