//! Blueprint export.
//!
//! A blueprint describes what a feature changed so another agent can
//! reimplement it on a different install: every touched file with its current
//! content and a hash of what was there before the feature started.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SelfModError};
use crate::features::FeatureStatus;
use crate::paths::join_relative;
use crate::revert::{BatchEntryKind, BatchManifest};
use crate::selfmod::SelfMod;
use crate::snapshot::sha256_hex;
use crate::store::write_json;

pub const BLUEPRINT_FORMAT: &str = "stella-blueprint-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Modify,
    Create,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceFile {
    pub path: String,
    pub action: FileAction,
    pub content: String,
    /// `sha256-<hex>` of the content before the feature's first batch.
    pub original_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blueprint {
    pub format: String,
    pub name: String,
    pub description: String,
    pub implementation: String,
    pub version: usize,
    pub feature_id: String,
    pub reference_files: Vec<ReferenceFile>,
    pub created_at: DateTime<Utc>,
}

fn prefixed_hash(content: &[u8]) -> String {
    format!("sha256-{}", sha256_hex(content))
}

impl SelfMod {
    /// Export a blueprint for `feature_id`, write it next to the feature and
    /// mark the feature `packaged`.
    pub async fn package_feature(&self, feature_id: &str, frontend_root: &Path) -> Result<Blueprint> {
        let meta = self
            .features
            .get_feature(feature_id)
            .await?
            .ok_or_else(|| SelfModError::FeatureNotFound(feature_id.to_string()))?;
        let history = self.features.get_history(feature_id).await?;

        // first batch to touch a path decides its action and original hash
        let mut first_touch: BTreeMap<String, usize> = BTreeMap::new();
        for entry in &history {
            for file in &entry.files {
                first_touch.entry(file.clone()).or_insert(entry.batch_index);
            }
        }

        let mut manifests: BTreeMap<usize, Option<BatchManifest>> = BTreeMap::new();
        let mut reference_files = Vec::with_capacity(first_touch.len());

        for (path, batch_index) in first_touch {
            let current = join_relative(frontend_root, &path);
            let content = match tokio::fs::read(&current).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("{} no longer exists, leaving it out", path);
                    continue;
                }
                Err(e) => return Err(SelfModError::io(current, e)),
            };

            if !manifests.contains_key(&batch_index) {
                let manifest = self.batch_manifest(feature_id, batch_index).await?;
                manifests.insert(batch_index, manifest);
            }
            let manifest = manifests.get(&batch_index).and_then(Option::as_ref);

            let (action, original_hash) = match manifest.and_then(|m| m.entry(&path)) {
                Some(entry) => match &entry.kind {
                    BatchEntryKind::Absent => (FileAction::Create, prefixed_hash(b"")),
                    BatchEntryKind::Content { sha256, .. } => {
                        (FileAction::Modify, format!("sha256-{}", sha256))
                    }
                },
                None => {
                    warn!(
                        "No snapshot of {} in batch {}, hashing current content",
                        path, batch_index
                    );
                    (FileAction::Modify, prefixed_hash(&content))
                }
            };

            reference_files.push(ReferenceFile {
                path,
                action,
                content: String::from_utf8_lossy(&content).into_owned(),
                original_hash,
            });
        }

        let blueprint = Blueprint {
            format: BLUEPRINT_FORMAT.to_string(),
            name: meta.name,
            description: String::new(),
            implementation: String::new(),
            version: history.len(),
            feature_id: feature_id.to_string(),
            reference_files,
            created_at: Utc::now(),
        };

        let path = self.features.feature_dir(feature_id)?.join("blueprint.json");
        write_json(&path, &blueprint).await?;
        self.features
            .mark_status(feature_id, FeatureStatus::Packaged)
            .await?;

        info!(
            "Packaged feature {} ({} files, version {})",
            feature_id,
            blueprint.reference_files.len(),
            blueprint.version
        );
        Ok(blueprint)
    }
}
