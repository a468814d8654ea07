//! Feature (changeset) lifecycle.
//!
//! Each feature lives under `{modsRoot}/features/{featureId}/` with a
//! `meta.json`, an append-only `history.json` of apply batches, and one
//! snapshot directory per batch. `{modsRoot}/active.json` maps conversation
//! ids to the feature currently being worked on in that conversation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SelfModError};
use crate::paths::validate_id;
use crate::store::{read_json, read_json_or_default, write_json, StateLocks};

/// Lifecycle status of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureStatus {
    Active,
    Applied,
    Reverted,
    Packaged,
}

impl FeatureStatus {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `packaged` is reachable from anywhere and does not freeze the feature.
    pub fn can_transition_to(self, next: FeatureStatus) -> bool {
        use FeatureStatus::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (_, Packaged) => true,
            (Active, Applied) => true,
            (Applied, Reverted) => true,
            (Reverted, Applied) => true,
            (Packaged, Active | Applied | Reverted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeatureStatus::Active => "active",
            FeatureStatus::Applied => "applied",
            FeatureStatus::Reverted => "reverted",
            FeatureStatus::Packaged => "packaged",
        };
        f.write_str(s)
    }
}

/// Stored in `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureMeta {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub status: FeatureStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One apply batch. Never mutated after it is written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub batch_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub files: Vec<String>,
    pub applied_at: DateTime<Utc>,
}

/// Arguments for [`FeatureStore::create_feature`].
#[derive(Debug, Clone, Default)]
pub struct NewFeature {
    pub id: String,
    pub name: String,
    pub description: String,
    pub conversation_id: Option<String>,
}

/// Partial update for [`FeatureStore::update_feature`].
#[derive(Debug, Clone, Default)]
pub struct FeatureUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<FeatureStatus>,
}

/// Feature metadata, history and the active-feature map.
#[derive(Clone)]
pub struct FeatureStore {
    features_root: PathBuf,
    active_path: PathBuf,
    locks: StateLocks,
}

impl FeatureStore {
    pub fn new(mods_root: &Path, locks: StateLocks) -> Self {
        Self {
            features_root: mods_root.join("features"),
            active_path: mods_root.join("active.json"),
            locks,
        }
    }

    pub fn features_root(&self) -> &Path {
        &self.features_root
    }

    pub fn feature_dir(&self, feature_id: &str) -> Result<PathBuf> {
        validate_id(feature_id)?;
        Ok(self.features_root.join(feature_id))
    }

    pub fn snapshots_dir(&self, feature_id: &str) -> Result<PathBuf> {
        Ok(self.feature_dir(feature_id)?.join("snapshots"))
    }

    pub fn batch_snapshot_dir(&self, feature_id: &str, batch_index: usize) -> Result<PathBuf> {
        Ok(self.snapshots_dir(feature_id)?.join(batch_index.to_string()))
    }

    fn meta_path(&self, feature_id: &str) -> Result<PathBuf> {
        Ok(self.feature_dir(feature_id)?.join("meta.json"))
    }

    fn history_path(&self, feature_id: &str) -> Result<PathBuf> {
        Ok(self.feature_dir(feature_id)?.join("history.json"))
    }

    /// Create a feature in `active` status with an empty history.
    ///
    /// Creating an id that already exists returns the existing metadata.
    pub async fn create_feature(&self, new: NewFeature) -> Result<FeatureMeta> {
        let meta_path = self.meta_path(&new.id)?;
        let _guard = self.locks.lock(&meta_path).await;

        if let Some(existing) = read_json::<FeatureMeta>(&meta_path).await {
            debug!("Feature {} already exists", new.id);
            return Ok(existing);
        }

        let now = Utc::now();
        let meta = FeatureMeta {
            name: if new.name.is_empty() {
                new.id.clone()
            } else {
                new.name
            },
            id: new.id,
            description: new.description,
            conversation_id: new.conversation_id,
            status: FeatureStatus::Active,
            created_at: now,
            updated_at: now,
        };

        write_json(&meta_path, &meta).await?;
        write_json(&self.history_path(&meta.id)?, &Vec::<HistoryEntry>::new()).await?;
        info!("Created feature {} ({})", meta.id, meta.name);
        Ok(meta)
    }

    /// Feature metadata, or `None` if it was never created.
    pub async fn get_feature(&self, feature_id: &str) -> Result<Option<FeatureMeta>> {
        Ok(read_json(&self.meta_path(feature_id)?).await)
    }

    /// Apply a partial update, validating any status change.
    pub async fn update_feature(&self, feature_id: &str, update: FeatureUpdate) -> Result<FeatureMeta> {
        let meta_path = self.meta_path(feature_id)?;
        let _guard = self.locks.lock(&meta_path).await;

        let mut meta: FeatureMeta = read_json(&meta_path)
            .await
            .ok_or_else(|| SelfModError::FeatureNotFound(feature_id.to_string()))?;

        if let Some(status) = update.status {
            if !meta.status.can_transition_to(status) {
                return Err(SelfModError::InvalidTransition {
                    id: feature_id.to_string(),
                    from: meta.status,
                    to: status,
                });
            }
            if meta.status != status {
                info!("Feature {}: {} -> {}", feature_id, meta.status, status);
            }
            meta.status = status;
        }
        if let Some(name) = update.name {
            meta.name = name;
        }
        if let Some(description) = update.description {
            meta.description = description;
        }
        meta.updated_at = Utc::now();

        write_json(&meta_path, &meta).await?;
        Ok(meta)
    }

    /// Move a feature to `status`. A feature that was never created is left
    /// alone (returns `None`).
    pub async fn mark_status(&self, feature_id: &str, status: FeatureStatus) -> Result<Option<FeatureMeta>> {
        if self.get_feature(feature_id).await?.is_none() {
            debug!("No metadata for feature {}, status not recorded", feature_id);
            return Ok(None);
        }
        self.update_feature(
            feature_id,
            FeatureUpdate {
                status: Some(status),
                ..Default::default()
            },
        )
        .await
        .map(Some)
    }

    /// Every feature with readable metadata, most recently updated first.
    pub async fn list_features(&self) -> Result<Vec<FeatureMeta>> {
        let mut entries = match tokio::fs::read_dir(&self.features_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SelfModError::io(&self.features_root, e)),
        };

        let mut features = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Error reading features directory: {}", e);
                    break;
                }
            };
            if let Some(meta) = read_json::<FeatureMeta>(&entry.path().join("meta.json")).await {
                features.push(meta);
            }
        }

        features.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(features)
    }

    /// Apply history, oldest batch first.
    pub async fn get_history(&self, feature_id: &str) -> Result<Vec<HistoryEntry>> {
        Ok(read_json_or_default(&self.history_path(feature_id)?).await)
    }

    /// Append one history entry and persist the whole log.
    pub async fn append_history(&self, feature_id: &str, entry: HistoryEntry) -> Result<()> {
        let path = self.history_path(feature_id)?;
        let _guard = self.locks.lock(&path).await;

        let mut history: Vec<HistoryEntry> = read_json_or_default(&path).await;
        history.push(entry);
        write_json(&path, &history).await
    }

    /// Feature currently active in a conversation.
    pub async fn get_active_feature(&self, conversation_id: &str) -> Option<String> {
        let map: BTreeMap<String, String> = read_json_or_default(&self.active_path).await;
        map.get(conversation_id).cloned()
    }

    /// Make `feature_id` the active feature of `conversation_id`.
    pub async fn set_active_feature(&self, conversation_id: &str, feature_id: &str) -> Result<()> {
        validate_id(feature_id)?;
        let _guard = self.locks.lock(&self.active_path).await;

        let mut map: BTreeMap<String, String> = read_json_or_default(&self.active_path).await;
        map.insert(conversation_id.to_string(), feature_id.to_string());
        write_json(&self.active_path, &map).await?;
        debug!("Conversation {} now active on {}", conversation_id, feature_id);
        Ok(())
    }

    /// Forget the active feature of a conversation.
    pub async fn clear_active_feature(&self, conversation_id: &str) -> Result<()> {
        let _guard = self.locks.lock(&self.active_path).await;

        let mut map: BTreeMap<String, String> = read_json_or_default(&self.active_path).await;
        if map.remove(conversation_id).is_some() {
            write_json(&self.active_path, &map).await?;
        }
        Ok(())
    }
}
