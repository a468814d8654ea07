//! The self-modification context.
//!
//! `SelfMod` is constructed once by the host and passed to whatever needs it
//! (tool handlers, IPC endpoints, the CLI). It owns the zone registry, the
//! staging store, the feature store and the lock table shared between them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::SelfModConfig;
use crate::error::Result;
use crate::features::{FeatureMeta, FeatureStore, FeatureUpdate, HistoryEntry, NewFeature};
use crate::snapshot::{
    create_snapshot, restore_snapshot, RestoreOptions, RestoreResult, Snapshot, SnapshotOptions,
};
use crate::staging::StagingStore;
use crate::store::StateLocks;
use crate::zones::ZoneManager;

pub struct SelfMod {
    mods_root: PathBuf,
    pub(crate) staging: StagingStore,
    pub(crate) features: FeatureStore,
    pub(crate) zones: Arc<ZoneManager>,
    pub(crate) locks: StateLocks,
}

impl SelfMod {
    /// Build a context over `{mods_root}` with an existing zone registry.
    pub fn new(mods_root: PathBuf, zones: Arc<ZoneManager>, locks: StateLocks) -> Self {
        Self {
            staging: StagingStore::new(mods_root.join("staging")),
            features: FeatureStore::new(&mods_root, locks.clone()),
            mods_root,
            zones,
            locks,
        }
    }

    pub fn from_config(config: &SelfModConfig, zones: Arc<ZoneManager>, locks: StateLocks) -> Self {
        Self::new(config.mods_root.clone(), zones, locks)
    }

    pub fn mods_root(&self) -> &Path {
        &self.mods_root
    }

    pub fn zones(&self) -> &ZoneManager {
        &self.zones
    }

    pub fn staging(&self) -> &StagingStore {
        &self.staging
    }

    pub fn features(&self) -> &FeatureStore {
        &self.features
    }

    // ========== Staging ==========

    pub async fn stage_file(
        &self,
        feature_id: &str,
        relative_path: &str,
        content: impl AsRef<[u8]>,
    ) -> Result<String> {
        self.staging
            .stage_file(feature_id, relative_path, content)
            .await
    }

    pub async fn read_staged(&self, feature_id: &str, relative_path: &str) -> Result<Option<Vec<u8>>> {
        self.staging.read_staged(feature_id, relative_path).await
    }

    pub async fn list_staged_files(&self, feature_id: &str) -> Result<Vec<String>> {
        self.staging.list_staged_files(feature_id).await
    }

    pub async fn clear_staging(&self, feature_id: &str) -> Result<()> {
        self.staging.clear_staging(feature_id).await
    }

    // ========== Features ==========

    pub async fn create_feature(&self, new: NewFeature) -> Result<FeatureMeta> {
        self.features.create_feature(new).await
    }

    pub async fn get_feature(&self, feature_id: &str) -> Result<Option<FeatureMeta>> {
        self.features.get_feature(feature_id).await
    }

    pub async fn update_feature(&self, feature_id: &str, update: FeatureUpdate) -> Result<FeatureMeta> {
        self.features.update_feature(feature_id, update).await
    }

    pub async fn list_features(&self) -> Result<Vec<FeatureMeta>> {
        self.features.list_features().await
    }

    pub async fn get_active_feature(&self, conversation_id: &str) -> Option<String> {
        self.features.get_active_feature(conversation_id).await
    }

    pub async fn set_active_feature(&self, conversation_id: &str, feature_id: &str) -> Result<()> {
        self.features
            .set_active_feature(conversation_id, feature_id)
            .await
    }

    pub async fn clear_active_feature(&self, conversation_id: &str) -> Result<()> {
        self.features.clear_active_feature(conversation_id).await
    }

    pub async fn get_history(&self, feature_id: &str) -> Result<Vec<HistoryEntry>> {
        self.features.get_history(feature_id).await
    }

    // ========== Zone snapshots ==========

    pub async fn take_snapshot(&self, options: &SnapshotOptions) -> Result<Snapshot> {
        create_snapshot(&self.zones, options).await
    }

    pub async fn restore_zone_snapshot(
        &self,
        snapshot: &Snapshot,
        options: &RestoreOptions,
    ) -> Result<RestoreResult> {
        restore_snapshot(snapshot, &self.zones, options).await
    }
}
