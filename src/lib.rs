//! Local self-modification core.
//!
//! Lets an agent edit the application's own source tree safely: edits are
//! staged per feature, applied in batches guarded by pre-write snapshots,
//! and can be reverted batch by batch. Full zone snapshots back a
//! last-known-good baseline that safe mode rolls back to when a boot looks
//! unhealthy.

pub mod apply;
pub mod baseline;
pub mod blueprint;
pub mod bridge;
pub mod changesets;
pub mod config;
pub mod error;
pub mod features;
pub mod paths;
pub mod revert;
pub mod runtime;
pub mod safe_mode;
pub mod selfmod;
pub mod snapshot;
pub mod staging;
pub mod store;
pub mod zones;


pub use apply::ApplyResult;
pub use baseline::{BaselineManager, BaselineMetadata, BaselineRequest, BaselineRollback};
pub use blueprint::Blueprint;
pub use changesets::{ChangesetOutcome, ChangesetRecord, ChangesetStatus, ChangesetStore};
pub use config::SelfModConfig;
pub use error::{Result, SelfModError};
pub use features::{FeatureMeta, FeatureStatus, FeatureUpdate, HistoryEntry, NewFeature};
pub use runtime::{Collaborators, Runtime};
pub use selfmod::SelfMod;
pub use store::StateLocks;
pub use zones::ZoneManager;
