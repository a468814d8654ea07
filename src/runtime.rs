//! Process-lifetime wiring.
//!
//! A [`Runtime`] is built once from a resolved [`SelfModConfig`] and owns
//! every component plus the lock table they share. Hosts construct it
//! explicitly and pass it (or its parts) to whatever needs them:
//!
//! ```ignore
//! let config = SelfModConfig::resolve(frontend_root, None, None)?;
//! let runtime = Runtime::from_config(config)?;
//! let report = runtime.safe_mode.run_startup_checks().await?;
//! ```

use std::sync::Arc;

use tracing::{info, warn};

use crate::baseline::BaselineManager;
use crate::bridge::{HttpStatusBridge, NoopStatusBridge, StatusBridge};
use crate::changesets::ChangesetStore;
use crate::config::SelfModConfig;
use crate::error::{Result, SelfModError};
use crate::safe_mode::{
    BootStore, ConfiguredSmokeValidator, JsonPackRegistry, PackManager, SafeModeController,
    SafeModeOptions, SmokeValidator,
};
use crate::selfmod::SelfMod;
use crate::store::StateLocks;

/// Collaborators the host may replace.
pub struct Collaborators {
    pub smoke: Arc<dyn SmokeValidator>,
    pub packs: Arc<dyn PackManager>,
    pub bridge: Arc<dyn StatusBridge>,
}

impl Collaborators {
    /// Defaults from configuration: the configured smoke battery, the JSON
    /// pack registry under the state root and the HTTP bridge when a URL is
    /// set.
    pub fn from_config(config: &SelfModConfig, locks: &StateLocks) -> Result<Self> {
        let bridge: Arc<dyn StatusBridge> = match &config.file.bridge_url {
            Some(url) => {
                let bridge =
                    HttpStatusBridge::new(url, config.bridge_token(), config.bridge_timeout())
                        .map_err(|e| SelfModError::Config(format!("{:#}", e)))?;
                info!("Status bridge: {}", bridge.endpoint());
                Arc::new(bridge)
            }
            None => Arc::new(NoopStatusBridge),
        };
        Ok(Self {
            smoke: Arc::new(ConfiguredSmokeValidator::new(config.smoke_checks())),
            packs: Arc::new(JsonPackRegistry::new(&config.state_root, locks.clone())),
            bridge,
        })
    }
}

pub struct Runtime {
    pub config: SelfModConfig,
    pub selfmod: SelfMod,
    pub baseline: Arc<BaselineManager>,
    pub changesets: ChangesetStore,
    pub safe_mode: SafeModeController,
}

impl Runtime {
    pub fn from_config(config: SelfModConfig) -> Result<Self> {
        let locks = StateLocks::new();
        let collaborators = Collaborators::from_config(&config, &locks)?;
        Self::with_collaborators(config, collaborators, locks)
    }

    pub fn with_collaborators(
        config: SelfModConfig,
        collaborators: Collaborators,
        locks: StateLocks,
    ) -> Result<Self> {
        let zones = Arc::new(config.zone_manager()?);
        if !config.frontend_root.is_dir() {
            warn!(
                "Frontend root {} does not exist",
                config.frontend_root.display()
            );
        }

        let selfmod = SelfMod::from_config(&config, zones.clone(), locks.clone());
        let baseline = Arc::new(BaselineManager::new(
            &config.state_root,
            zones.clone(),
            collaborators.packs.clone(),
            locks.clone(),
        ));
        let changesets =
            ChangesetStore::new(&config.state_root, zones, baseline.clone(), locks.clone());
        let safe_mode = SafeModeController::new(
            BootStore::new(&config.state_root, locks),
            baseline.clone(),
            collaborators.smoke,
            collaborators.packs,
            collaborators.bridge,
            SafeModeOptions {
                smoke_timeout: config.smoke_timeout(),
                bridge_timeout: config.bridge_timeout(),
            },
        );

        Ok(Self {
            config,
            selfmod,
            baseline,
            changesets,
            safe_mode,
        })
    }
}
