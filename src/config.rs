//! Configuration.
//!
//! Roots come from the caller (CLI flags or environment variables).
//! Everything else is read once from the optional `{stateRoot}/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SelfModError};
use crate::safe_mode::SmokeCheckSpec;
use crate::zones::{ZoneDefinition, ZoneManager};

/// Environment variable consulted for the bridge token when the config file
/// does not set one.
pub const BRIDGE_TOKEN_ENV: &str = "STELLA_BRIDGE_TOKEN";

const CONFIG_FILE: &str = "config.json";
const DEFAULT_SMOKE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_BRIDGE_TIMEOUT_SECS: u64 = 10;

/// Contents of `config.json`. Every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<ZoneDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoke_checks: Option<Vec<SmokeCheckSpec>>,
    pub smoke_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_token: Option<String>,
    pub bridge_timeout_secs: u64,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            zones: None,
            smoke_checks: None,
            smoke_timeout_secs: DEFAULT_SMOKE_TIMEOUT_SECS,
            bridge_url: None,
            bridge_token: None,
            bridge_timeout_secs: DEFAULT_BRIDGE_TIMEOUT_SECS,
        }
    }
}

impl ConfigFile {
    /// Load `config.json` from `state_root`. A missing file is the default
    /// configuration; a malformed one is an error.
    pub fn load(state_root: &Path) -> Result<Self> {
        let path = state_root.join(CONFIG_FILE);
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| SelfModError::io(&path, e))?;
        serde_json::from_str(&raw)
            .map_err(|e| SelfModError::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Resolved configuration for one process.
#[derive(Debug, Clone)]
pub struct SelfModConfig {
    /// Source tree the agent edits.
    pub frontend_root: PathBuf,
    /// Baselines, boot status, safe-mode trigger, changesets.
    pub state_root: PathBuf,
    /// Staging, features, per-batch snapshots, active map.
    pub mods_root: PathBuf,
    pub file: ConfigFile,
}

impl SelfModConfig {
    /// Resolve roots, defaulting state and mods roots under `~/.stella`.
    pub fn resolve(
        frontend_root: PathBuf,
        state_root: Option<PathBuf>,
        mods_root: Option<PathBuf>,
    ) -> Result<Self> {
        let base = || -> Result<PathBuf> {
            dirs::home_dir()
                .map(|h| h.join(".stella"))
                .ok_or_else(|| SelfModError::Config("could not determine home directory".into()))
        };
        let state_root = match state_root {
            Some(p) => p,
            None => base()?.join("state"),
        };
        let mods_root = match mods_root {
            Some(p) => p,
            None => base()?.join("mods"),
        };

        let file = ConfigFile::load(&state_root)?;
        info!(
            "Self-mod roots: frontend={}, state={}, mods={}",
            frontend_root.display(),
            state_root.display(),
            mods_root.display()
        );

        Ok(Self {
            frontend_root,
            state_root,
            mods_root,
            file,
        })
    }

    /// Build with an explicit config (tests, embedding hosts).
    pub fn with_file(frontend_root: PathBuf, state_root: PathBuf, mods_root: PathBuf, file: ConfigFile) -> Self {
        Self {
            frontend_root,
            state_root,
            mods_root,
            file,
        }
    }

    /// Zone registry: configured zones, or one `frontend` zone at the
    /// frontend root.
    pub fn zone_manager(&self) -> Result<ZoneManager> {
        match &self.file.zones {
            Some(zones) if !zones.is_empty() => {
                ZoneManager::new(self.frontend_root.clone(), zones.clone())
            }
            _ => Ok(ZoneManager::single_frontend(self.frontend_root.clone())),
        }
    }

    /// Configured smoke battery, or the default `package.json` checks.
    pub fn smoke_checks(&self) -> Vec<SmokeCheckSpec> {
        self.file
            .smoke_checks
            .clone()
            .unwrap_or_else(SmokeCheckSpec::default_battery)
    }

    pub fn smoke_timeout(&self) -> Duration {
        Duration::from_secs(self.file.smoke_timeout_secs)
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_secs(self.file.bridge_timeout_secs)
    }

    pub fn bridge_token(&self) -> Option<String> {
        self.file
            .bridge_token
            .clone()
            .or_else(|| std::env::var(BRIDGE_TOKEN_ENV).ok())
            .filter(|t| !t.is_empty())
    }
}
