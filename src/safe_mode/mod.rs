//! Safe mode.
//!
//! At every process start the controller records a new boot, runs the smoke
//! battery and looks for reasons to distrust the current tree: an explicit
//! trigger file, a previous boot that never became healthy, or failing smoke
//! checks. Any of those is reported to the caller, who then either confirms a
//! rollback to the last-known-good baseline or skips it.

mod boot;
mod controller;
mod packs;
mod smoke;

pub use boot::{BootState, BootStatus, BootStore, SafeModeTrigger};
pub use controller::{
    RevertReport, SafeModeController, SafeModeOptions, StartupReport, StartupTrigger,
};
pub use packs::{InstalledPack, JsonPackRegistry, NoopPackManager, PackManager, PackRegistryFile};
pub use smoke::{
    ConfiguredSmokeValidator, SmokeCheckResult, SmokeCheckSpec, SmokeFailure, SmokeSummary,
    SmokeValidator,
};
