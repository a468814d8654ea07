use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use stella_selfmod::FeatureStatus;

/// Stella self-mod: stage, apply and revert source edits; baselines and safe mode
#[derive(Parser)]
#[command(name = "stella-selfmod")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Source tree being modified (auto-detects git root if absent)
    #[arg(long, env = "STELLA_FRONTEND_ROOT", global = true)]
    pub frontend_root: Option<String>,

    /// State directory (baselines, boot status, changesets). Defaults to ~/.stella/state
    #[arg(long, env = "STELLA_STATE_ROOT", global = true)]
    pub state_root: Option<String>,

    /// Mods directory (staging, features). Defaults to ~/.stella/mods
    #[arg(long, env = "STELLA_MODS_ROOT", global = true)]
    pub mods_root: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Stage a file for a feature (content from --content, --from, or stdin)
    Stage {
        feature: String,
        /// Path relative to the frontend root
        path: String,
        #[arg(long, conflicts_with = "from")]
        content: Option<String>,
        /// Read the content from this file
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// List staged files of a feature
    Staged { feature: String },
    /// Drop everything staged for a feature
    Discard { feature: String },
    /// Manage features
    Feature {
        #[command(subcommand)]
        command: FeatureCommand,
    },
    /// Apply staged files to the frontend root
    Apply {
        feature: String,
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Show the apply history of a feature
    History { feature: String },
    /// List revert points of a feature
    Snapshots { feature: String },
    /// Restore the files of one apply batch and mark the feature reverted
    Revert { feature: String, batch: usize },
    /// Zone snapshots
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
    /// Last-known-good baselines
    Baseline {
        #[command(subcommand)]
        command: BaselineCommand,
    },
    /// Zone changesets
    Changeset {
        #[command(subcommand)]
        command: ChangesetCommand,
    },
    /// Boot health checks and safe mode
    Boot {
        #[command(subcommand)]
        command: BootCommand,
    },
    /// Export a feature blueprint
    Package { feature: String },
}

#[derive(Subcommand)]
pub enum FeatureCommand {
    /// Create a feature (returns the existing one if the id is taken)
    Create {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
        /// Owning conversation; the feature becomes its active feature
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Show one feature
    Show { id: String },
    /// List features, most recently updated first
    List,
    /// Update name, description or status
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },
    /// Make a feature the active one of a conversation
    Activate { conversation: String, feature: String },
    /// Show (or clear) the active feature of a conversation
    Active {
        conversation: String,
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Active,
    Applied,
    Reverted,
    Packaged,
}

impl From<StatusArg> for FeatureStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Active => FeatureStatus::Active,
            StatusArg::Applied => FeatureStatus::Applied,
            StatusArg::Reverted => FeatureStatus::Reverted,
            StatusArg::Packaged => FeatureStatus::Packaged,
        }
    }
}

#[derive(Subcommand)]
pub enum SnapshotCommand {
    /// Capture zones to a snapshot file
    Take {
        /// Write the snapshot here (prints a summary instead of the content)
        #[arg(long)]
        out: PathBuf,
        #[arg(long = "zone")]
        zones: Vec<String>,
        #[arg(long = "kind")]
        kinds: Vec<String>,
        /// Limit to these paths (absolute, virtual or project-relative)
        #[arg(long = "subset")]
        subset: Vec<String>,
    },
    /// Diff two snapshot files, or one against the live tree
    Diff { before: PathBuf, after: Option<PathBuf> },
    /// Bring the live tree back to a snapshot file
    Restore {
        snapshot: PathBuf,
        #[arg(long = "zone")]
        zones: Vec<String>,
        #[arg(long = "subset")]
        subset: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum BaselineCommand {
    /// Create a baseline if none exists
    Ensure,
    /// Capture a new last-known-good baseline
    Create {
        #[arg(long)]
        changeset: Option<String>,
        #[arg(long)]
        scope: Option<String>,
    },
    /// Show the last-known-good baseline
    Show {
        /// Show the whole history instead
        #[arg(long)]
        history: bool,
    },
    /// Restore the last-known-good baseline
    Rollback {
        #[arg(long, default_value = "manual rollback")]
        reason: String,
    },
}

#[derive(Subcommand)]
pub enum ChangesetCommand {
    /// Open a changeset (returns the open one if any)
    Start {
        #[arg(long)]
        scope: Option<String>,
        #[arg(long = "zone")]
        zones: Vec<String>,
    },
    /// Close a changeset, optionally promoting the result to a baseline
    Finish {
        id: String,
        #[arg(long)]
        promote: bool,
    },
    /// Restore the state a changeset started from
    Rollback { id: String },
    /// Show the open changeset
    Active,
}

#[derive(Subcommand)]
pub enum BootCommand {
    /// Record a new boot and run startup checks
    Check,
    /// Confirm the safe-mode revert for a boot
    Revert {
        boot_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Keep the current tree and mark the boot healthy
    Skip { boot_id: String },
    /// Show the current boot record and trigger
    Status,
    /// Force the next boot into safe mode
    Trigger { reason: String },
}
