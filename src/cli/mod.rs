mod args;
mod paths;

pub use args::{
    BaselineCommand, BootCommand, ChangesetCommand, Cli, Commands, FeatureCommand,
    SnapshotCommand,
};
pub use paths::{optional_dir, resolve_frontend_root};
