mod apply;
mod baseline;
mod boot;
mod changeset;
mod feature;
mod snapshot;
mod stage;

use anyhow::Result;
use serde::Serialize;

pub use apply::{run_apply, run_history, run_package, run_revert, run_snapshots};
pub use baseline::run_baseline;
pub use boot::run_boot;
pub use changeset::run_changeset;
pub use feature::run_feature;
pub use snapshot::run_snapshot;
pub use stage::{run_discard, run_stage, run_staged};

/// Results go to stdout as pretty JSON; logs go to stderr.
fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
