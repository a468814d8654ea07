use anyhow::Result;

use stella_selfmod::Runtime;

use super::print_json;
use crate::cli::ChangesetCommand;

pub async fn run_changeset(runtime: &Runtime, command: ChangesetCommand) -> Result<()> {
    let changesets = &runtime.changesets;

    match command {
        ChangesetCommand::Start { scope, zones } => {
            let zones = (!zones.is_empty()).then_some(zones);
            print_json(&changesets.start_changeset(scope, zones).await?)
        }
        ChangesetCommand::Finish { id, promote } => {
            print_json(&changesets.finish_changeset(&id, promote).await?)
        }
        ChangesetCommand::Rollback { id } => print_json(&changesets.rollback_changeset(&id).await?),
        ChangesetCommand::Active => print_json(&changesets.active_changeset().await),
    }
}
