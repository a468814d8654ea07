use anyhow::Result;

use stella_selfmod::{BaselineRequest, Runtime};

use super::print_json;
use crate::cli::BaselineCommand;

pub async fn run_baseline(runtime: &Runtime, command: BaselineCommand) -> Result<()> {
    let baseline = &runtime.baseline;

    match command {
        BaselineCommand::Ensure => print_json(&baseline.ensure_baseline().await?),
        BaselineCommand::Create { changeset, scope } => {
            let meta = baseline
                .create_baseline(BaselineRequest {
                    source_changeset_id: changeset,
                    scope,
                })
                .await?;
            print_json(&meta)
        }
        BaselineCommand::Show { history } => {
            if history {
                print_json(&baseline.history().await)
            } else {
                print_json(&baseline.last_known_good().await)
            }
        }
        BaselineCommand::Rollback { reason } => {
            print_json(&baseline.rollback_to_last_known_good(&reason).await?)
        }
    }
}
