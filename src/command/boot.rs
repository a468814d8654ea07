use anyhow::Result;
use serde_json::json;

use stella_selfmod::Runtime;

use super::print_json;
use crate::cli::BootCommand;

pub async fn run_boot(runtime: &Runtime, command: BootCommand) -> Result<()> {
    let safe_mode = &runtime.safe_mode;

    match command {
        BootCommand::Check => {
            let report = safe_mode.run_startup_checks().await?;
            if report.needs_revert {
                eprintln!(
                    "Boot needs attention. Run `boot revert {}` or `boot skip {}`.",
                    report.boot_id, report.boot_id
                );
            }
            print_json(&report)
        }
        BootCommand::Revert { boot_id, reason } => {
            print_json(&safe_mode.perform_revert(&boot_id, reason.as_deref()).await?)
        }
        BootCommand::Skip { boot_id } => print_json(&safe_mode.skip_revert(&boot_id).await?),
        BootCommand::Status => print_json(&json!({
            "boot": safe_mode.boot_status().await,
            "trigger": safe_mode.trigger().await,
        })),
        BootCommand::Trigger { reason } => print_json(&safe_mode.request_safe_mode(&reason).await?),
    }
}
