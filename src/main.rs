use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

mod cli;
mod command;

use cli::{Cli, Commands};
use stella_selfmod::{Runtime, SelfModConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for JSON results
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let frontend_root = cli::resolve_frontend_root(cli.frontend_root)?;
    let config = SelfModConfig::resolve(
        frontend_root,
        cli::optional_dir(cli.state_root),
        cli::optional_dir(cli.mods_root),
    )
    .context("Failed to load configuration")?;
    let runtime = Runtime::from_config(config)?;

    match cli.command {
        Commands::Stage {
            feature,
            path,
            content,
            from,
        } => command::run_stage(&runtime, &feature, &path, content, from).await,
        Commands::Staged { feature } => command::run_staged(&runtime, &feature).await,
        Commands::Discard { feature } => command::run_discard(&runtime, &feature).await,
        Commands::Feature { command: sub } => command::run_feature(&runtime, sub).await,
        Commands::Apply { feature, message } => {
            command::run_apply(&runtime, &feature, message.as_deref()).await
        }
        Commands::History { feature } => command::run_history(&runtime, &feature).await,
        Commands::Snapshots { feature } => command::run_snapshots(&runtime, &feature).await,
        Commands::Revert { feature, batch } => command::run_revert(&runtime, &feature, batch).await,
        Commands::Snapshot { command: sub } => command::run_snapshot(&runtime, sub).await,
        Commands::Baseline { command: sub } => command::run_baseline(&runtime, sub).await,
        Commands::Changeset { command: sub } => command::run_changeset(&runtime, sub).await,
        Commands::Boot { command: sub } => command::run_boot(&runtime, sub).await,
        Commands::Package { feature } => command::run_package(&runtime, &feature).await,
    }
}
