use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::io::AsyncReadExt;

use stella_selfmod::Runtime;

use super::print_json;

pub async fn run_stage(
    runtime: &Runtime,
    feature: &str,
    path: &str,
    content: Option<String>,
    from: Option<PathBuf>,
) -> Result<()> {
    let bytes = match (content, from) {
        (Some(content), _) => content.into_bytes(),
        (None, Some(from)) => tokio::fs::read(&from)
            .await
            .with_context(|| format!("Failed to read {}", from.display()))?,
        (None, None) => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("Failed to read content from stdin")?;
            buf
        }
    };

    let staged = runtime.selfmod.stage_file(feature, path, &bytes).await?;
    print_json(&json!({
        "featureId": feature,
        "path": staged,
        "bytes": bytes.len(),
    }))
}

pub async fn run_staged(runtime: &Runtime, feature: &str) -> Result<()> {
    let mut files = runtime.selfmod.list_staged_files(feature).await?;
    files.sort();
    print_json(&files)
}

pub async fn run_discard(runtime: &Runtime, feature: &str) -> Result<()> {
    runtime.selfmod.clear_staging(feature).await?;
    print_json(&json!({ "featureId": feature, "discarded": true }))
}
