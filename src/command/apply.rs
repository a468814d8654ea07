use anyhow::Result;
use serde_json::json;

use stella_selfmod::Runtime;

use super::print_json;

pub async fn run_apply(runtime: &Runtime, feature: &str, message: Option<&str>) -> Result<()> {
    let result = runtime
        .selfmod
        .apply_batch(feature, &runtime.config.frontend_root, message)
        .await?;
    if result.is_noop() {
        eprintln!("Nothing staged for {}", feature);
    }
    print_json(&result)
}

pub async fn run_history(runtime: &Runtime, feature: &str) -> Result<()> {
    print_json(&runtime.selfmod.get_history(feature).await?)
}

pub async fn run_snapshots(runtime: &Runtime, feature: &str) -> Result<()> {
    print_json(&runtime.selfmod.list_snapshots(feature).await?)
}

pub async fn run_revert(runtime: &Runtime, feature: &str, batch: usize) -> Result<()> {
    let restored = runtime
        .selfmod
        .revert_batch(feature, batch, &runtime.config.frontend_root)
        .await?;
    print_json(&json!({
        "featureId": feature,
        "batchIndex": batch,
        "restored": restored,
    }))
}

pub async fn run_package(runtime: &Runtime, feature: &str) -> Result<()> {
    let blueprint = runtime
        .selfmod
        .package_feature(feature, &runtime.config.frontend_root)
        .await?;
    print_json(&blueprint)
}
