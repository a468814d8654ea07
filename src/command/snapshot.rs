use std::path::Path;

use anyhow::{anyhow, Result};
use serde_json::json;

use stella_selfmod::snapshot::{
    diff_snapshots, load_snapshot, save_snapshot, RestoreOptions, Snapshot, SnapshotOptions,
};
use stella_selfmod::Runtime;

use super::print_json;
use crate::cli::SnapshotCommand;

fn non_empty(values: Vec<String>) -> Option<Vec<String>> {
    (!values.is_empty()).then_some(values)
}

async fn load(path: &Path) -> Result<Snapshot> {
    load_snapshot(path)
        .await
        .ok_or_else(|| anyhow!("Not a readable snapshot: {}", path.display()))
}

pub async fn run_snapshot(runtime: &Runtime, command: SnapshotCommand) -> Result<()> {
    let selfmod = &runtime.selfmod;

    match command {
        SnapshotCommand::Take {
            out,
            zones,
            kinds,
            subset,
        } => {
            let snapshot = selfmod
                .take_snapshot(&SnapshotOptions {
                    zone_kinds: non_empty(kinds),
                    zone_names: non_empty(zones),
                    subset_paths: non_empty(subset),
                })
                .await?;
            save_snapshot(&out, &snapshot).await?;
            print_json(&json!({
                "id": snapshot.id,
                "createdAt": snapshot.created_at,
                "zoneRoots": snapshot.zone_roots,
                "fileCount": snapshot.file_count(),
                "totalBytes": snapshot.total_bytes(),
                "path": out,
            }))
        }
        SnapshotCommand::Diff { before, after } => {
            let before = load(&before).await?;
            let after = match after {
                Some(path) => load(&path).await?,
                None => {
                    selfmod
                        .take_snapshot(&SnapshotOptions {
                            zone_kinds: None,
                            zone_names: Some(before.zone_roots.keys().cloned().collect()),
                            subset_paths: before.subset.clone(),
                        })
                        .await?
                }
            };
            print_json(&diff_snapshots(&before, &after))
        }
        SnapshotCommand::Restore {
            snapshot,
            zones,
            subset,
        } => {
            let target = load(&snapshot).await?;
            let result = selfmod
                .restore_zone_snapshot(
                    &target,
                    &RestoreOptions {
                        zone_names: non_empty(zones),
                        subset_paths: non_empty(subset),
                    },
                )
                .await?;
            print_json(&result)
        }
    }
}
