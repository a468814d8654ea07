//! Boot-time health checks and confirm-before-revert recovery.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::boot::{BootState, BootStatus, BootStore, SafeModeTrigger};
use super::packs::PackManager;
use super::smoke::{SmokeSummary, SmokeValidator};
use crate::baseline::BaselineManager;
use crate::bridge::{StatusBridge, BOOT_STATUS_MUTATION, SAFE_MODE_REVERT_MUTATION};
use crate::error::{Result, SelfModError};

const DEFAULT_SMOKE_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_BRIDGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct SafeModeOptions {
    /// Cap on one run of the whole smoke battery.
    pub smoke_timeout: Duration,
    /// Cap on one status bridge call.
    pub bridge_timeout: Duration,
}

impl Default for SafeModeOptions {
    fn default() -> Self {
        Self {
            smoke_timeout: DEFAULT_SMOKE_TIMEOUT,
            bridge_timeout: DEFAULT_BRIDGE_TIMEOUT,
        }
    }
}

/// Why a boot needs attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StartupTrigger {
    #[serde(rename_all = "camelCase")]
    ExplicitRequest {
        reason: String,
        created_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    PreviousBootUnhealthy {
        boot_id: String,
        status: BootState,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure_reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SmokeFailed { failures: Vec<String> },
}

impl StartupTrigger {
    pub fn describe(&self) -> String {
        match self {
            StartupTrigger::ExplicitRequest { reason, .. } => {
                format!("safe mode requested: {}", reason)
            }
            StartupTrigger::PreviousBootUnhealthy {
                boot_id,
                status,
                failure_reason,
            } => match failure_reason {
                Some(why) => format!("previous boot {} ended {}: {}", boot_id, status, why),
                None => format!("previous boot {} ended {}", boot_id, status),
            },
            StartupTrigger::SmokeFailed { failures } => {
                format!("smoke checks failed: {}", failures.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupReport {
    pub boot_id: String,
    pub needs_revert: bool,
    pub smoke_passed: bool,
    pub triggers: Vec<StartupTrigger>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_id: Option<String>,
    pub smoke: SmokeSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertReport {
    pub boot_id: String,
    pub baseline_id: String,
    pub restored_count: usize,
    pub smoke_passed: bool,
    pub status: BootState,
    pub smoke: SmokeSummary,
}

pub struct SafeModeController {
    boot: BootStore,
    baseline: Arc<BaselineManager>,
    smoke: Arc<dyn SmokeValidator>,
    packs: Arc<dyn PackManager>,
    bridge: Arc<dyn StatusBridge>,
    options: SafeModeOptions,
    current_boot: Mutex<Option<String>>,
}

impl SafeModeController {
    pub fn new(
        boot: BootStore,
        baseline: Arc<BaselineManager>,
        smoke: Arc<dyn SmokeValidator>,
        packs: Arc<dyn PackManager>,
        bridge: Arc<dyn StatusBridge>,
        options: SafeModeOptions,
    ) -> Self {
        Self {
            boot,
            baseline,
            smoke,
            packs,
            bridge,
            options,
            current_boot: Mutex::new(None),
        }
    }

    fn project_root(&self) -> &Path {
        self.baseline.zones().project_root()
    }

    pub async fn boot_status(&self) -> Option<BootStatus> {
        self.boot.read_boot().await
    }

    pub async fn trigger(&self) -> Option<SafeModeTrigger> {
        self.boot.read_trigger().await
    }

    /// Force the next boot to be treated as unhealthy.
    pub async fn request_safe_mode(&self, reason: &str) -> Result<SafeModeTrigger> {
        self.boot.write_trigger(reason).await
    }

    // ========== Startup ==========

    /// Record a new boot, run smoke validations and decide whether a revert
    /// is needed. Never reverts by itself: a report with `needs_revert` waits
    /// for [`perform_revert`](Self::perform_revert) or
    /// [`skip_revert`](Self::skip_revert).
    pub async fn run_startup_checks(&self) -> Result<StartupReport> {
        for dir in self.boot.dirs() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| SelfModError::io(dir, e))?;
        }

        let baseline_id = match self.baseline.ensure_baseline().await {
            Ok(meta) => Some(meta.baseline_id),
            Err(e) => {
                warn!("Could not ensure a baseline: {}", e);
                None
            }
        };

        let last_boot = self.boot.read_boot().await;
        let trigger = self.boot.read_trigger().await;

        let boot_id = Uuid::new_v4().to_string();
        self.boot
            .start_boot(&BootStatus::starting(boot_id.clone()))
            .await?;
        *self.current_boot.lock().await = Some(boot_id.clone());

        let smoke = self.run_smoke().await;

        let mut triggers = Vec::new();
        if let Some(trigger) = trigger {
            triggers.push(StartupTrigger::ExplicitRequest {
                reason: trigger.reason,
                created_at: trigger.created_at,
            });
        }
        if let Some(last) = last_boot.filter(|b| b.status != BootState::Healthy) {
            triggers.push(StartupTrigger::PreviousBootUnhealthy {
                boot_id: last.boot_id,
                status: last.status,
                failure_reason: last.failure_reason,
            });
        }
        if !smoke.ok {
            triggers.push(StartupTrigger::SmokeFailed {
                failures: smoke
                    .required_failures
                    .iter()
                    .map(|f| f.name.clone())
                    .collect(),
            });
        }

        if triggers.is_empty() {
            self.boot
                .update_boot(&boot_id, |s| {
                    s.status = BootState::Healthy;
                    s.healthy_at = Some(Utc::now());
                })
                .await?;
            self.publish(
                BOOT_STATUS_MUTATION,
                json!({
                    "bootId": boot_id,
                    "status": BootState::Healthy,
                    "needsRevert": false,
                    "smokePassed": true,
                }),
            )
            .await;
            return Ok(StartupReport {
                boot_id,
                needs_revert: false,
                smoke_passed: true,
                triggers,
                reason: None,
                baseline_id,
                smoke,
            });
        }

        let reason = triggers
            .iter()
            .map(StartupTrigger::describe)
            .collect::<Vec<_>>()
            .join("; ");
        warn!("Boot {} needs revert: {}", boot_id, reason);

        self.publish(
            BOOT_STATUS_MUTATION,
            json!({
                "bootId": boot_id,
                "status": BootState::Starting,
                "needsRevert": true,
                "smokePassed": smoke.ok,
                "reason": reason,
                "triggers": triggers,
            }),
        )
        .await;

        Ok(StartupReport {
            boot_id,
            needs_revert: true,
            smoke_passed: smoke.ok,
            triggers,
            reason: Some(reason),
            baseline_id,
            smoke,
        })
    }

    // ========== Decisions ==========

    /// Roll back to the last-known-good baseline, disable installed packs and
    /// re-run smoke validations. The boot ends `healthy` (trigger cleared) if
    /// they pass, `failed` (trigger kept) otherwise.
    pub async fn perform_revert(&self, boot_id: &str, reason: Option<&str>) -> Result<RevertReport> {
        self.check_boot(boot_id).await?;

        let reason = match reason {
            Some(r) => r.to_string(),
            None => match self.boot.read_trigger().await {
                Some(t) => t.reason,
                None => "safe mode revert".to_string(),
            },
        };

        let rollback = match self.baseline.rollback_to_last_known_good(&reason).await {
            Ok(rollback) => rollback,
            Err(e) => {
                error!("Safe-mode rollback failed: {}", e);
                let why = format!("rollback failed: {}", e);
                self.boot
                    .update_boot(boot_id, |s| {
                        s.status = BootState::Failed;
                        s.failure_reason = Some(why.clone());
                    })
                    .await?;
                self.publish(
                    SAFE_MODE_REVERT_MUTATION,
                    json!({
                        "bootId": boot_id,
                        "status": BootState::Failed,
                        "reason": reason,
                        "error": why,
                    }),
                )
                .await;
                return Err(e);
            }
        };

        if let Err(e) = self.packs.disable_all_for_safe_mode(&reason).await {
            warn!("Failed to disable packs for safe mode: {}", e);
        }

        let smoke = self.run_smoke().await;
        let updated = if smoke.ok {
            self.boot
                .update_boot(boot_id, |s| {
                    s.status = BootState::Healthy;
                    s.healthy_at = Some(Utc::now());
                    s.failure_reason = None;
                    s.safe_mode_applied = true;
                })
                .await?
        } else {
            let why = format!(
                "smoke checks still failing after revert: {}",
                smoke.failure_names()
            );
            error!("Boot {}: {}", boot_id, why);
            self.boot
                .update_boot(boot_id, |s| {
                    s.status = BootState::Failed;
                    s.failure_reason = Some(why);
                    s.safe_mode_applied = true;
                })
                .await?
        };
        // another boot took over the record while the revert ran
        let Some(updated) = updated else {
            return Err(self.stale(boot_id).await);
        };
        let status = updated.status;
        if status == BootState::Healthy {
            self.boot.clear_trigger().await?;
        }

        info!(
            "Safe-mode revert to baseline {} restored {} paths, boot {}",
            rollback.baseline_id, rollback.restored_count, status
        );
        self.publish(
            SAFE_MODE_REVERT_MUTATION,
            json!({
                "bootId": boot_id,
                "baselineId": rollback.baseline_id,
                "restoredCount": rollback.restored_count,
                "smokePassed": smoke.ok,
                "status": status,
                "reason": reason,
            }),
        )
        .await;

        Ok(RevertReport {
            boot_id: boot_id.to_string(),
            baseline_id: rollback.baseline_id,
            restored_count: rollback.restored_count,
            smoke_passed: smoke.ok,
            status,
            smoke,
        })
    }

    /// Keep the current tree: clear the trigger and mark the boot healthy.
    pub async fn skip_revert(&self, boot_id: &str) -> Result<BootStatus> {
        self.check_boot(boot_id).await?;
        self.boot.clear_trigger().await?;

        let status = self
            .boot
            .update_boot(boot_id, |s| {
                s.status = BootState::Healthy;
                s.healthy_at = Some(Utc::now());
                s.failure_reason = None;
            })
            .await?;
        let Some(status) = status else {
            return Err(self.stale(boot_id).await);
        };

        info!("Boot {}: revert skipped", boot_id);
        self.publish(
            SAFE_MODE_REVERT_MUTATION,
            json!({
                "bootId": boot_id,
                "status": BootState::Healthy,
                "skipped": true,
            }),
        )
        .await;
        Ok(status)
    }

    // ========== Helpers ==========

    async fn check_boot(&self, boot_id: &str) -> Result<()> {
        if let Some(current) = self.current_boot.lock().await.as_deref() {
            if current != boot_id {
                return Err(SelfModError::StaleBoot {
                    requested: boot_id.to_string(),
                    current: current.to_string(),
                });
            }
        }
        match self.boot.read_boot().await {
            Some(status) if status.boot_id == boot_id => Ok(()),
            _ => Err(self.stale(boot_id).await),
        }
    }

    async fn stale(&self, boot_id: &str) -> SelfModError {
        SelfModError::StaleBoot {
            requested: boot_id.to_string(),
            current: self
                .boot
                .read_boot()
                .await
                .map(|s| s.boot_id)
                .unwrap_or_else(|| "none".to_string()),
        }
    }

    async fn run_smoke(&self) -> SmokeSummary {
        let timeout = self.options.smoke_timeout;
        match tokio::time::timeout(timeout, self.smoke.run(self.project_root())).await {
            Ok(results) => SmokeSummary::from_results(results),
            Err(_) => {
                warn!("Smoke validations timed out after {:?}", timeout);
                SmokeSummary::timed_out(timeout)
            }
        }
    }

    async fn publish(&self, name: &str, args: Value) {
        let call = self.bridge.call_mutation(name, args);
        if tokio::time::timeout(self.options.bridge_timeout, call)
            .await
            .is_err()
        {
            warn!("Status bridge call {} timed out", name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NoopStatusBridge;
    use crate::safe_mode::{NoopPackManager, SmokeCheckResult};
    use crate::store::StateLocks;
    use crate::zones::ZoneManager;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct SlowSmoke;

    #[async_trait]
    impl SmokeValidator for SlowSmoke {
        async fn run(&self, _root: &Path) -> Vec<SmokeCheckResult> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            vec![SmokeCheckResult::pass("late", true)]
        }
    }

    fn controller(tmp: &TempDir, smoke: Arc<dyn SmokeValidator>) -> SafeModeController {
        let root = tmp.path().join("app");
        std::fs::create_dir_all(&root).unwrap();
        let locks = StateLocks::new();
        let state = tmp.path().join("state");
        let zones = Arc::new(ZoneManager::single_frontend(root));
        let packs: Arc<dyn PackManager> = Arc::new(NoopPackManager);
        let baseline = Arc::new(BaselineManager::new(
            &state,
            zones,
            packs.clone(),
            locks.clone(),
        ));
        SafeModeController::new(
            BootStore::new(&state, locks),
            baseline,
            smoke,
            packs,
            Arc::new(NoopStatusBridge),
            SafeModeOptions {
                smoke_timeout: Duration::from_millis(50),
                bridge_timeout: Duration::from_millis(50),
            },
        )
    }

    #[tokio::test]
    async fn test_smoke_timeout_is_a_failure() {
        let tmp = TempDir::new().unwrap();
        let controller = controller(&tmp, Arc::new(SlowSmoke));

        let report = controller.run_startup_checks().await.unwrap();
        assert!(report.needs_revert);
        assert!(!report.smoke_passed);
        assert_eq!(
            report.triggers,
            vec![StartupTrigger::SmokeFailed {
                failures: vec!["smoke-timeout".to_string()]
            }]
        );
    }

    #[tokio::test]
    async fn test_stale_boot_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let controller = controller(&tmp, Arc::new(SlowSmoke));
        let report = controller.run_startup_checks().await.unwrap();

        let err = controller.skip_revert("someone-else").await.unwrap_err();
        match err {
            SelfModError::StaleBoot { requested, current } => {
                assert_eq!(requested, "someone-else");
                assert_eq!(current, report.boot_id);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Starts a different boot while the post-revert smoke battery runs.
    struct TakeoverSmoke {
        boot: BootStore,
    }

    #[async_trait]
    impl SmokeValidator for TakeoverSmoke {
        async fn run(&self, _root: &Path) -> Vec<SmokeCheckResult> {
            self.boot
                .start_boot(&BootStatus::starting("newer-boot".to_string()))
                .await
                .unwrap();
            vec![SmokeCheckResult::pass("ok", true)]
        }
    }

    #[tokio::test]
    async fn test_revert_rejects_boot_taken_over_midway() {
        let tmp = TempDir::new().unwrap();
        let state = tmp.path().join("state");
        let smoke = Arc::new(TakeoverSmoke {
            boot: BootStore::new(&state, StateLocks::new()),
        });
        let controller = controller(&tmp, smoke);
        controller.baseline.ensure_baseline().await.unwrap();
        controller
            .boot
            .start_boot(&BootStatus::starting("old-boot".to_string()))
            .await
            .unwrap();
        controller.boot.write_trigger("manual").await.unwrap();

        let err = controller.perform_revert("old-boot", None).await.unwrap_err();
        match err {
            SelfModError::StaleBoot { requested, current } => {
                assert_eq!(requested, "old-boot");
                assert_eq!(current, "newer-boot");
            }
            other => panic!("unexpected error: {other}"),
        }

        let record = controller.boot.read_boot().await.unwrap();
        assert_eq!(record.boot_id, "newer-boot");
        assert_eq!(record.status, BootState::Starting);
        // the newer boot still sees the pending trigger
        assert!(controller.boot.read_trigger().await.is_some());
    }

    #[test]
    fn test_trigger_serialization() {
        let trigger = StartupTrigger::SmokeFailed {
            failures: vec!["build".into()],
        };
        assert_eq!(
            serde_json::to_value(&trigger).unwrap(),
            json!({"kind": "smokeFailed", "failures": ["build"]})
        );
        assert_eq!(trigger.describe(), "smoke checks failed: build");
    }
}
