//! Smoke validation battery run at boot.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::paths::{join_relative, sanitize_relative_path};

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

fn default_true() -> bool {
    true
}

/// One configured check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SmokeCheckSpec {
    /// Project-relative path must exist.
    #[serde(rename_all = "camelCase")]
    PathExists {
        name: String,
        path: String,
        #[serde(default = "default_true")]
        required: bool,
    },
    /// Project-relative file must exist and parse as JSON.
    #[serde(rename_all = "camelCase")]
    JsonParses {
        name: String,
        path: String,
        #[serde(default = "default_true")]
        required: bool,
    },
    /// Command run in the project root must exit successfully.
    #[serde(rename_all = "camelCase")]
    Command {
        name: String,
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_true")]
        required: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
}

impl SmokeCheckSpec {
    pub fn name(&self) -> &str {
        match self {
            SmokeCheckSpec::PathExists { name, .. }
            | SmokeCheckSpec::JsonParses { name, .. }
            | SmokeCheckSpec::Command { name, .. } => name,
        }
    }

    pub fn required(&self) -> bool {
        match self {
            SmokeCheckSpec::PathExists { required, .. }
            | SmokeCheckSpec::JsonParses { required, .. }
            | SmokeCheckSpec::Command { required, .. } => *required,
        }
    }

    /// Battery used when none is configured.
    pub fn default_battery() -> Vec<SmokeCheckSpec> {
        vec![
            SmokeCheckSpec::PathExists {
                name: "package-json-present".to_string(),
                path: "package.json".to_string(),
                required: true,
            },
            SmokeCheckSpec::JsonParses {
                name: "package-json-valid".to_string(),
                path: "package.json".to_string(),
                required: true,
            },
        ]
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmokeCheckResult {
    pub name: String,
    pub passed: bool,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SmokeCheckResult {
    pub fn pass(name: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            passed: true,
            required,
            detail: None,
        }
    }

    pub fn fail(name: impl Into<String>, required: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            required,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmokeFailure {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Summary of a battery run. `ok` is false iff a required check failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmokeSummary {
    pub ok: bool,
    pub results: Vec<SmokeCheckResult>,
    pub required_failures: Vec<SmokeFailure>,
}

impl SmokeSummary {
    pub fn from_results(results: Vec<SmokeCheckResult>) -> Self {
        let required_failures: Vec<SmokeFailure> = results
            .iter()
            .filter(|r| r.required && !r.passed)
            .map(|r| SmokeFailure {
                name: r.name.clone(),
                detail: r.detail.clone(),
            })
            .collect();
        Self {
            ok: required_failures.is_empty(),
            results,
            required_failures,
        }
    }

    /// Summary for a battery that did not finish in time.
    pub fn timed_out(timeout: Duration) -> Self {
        Self::from_results(vec![SmokeCheckResult::fail(
            "smoke-timeout",
            true,
            format!("smoke validations did not finish within {:?}", timeout),
        )])
    }

    /// Names of required failures, comma-separated.
    pub fn failure_names(&self) -> String {
        self.required_failures
            .iter()
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Health checks run against the project root.
#[async_trait]
pub trait SmokeValidator: Send + Sync {
    async fn run(&self, project_root: &Path) -> Vec<SmokeCheckResult>;
}

/// Runs a configured list of [`SmokeCheckSpec`]s in order.
pub struct ConfiguredSmokeValidator {
    checks: Vec<SmokeCheckSpec>,
}

impl ConfiguredSmokeValidator {
    pub fn new(checks: Vec<SmokeCheckSpec>) -> Self {
        Self { checks }
    }

    async fn run_check(&self, check: &SmokeCheckSpec, project_root: &Path) -> SmokeCheckResult {
        let name = check.name();
        let required = check.required();

        match check {
            SmokeCheckSpec::PathExists { path, .. } => {
                let Some(target) = resolve(project_root, path) else {
                    return SmokeCheckResult::fail(name, required, format!("invalid path {}", path));
                };
                if tokio::fs::metadata(&target).await.is_ok() {
                    SmokeCheckResult::pass(name, required)
                } else {
                    SmokeCheckResult::fail(name, required, format!("{} is missing", path))
                }
            }
            SmokeCheckSpec::JsonParses { path, .. } => {
                let Some(target) = resolve(project_root, path) else {
                    return SmokeCheckResult::fail(name, required, format!("invalid path {}", path));
                };
                match tokio::fs::read_to_string(&target).await {
                    Ok(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
                        Ok(_) => SmokeCheckResult::pass(name, required),
                        Err(e) => SmokeCheckResult::fail(
                            name,
                            required,
                            format!("{} is not valid JSON: {}", path, e),
                        ),
                    },
                    Err(e) => {
                        SmokeCheckResult::fail(name, required, format!("cannot read {}: {}", path, e))
                    }
                }
            }
            SmokeCheckSpec::Command {
                program,
                args,
                timeout_secs,
                ..
            } => {
                let timeout =
                    Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS));
                run_command(name, required, program, args, project_root, timeout).await
            }
        }
    }
}

#[async_trait]
impl SmokeValidator for ConfiguredSmokeValidator {
    async fn run(&self, project_root: &Path) -> Vec<SmokeCheckResult> {
        let mut results = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            let result = self.run_check(check, project_root).await;
            debug!(
                "Smoke check {}: {}",
                result.name,
                if result.passed { "pass" } else { "fail" }
            );
            results.push(result);
        }
        results
    }
}

fn resolve(project_root: &Path, path: &str) -> Option<std::path::PathBuf> {
    sanitize_relative_path(path)
        .ok()
        .map(|rel| join_relative(project_root, &rel))
}

async fn run_command(
    name: &str,
    required: bool,
    program: &str,
    args: &[String],
    project_root: &Path,
    timeout: Duration,
) -> SmokeCheckResult {
    let child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(project_root)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) if output.status.success() => SmokeCheckResult::pass(name, required),
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last_line = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            SmokeCheckResult::fail(
                name,
                required,
                format!("{} exited with {}: {}", program, output.status, last_line.trim()),
            )
        }
        Ok(Err(e)) => {
            warn!("Failed to spawn smoke command {}: {}", program, e);
            SmokeCheckResult::fail(name, required, format!("failed to run {}: {}", program, e))
        }
        Err(_) => SmokeCheckResult::fail(
            name,
            required,
            format!("{} timed out after {:?}", program, timeout),
        ),
    }
}
