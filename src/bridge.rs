//! Status bridge to the backend.
//!
//! Boot status and safe-mode outcomes are reported as backend mutations.
//! Reporting is best effort: every failure is logged and swallowed, and
//! callers bound each call with their own timeout.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

/// Mutation reporting the outcome of a startup check.
pub const BOOT_STATUS_MUTATION: &str = "selfMod:bootStatus";
/// Mutation reporting a safe-mode revert or skip.
pub const SAFE_MODE_REVERT_MUTATION: &str = "selfMod:safeModeRevert";

const RETRY_BASE_DELAY_MS: u64 = 250;
const MAX_RETRIES: usize = 2;
const RETRY_JITTER_DIVISOR: u128 = 4; // + up to 25% jitter

/// Reports status to the backend.
#[async_trait]
pub trait StatusBridge: Send + Sync {
    /// Invoke mutation `name` with `args`. `None` when the call failed or
    /// there is nothing to call.
    async fn call_mutation(&self, name: &str, args: Value) -> Option<Value>;
}

/// Bridge used when no backend is configured.
pub struct NoopStatusBridge;

#[async_trait]
impl StatusBridge for NoopStatusBridge {
    async fn call_mutation(&self, name: &str, _args: Value) -> Option<Value> {
        debug!("No status bridge configured, dropping {}", name);
        None
    }
}

/// POSTs `{path, args, format}` to `{base}/api/mutation`.
pub struct HttpStatusBridge {
    client: reqwest::Client,
    endpoint: Url,
    token: Option<String>,
}

impl HttpStatusBridge {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("invalid bridge URL: {}", base_url))?;
        let endpoint = base
            .join("api/mutation")
            .with_context(|| format!("invalid bridge URL: {}", base_url))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn post(&self, name: &str, args: &Value) -> Result<Value> {
        let body = json!({
            "path": name,
            "args": args,
            "format": "json",
        });
        let response = send_with_retry(|| {
            let request = self.client.post(self.endpoint.clone()).json(&body);
            match &self.token {
                Some(token) => request.bearer_auth(token),
                None => request,
            }
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("mutation {} failed with status {}: {}", name, status, text);
        }

        let value: Value = response
            .json()
            .await
            .with_context(|| format!("mutation {} returned invalid JSON", name))?;
        Ok(unwrap_mutation_value(value))
    }
}

#[async_trait]
impl StatusBridge for HttpStatusBridge {
    async fn call_mutation(&self, name: &str, args: Value) -> Option<Value> {
        match self.post(name, &args).await {
            Ok(value) => {
                debug!("Mutation {} succeeded", name);
                Some(value)
            }
            Err(e) => {
                warn!("Status bridge call {} failed: {:#}", name, e);
                None
            }
        }
    }
}

/// Backend responses wrap the result as `{"status": "success", "value": ..}`.
fn unwrap_mutation_value(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.get("status").and_then(Value::as_str) == Some("success") => {
            map.remove("value").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn is_retriable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retriable_send_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_body()
}

fn retry_base_delay(attempt: usize) -> Duration {
    let multiplier = 1u64.checked_shl(attempt as u32).unwrap_or(u64::MAX);
    Duration::from_millis(RETRY_BASE_DELAY_MS.saturating_mul(multiplier))
}

fn add_jitter(delay: Duration) -> Duration {
    let max_jitter_ms = delay.as_millis() / RETRY_JITTER_DIVISOR;
    if max_jitter_ms == 0 {
        return delay;
    }

    let max_jitter_ms = std::cmp::min(max_jitter_ms, u128::from(u64::MAX)) as u64;
    let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter_ms);
    delay + Duration::from_millis(jitter_ms)
}

async fn send_with_retry(
    mut make_request: impl FnMut() -> reqwest::RequestBuilder,
) -> Result<reqwest::Response> {
    let max_attempts = MAX_RETRIES + 1;
    let mut attempt = 0;

    loop {
        let retry_in = match make_request().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || !is_retriable_status(status) || attempt >= MAX_RETRIES {
                    return Ok(response);
                }
                let _ = response.bytes().await;
                debug!("Bridge request failed with status {}", status);
                add_jitter(retry_base_delay(attempt))
            }
            Err(err) => {
                if !is_retriable_send_error(&err) || attempt >= MAX_RETRIES {
                    return Err(anyhow::Error::new(err)).with_context(|| {
                        format!("bridge request failed after {} attempt(s)", attempt + 1)
                    });
                }
                debug!("Bridge request error: {}", err);
                add_jitter(retry_base_delay(attempt))
            }
        };

        debug!(
            "Retrying bridge request in {:?} (attempt {}/{})",
            retry_in,
            attempt + 1,
            max_attempts
        );
        sleep(retry_in).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_join() {
        let bridge =
            HttpStatusBridge::new("https://example.convex.cloud/", None, Duration::from_secs(1))
                .unwrap();
        assert_eq!(
            bridge.endpoint().as_str(),
            "https://example.convex.cloud/api/mutation"
        );
        assert!(HttpStatusBridge::new("not a url", None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_unwrap_mutation_value() {
        assert_eq!(
            unwrap_mutation_value(json!({"status": "success", "value": {"ok": true}})),
            json!({"ok": true})
        );
        assert_eq!(unwrap_mutation_value(json!({"ok": 1})), json!({"ok": 1}));
    }

    #[test]
    fn test_retry_delay_with_jitter() {
        assert_eq!(retry_base_delay(0), Duration::from_millis(250));
        assert_eq!(retry_base_delay(2), Duration::from_millis(1000));
        let delay = add_jitter(Duration::from_millis(1000));
        assert!(delay >= Duration::from_millis(1000) && delay <= Duration::from_millis(1250));
    }

    #[tokio::test]
    async fn test_unreachable_bridge_returns_none() {
        // nothing listens on the discard port
        let bridge =
            HttpStatusBridge::new("http://127.0.0.1:9/", None, Duration::from_secs(2)).unwrap();
        assert!(bridge
            .call_mutation(BOOT_STATUS_MUTATION, json!({"status": "healthy"}))
            .await
            .is_none());
    }
}
