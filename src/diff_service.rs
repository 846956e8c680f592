//! Client for the external diffing service.
//!
//! The pipeline only sees the [`DiffService`] trait: given two Versions it
//! returns a [`DiffResult`] or fails. [`HttpDiffService`] speaks the
//! PageFreezer compare API:
//!
//! ```text
//! POST {url}
//! x-api-key: $API_KEY
//! {"source": "text", "url1": <older capture body>, "url2": <newer capture body>}
//!
//! 200 {"status": "ok", "output": {"diffs": [[0, "..."], [-1, "..."], [1, "..."]]}}
//! ```
//!
//! The diffhash is the SHA-256 of the serialized `output.diffs` list, so
//! identical changes hash identically regardless of response envelope
//! fields like timing. The full response body is kept as the payload.
//!
//! # Retry Strategy
//!
//! Every failure is treated as transient: network errors, timeouts, non-2xx
//! statuses, a `status` field other than `"ok"`, unparseable bodies, and
//! bodies without `output.diffs`.
//! [`compare_with_retry`] retries with exponential backoff
//! (`base`, `2 × base`, `4 × base`, ... capped at `max`) up to
//! `max_attempts` total calls, then reports [`Error::DiffService`].

use std::time::{Duration, Instant};

use anyhow::bail;
use async_trait::async_trait;
use serde_json::Value;
use web_monitoring_core::models::{sha256_hex, Version};
use web_monitoring_core::{Error, Result};

use crate::config::DiffServiceConfig;

/// Output of one successful comparison.
#[derive(Debug, Clone)]
pub struct DiffResult {
    pub diffhash: String,
    /// Raw response body, stored verbatim in the payload store.
    pub payload: Vec<u8>,
    /// Calls made, including the successful one.
    pub attempts: u32,
    pub elapsed: Duration,
}

#[async_trait]
pub trait DiffService: Send + Sync {
    /// Recorded as the `source_type` of Diffs this service produces.
    fn source_type(&self) -> &str;

    /// Make a single comparison call. Errors are messages; the caller
    /// decides whether to retry.
    async fn compare(&self, from: &Version, to: &Version) -> std::result::Result<DiffResult, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DiffServiceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Sleep before call number `attempt` (1-based). The first call is
    /// immediate.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 2).min(20);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DiffServiceConfig::default())
    }
}

/// Call `service` until it succeeds or `policy.max_attempts` calls have
/// failed.
pub async fn compare_with_retry(
    service: &dyn DiffService,
    policy: &RetryPolicy,
    from: &Version,
    to: &Version,
) -> Result<DiffResult> {
    let mut last_err = String::from("no attempts made");

    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match service.compare(from, to).await {
            Ok(mut result) => {
                result.attempts = attempt;
                return Ok(result);
            }
            Err(message) => {
                tracing::warn!(
                    from = %from.uuid,
                    to = %to.uuid,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %message,
                    "diff service call failed"
                );
                last_err = message;
            }
        }
    }

    Err(Error::DiffService {
        attempts: policy.max_attempts,
        message: last_err,
    })
}

/// PageFreezer-compatible HTTP client.
pub struct HttpDiffService {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    source_type: String,
}

impl HttpDiffService {
    /// Build a client from `[diff_service]`.
    ///
    /// # Errors
    ///
    /// Fails if `api_key_env` names a variable that is not set.
    pub fn from_config(config: &DiffServiceConfig) -> anyhow::Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => match std::env::var(var) {
                Ok(key) => Some(key),
                Err(_) => bail!("{} environment variable not set", var),
            },
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
            api_key,
            source_type: config.source_type.clone(),
        })
    }
}

#[async_trait]
impl DiffService for HttpDiffService {
    fn source_type(&self) -> &str {
        &self.source_type
    }

    async fn compare(&self, from: &Version, to: &Version) -> std::result::Result<DiffResult, String> {
        let started = Instant::now();
        let body = serde_json::json!({
            "source": "text",
            "url1": read_capture_body(from).await?,
            "url2": read_capture_body(to).await?,
        });

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        tracing::debug!(
            from = %from.uuid,
            to = %to.uuid,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "diff service responded"
        );

        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            return Err(format!("diff service error {}: {}", status, text.trim()));
        }

        let diffhash = response_diffhash(&bytes)?;
        Ok(DiffResult {
            diffhash,
            payload: bytes.to_vec(),
            attempts: 1,
            elapsed: started.elapsed(),
        })
    }
}

/// With `source: "text"` the service takes document bodies, not links.
async fn read_capture_body(version: &Version) -> std::result::Result<String, String> {
    tokio::fs::read_to_string(&version.uri)
        .await
        .map_err(|e| format!("cannot read capture {}: {}", version.uri, e))
}

/// Validate a compare response and hash its `output.diffs` list.
pub fn response_diffhash(body: &[u8]) -> std::result::Result<String, String> {
    let json: Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid diff service response: {}", e))?;
    if let Some(status) = json.get("status") {
        if status.as_str() != Some("ok") {
            return Err(format!("diff service reported status {}", status));
        }
    }
    let diffs = json
        .pointer("/output/diffs")
        .filter(|d| d.is_array())
        .ok_or_else(|| "invalid diff service response: missing output.diffs".to_string())?;
    let canonical = serde_json::to_vec(diffs).map_err(|e| e.to_string())?;
    Ok(sha256_hex(&canonical))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay(1), Duration::ZERO);
        assert_eq!(policy.delay(2), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(400));
        assert_eq!(policy.delay(5), Duration::from_millis(500));
        assert_eq!(policy.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn diffhash_ignores_envelope_fields() {
        let a = br#"{"status":"ok","time":1.2,"output":{"diffs":[[0,"x"],[1,"y"]]}}"#;
        let b = br#"{"status":"ok","time":9.9,"output":{"diffs":[[0,"x"],[1,"y"]]}}"#;
        assert_eq!(response_diffhash(a).unwrap(), response_diffhash(b).unwrap());
        let c = br#"{"output":{"diffs":[[0,"x"]]}}"#;
        assert_ne!(response_diffhash(a).unwrap(), response_diffhash(c).unwrap());
    }

    #[test]
    fn diffhash_rejects_malformed_bodies() {
        assert!(response_diffhash(b"not json").is_err());
        assert!(response_diffhash(br#"{"output":{}}"#).is_err());
        assert!(response_diffhash(br#"{"output":{"diffs":"nope"}}"#).is_err());
    }

    #[test]
    fn diffhash_rejects_non_ok_status() {
        let err = response_diffhash(br#"{"status":"error","output":{"diffs":[]}}"#).unwrap_err();
        assert!(err.contains("\"error\""), "error: {}", err);
        assert!(response_diffhash(br#"{"status":null,"output":{"diffs":[]}}"#).is_err());
    }
}
