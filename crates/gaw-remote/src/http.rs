//! Single-operation HTTP client with typed retry.
//!
//! The remote API is consumed through exactly one shape: POST a JSON body
//! with a bearer token, get a JSON array back. Everything else is an error,
//! and the error class decides who handles it: `FatalAuth` aborts the run,
//! `Retryable` is retried here until the budget is spent, `BadShape` and
//! `NonRetryable` surface to the calling stage.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::clock::JitterSource;

/// Classified failure of a remote call.
#[derive(Debug)]
pub enum RemoteError {
    /// 401 or 403. Aborts the entire run; never retried.
    FatalAuth { status: u16 },
    /// 429, 5xx, network error, or per-attempt timeout. Retried until the
    /// attempt budget is exhausted, then surfaced as-is.
    Retryable { detail: String },
    /// Any other non-2xx status. Not retried.
    NonRetryable { status: u16, detail: String },
    /// 2xx whose body is not a JSON array. Not retried.
    BadShape { detail: String },
}

impl RemoteError {
    pub fn is_fatal_auth(&self) -> bool {
        matches!(self, RemoteError::FatalAuth { .. })
    }

    fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Retryable { .. })
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::FatalAuth { status } => {
                write!(f, "authentication rejected (status {status})")
            }
            RemoteError::Retryable { detail } => write!(f, "transient remote failure: {detail}"),
            RemoteError::NonRetryable { status, detail } => {
                write!(f, "remote error status {status}: {detail}")
            }
            RemoteError::BadShape { detail } => write!(f, "malformed remote response: {detail}"),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Retry schedule: 5 attempts total, exponential delay doubling from 1s and
/// capped at 8s, plus up to 300ms of uniform jitter, 30s per attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_cap_ms: u64,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
            jitter_cap_ms: 300,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `n` (1-indexed; only meaningful for n >= 2).
    pub fn delay_before(&self, attempt: u32, jitter: &dyn JitterSource) -> Duration {
        let exponent = attempt.saturating_sub(2).min(31);
        let backoff = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(backoff + jitter.jitter_ms(self.jitter_cap_ms))
    }
}

/// Bearer-authenticated JSON POST client shared by all stages.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    policy: RetryPolicy,
    jitter: Arc<dyn JitterSource>,
}

impl ApiClient {
    pub fn new(policy: RetryPolicy, jitter: Arc<dyn JitterSource>) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(policy.attempt_timeout)
            .build()
            .map_err(|e| RemoteError::Retryable {
                detail: format!("client build failed: {e}"),
            })?;
        Ok(Self {
            http,
            policy,
            jitter,
        })
    }

    /// POST `body` to `url` and return the parsed top-level array.
    ///
    /// The retry budget is shared across mixed transient classes: a timeout
    /// followed by a 503 followed by a 429 still consumes one budget.
    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
        bearer: &str,
    ) -> Result<Vec<Value>, RemoteError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt_post(url, body, bearer).await {
                Ok(rows) => return Ok(rows),
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_before(attempt + 1, self.jitter.as_ref());
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt_post(
        &self,
        url: &str,
        body: &Value,
        bearer: &str,
    ) -> Result<Vec<Value>, RemoteError> {
        let resp = self
            .http
            .post(url)
            .bearer_auth(bearer)
            .json(body)
            .send()
            .await
            .map_err(|e| RemoteError::Retryable {
                detail: if e.is_timeout() {
                    format!("attempt timed out after {:?}", self.policy.attempt_timeout)
                } else {
                    format!("request failed: {e}")
                },
            })?;

        let status = resp.status();
        match status.as_u16() {
            401 | 403 => return Err(RemoteError::FatalAuth {
                status: status.as_u16(),
            }),
            429 | 500..=599 => {
                return Err(RemoteError::Retryable {
                    detail: format!("status {status}"),
                })
            }
            s if !status.is_success() => {
                let detail = snippet(&resp.text().await.unwrap_or_default());
                return Err(RemoteError::NonRetryable { status: s, detail });
            }
            _ => {}
        }

        let text = resp.text().await.map_err(|e| RemoteError::Retryable {
            detail: format!("body read failed: {e}"),
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|_| RemoteError::BadShape {
            detail: format!("2xx body is not JSON: {}", snippet(&text)),
        })?;
        match value {
            Value::Array(rows) => Ok(rows),
            other => Err(RemoteError::BadShape {
                detail: format!("expected a JSON array, got {}", kind_of(&other)),
            }),
        }
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn snippet(s: &str) -> String {
    let trimmed = s.trim();
    match trimmed.char_indices().nth(200) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedJitter;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let jitter = FixedJitter(42);
        assert_eq!(policy.delay_before(2, &jitter), Duration::from_millis(1_042));
        assert_eq!(policy.delay_before(3, &jitter), Duration::from_millis(2_042));
        assert_eq!(policy.delay_before(4, &jitter), Duration::from_millis(4_042));
        assert_eq!(policy.delay_before(5, &jitter), Duration::from_millis(8_042));
        // Past the cap the schedule flattens.
        assert_eq!(policy.delay_before(6, &jitter), Duration::from_millis(8_042));
    }

    #[test]
    fn jitter_is_bounded_by_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_before(2, &FixedJitter(10_000)),
            Duration::from_millis(1_300)
        );
    }
}
