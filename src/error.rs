//! Error taxonomy for upstream calls (LLM, TTS, dialog-log)
//!
//! Transient failures (connect errors, timeouts, 5xx) get one retry with
//! exponential backoff; client errors (4xx) never do. Protocol violations are
//! not errors in this sense; they are logged and the offending message is
//! discarded without touching the connection.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Failure of an upstream HTTP dependency.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Connect failure, timeout, or 5xx: worth one retry.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// 4xx: the request itself is wrong, never retried.
    #[error("upstream rejected request ({status}): {body}")]
    Client { status: u16, body: String },

    /// Anything else (decode failures, mid-stream aborts).
    #[error("upstream error: {0}")]
    Other(String),
}

impl UpstreamError {
    /// Classify a reqwest error.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            return Self::Transient(err.to_string());
        }
        Self::Other(err.to_string())
    }

    /// Classify a non-success HTTP status with its body.
    pub fn from_status(status: u16, body: String) -> Self {
        if status >= 500 {
            Self::Transient(format!("HTTP {status}: {body}"))
        } else {
            Self::Client { status, body }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Retry an async operation on transient failures.
///
/// `retries` extra attempts, backoff doubling from `backoff` (200 ms → 400 ms
/// with the defaults used across the crate).
pub async fn call_with_retry<T, F, Fut>(mut f: F, retries: u32, backoff: Duration) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut delay = backoff;
    for attempt in 0..=retries {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < retries => {
                warn!("retry: attempt {} failed: {}, waiting {:?}", attempt + 1, e, delay);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("retry loop always returns")
}
