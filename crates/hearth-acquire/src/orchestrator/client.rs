//! HTTP client for the art host.
//!
//! Plain reqwest, no browser: the art host is public and only needs to be
//! treated politely. One request per call; retry and pacing decisions belong
//! to the orchestrator.

use crate::error::{classify_status, AcquireError, AcquireResult};
use bytes::Bytes;
use std::time::Duration;

/// Response from a single art request.
#[derive(Debug, Clone)]
pub struct ArtResponse {
    /// HTTP status code.
    pub status: u16,
    /// Parsed `Retry-After`, capped to the configured maximum.
    pub retry_after: Option<Duration>,
    /// Response body.
    pub body: Bytes,
}

impl ArtResponse {
    /// Turn a non-2xx response into its taxonomy error.
    pub fn into_result(self) -> AcquireResult<Bytes> {
        match classify_status(self.status, self.retry_after) {
            None => Ok(self.body),
            Some(err) => Err(err),
        }
    }
}

/// Async client for the art host.
#[derive(Clone)]
pub struct ArtClient {
    client: reqwest::Client,
    max_retry_after: Duration,
}

impl ArtClient {
    /// Create a client with a standard Chrome user-agent.
    pub fn new(timeout: Duration, max_retry_after: Duration) -> AcquireResult<Self> {
        let ua = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
                  AppleWebKit/537.36 (KHTML, like Gecko) \
                  Chrome/131.0.0.0 Safari/537.36";

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(ua)
            .build()
            .map_err(|e| AcquireError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_retry_after,
        })
    }

    /// Perform one GET. Transport failures are errors; every HTTP status,
    /// including 404 and 429, comes back as a response.
    pub async fn get(&self, url: &str) -> AcquireResult<ArtResponse> {
        let r = self.client.get(url).send().await?;
        let status = r.status().as_u16();

        let retry_after = r
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, chrono::Utc::now()))
            .map(|d| d.min(self.max_retry_after));

        // Error bodies are not worth reading.
        let body = if (200..300).contains(&status) {
            r.bytes().await?
        } else {
            Bytes::new()
        };

        Ok(ArtResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// Parse a `Retry-After` value: delay-seconds or an HTTP-date.
///
/// Dates in the past yield a zero delay.
pub fn parse_retry_after(value: &str, now: chrono::DateTime<chrono::Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
