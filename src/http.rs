//! Shared HTTP plumbing for source adapters and AWS-backed stores.
//!
//! One [`reqwest::Client`] is built per process with an explicit timeout and
//! reused across every page of a run. Responses are classified here so that
//! every adapter maps provider failures onto [`HarvestError`] the same way:
//!
//! | Response | Error |
//! |----------|-------|
//! | network failure / timeout | `Transport` |
//! | HTTP 429 | `RateLimited` (with `Retry-After` when present) |
//! | other non-2xx | `Transport` (status + truncated body) |
//! | undecodable 2xx body | `Parse` (raw body kept) |

use std::time::Duration;

use audit_harvest_core::HarvestError;
use reqwest::header::RETRY_AFTER;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

/// Longest body excerpt copied into a `Transport` error message.
const ERROR_BODY_LIMIT: usize = 500;

pub fn client(timeout: Duration) -> Result<reqwest::Client, HarvestError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("audit-harvest/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| HarvestError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Map a `reqwest` failure to `Transport`, naming the call that failed.
pub fn transport(what: &str, err: reqwest::Error) -> HarvestError {
    if err.is_timeout() {
        HarvestError::Transport(format!("{}: request timed out", what))
    } else {
        HarvestError::Transport(format!("{}: {}", what, err))
    }
}

/// Parse a `Retry-After` header given in seconds.
pub fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Pass 2xx responses through; turn everything else into an error.
pub async fn check(resp: Response, what: &str) -> Result<Response, HarvestError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(HarvestError::RateLimited {
            retry_after: retry_after(&resp),
        });
    }
    let body = resp.text().await.unwrap_or_default();
    Err(HarvestError::Transport(format!(
        "{} failed (HTTP {}): {}",
        what,
        status,
        body.chars().take(ERROR_BODY_LIMIT).collect::<String>()
    )))
}

/// Read the full body and decode it as JSON, keeping the body on failure.
pub async fn read_json<T: DeserializeOwned>(resp: Response, what: &str) -> Result<T, HarvestError> {
    let body = resp.text().await.map_err(|e| transport(what, e))?;
    decode_json(&body, what)
}

pub fn decode_json<T: DeserializeOwned>(body: &str, what: &str) -> Result<T, HarvestError> {
    serde_json::from_str(body)
        .map_err(|e| HarvestError::parse(format!("{}: invalid response body: {}", what, e), body))
}
