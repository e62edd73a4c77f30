//! Typed error taxonomy surfaced by the retry engine.
//!
//! Every variant names the URL and the failure kind; response headers are
//! never included in messages.

use thiserror::Error;

use crate::challenge::ChallengeType;

/// Result alias used across the crate.
pub type WaferResult<T> = Result<T, WaferError>;

/// Errors raised by [`crate::Session`] once local recovery is exhausted.
///
/// In bulk mode (`max_rotations == 0` and/or `max_retries == 0`) the engine
/// prefers returning the last response with `challenge_type` populated over
/// raising `ChallengeDetected`/`RateLimited`/`EmptyResponse`.
#[derive(Debug, Error)]
pub enum WaferError {
    /// Raised only from [`crate::WaferResponse::error_for_status`].
    #[error("HTTP {status_code} at {url}")]
    Http { status_code: u16, url: String },

    /// A JS-only challenge survived every rotation the budget allowed.
    #[error("{challenge_type} challenge detected at {url} (HTTP {status_code})")]
    ChallengeDetected {
        challenge_type: ChallengeType,
        url: String,
        status_code: u16,
    },

    /// 429 without a solvable challenge and no rotation budget left.
    #[error("rate limited at {url}")]
    RateLimited {
        url: String,
        retry_after: Option<f64>,
    },

    /// Transport-layer failure after normal retries were exhausted.
    #[error("connection failed to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// 200 with an all-whitespace body after normal retries were exhausted.
    #[error("empty response from {url} (HTTP {status_code})")]
    EmptyResponse { url: String, status_code: u16 },

    #[error("too many redirects ({max_redirects}) for {url}")]
    TooManyRedirects { url: String, max_redirects: u32 },

    /// The overall per-request deadline was exceeded.
    #[error("request to {url} exceeded {timeout_secs:.1}s timeout")]
    Timeout { url: String, timeout_secs: f64 },

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Session construction failed (transport build, header conversion).
    #[error("session setup failed: {0}")]
    Setup(String),
}
