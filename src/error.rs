//! Error taxonomy for outbound Spotify Web API calls
//!
//! Every failure a caller can observe from the dispatcher is a [`RequestError`].
//! The type is `Clone` because a single deduplicated outcome is handed to every
//! caller that joined the same in-flight request.
//!
//! "Nothing is playing" (HTTP 204) and "not found" (HTTP 404) are deliberately
//! absent: they resolve to an empty [`ApiResponse`](crate::ApiResponse) body.

use std::fmt;
use std::time::Duration;

/// Which limit produced a [`RequestError::RateLimited`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    /// Per-user sliding window
    User,
    /// Process-wide sliding window
    Global,
    /// Upstream answered `429 Too Many Requests`
    Upstream,
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Global => f.write_str("global"),
            Self::Upstream => f.write_str("upstream"),
        }
    }
}

/// Failure returned by the smart request dispatcher
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    /// Local or upstream rate limit hit; caller may retry after the hint
    #[error("rate limited ({scope}), retry after {retry_after_secs}s")]
    RateLimited {
        retry_after_secs: u64,
        scope: RateLimitScope,
    },

    /// Circuit breaker is open; no network call was attempted
    #[error("circuit open, retry after {retry_after_secs}s")]
    CircuitOpen { retry_after_secs: u64 },

    /// Bearer token rejected (401/403); must be surfaced to the token owner
    #[error("authorization expired (HTTP {status})")]
    AuthExpired { status: u16 },

    /// 5xx or otherwise unusable upstream answer
    #[error("upstream failure{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    UpstreamFailure {
        status: Option<u16>,
        message: String,
    },

    /// Upstream refused the request itself (4xx other than auth/429/404)
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// Connection-level failure before any HTTP status was received
    #[error("transport error: {0}")]
    Transport(String),

    /// Response body could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// The in-flight task backing a request disappeared
    #[error("internal error: {0}")]
    Internal(String),
}

impl RequestError {
    /// Whether a caller may reasonably retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::CircuitOpen { .. }
                | Self::UpstreamFailure { .. }
                | Self::Transport(_)
        )
    }

    /// Retry hint carried by rate-limit and circuit-open failures
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_secs, ..
            }
            | Self::CircuitOpen { retry_after_secs } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }

    /// True only for genuine token expiry, the one case that warrants re-authentication
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired { .. })
    }

    /// Whether this outcome counts as an upstream failure for the circuit breaker
    pub(crate) fn trips_breaker(&self) -> bool {
        matches!(self, Self::UpstreamFailure { .. } | Self::Transport(_))
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
