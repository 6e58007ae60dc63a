//! Upstream Collaborator Traits
//!
//! The access layer never talks to the network directly. It hands a fully
//! resolved [`UpstreamRequest`] to an [`HttpTransport`] and classifies the
//! [`UpstreamResponse`] it gets back. Bearer tokens come from a
//! [`TokenProvider`] owned by the host's session layer.
//!
//! # Architecture
//!
//! - `HttpTransport`: performs one HTTP exchange, no retries, no caching
//! - `TokenProvider`: supplies the current bearer token
//!
//! # Example: Custom Transport
//!
//! ```rust,ignore
//! use spotify_access_layer::{HttpTransport, RequestError, UpstreamRequest, UpstreamResponse, async_trait};
//!
//! struct Recorded;
//!
//! #[async_trait]
//! impl HttpTransport for Recorded {
//!     async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, RequestError> {
//!         Ok(UpstreamResponse::json(200, serde_json::json!({"url": request.url})))
//!     }
//!
//!     fn name(&self) -> &'static str {
//!         "recorded"
//!     }
//! }
//! ```

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::RequestError;

/// A resolved outbound call
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    /// Upper-case HTTP method
    pub method: String,
    /// Absolute URL
    pub url: String,
    /// JSON body, if any
    pub body: Option<serde_json::Value>,
}

/// Raw upstream answer before classification
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: u16,
    /// Parsed `Retry-After` header
    pub retry_after: Option<Duration>,
    /// Response body as text; may be empty
    pub body: String,
}

impl UpstreamResponse {
    /// Response with a JSON body
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.to_string(),
        }
    }

    /// Response with no body
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            retry_after: None,
            body: String::new(),
        }
    }

    /// Attach a `Retry-After` value
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Performs a single HTTP exchange with the upstream API
///
/// Implementations must not retry, cache or rate limit: all of that is the
/// dispatcher's job. Connection-level failures are reported as
/// [`RequestError::Transport`]; every received HTTP status, including errors,
/// is returned as `Ok`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, RequestError>;

    /// Name used in logs
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Source of the current OAuth bearer token
///
/// Token refresh lives with the implementor. An error means no usable token
/// exists and is surfaced to callers as [`RequestError::AuthExpired`].
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// A fixed token, for scripts and tests
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String> {
        if self.0.is_empty() {
            anyhow::bail!("no access token configured");
        }
        Ok(self.0.clone())
    }
}
