//! `reqwest` transport - the production [`HttpTransport`]
//!
//! Adds the bearer token, sends the request and reports the raw status, the
//! `Retry-After` header and the body text. Classification happens in the
//! dispatcher.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method};
use tracing::{debug, info};

use crate::config::UpstreamConfig;
use crate::error::RequestError;
use crate::traits::{HttpTransport, TokenProvider, UpstreamRequest, UpstreamResponse};

/// HTTP transport backed by a pooled `reqwest::Client`
pub struct ReqwestTransport {
    client: Client,
    tokens: Arc<dyn TokenProvider>,
}

impl ReqwestTransport {
    /// Build a client with the configured timeout
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(config: &UpstreamConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        info!(timeout_ms = config.request_timeout_ms, "HTTP transport initialized");

        Ok(Self { client, tokens })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, RequestError> {
        let token = self.tokens.access_token().await.map_err(|e| {
            debug!(error = %e, "No access token available");
            RequestError::AuthExpired { status: 401 }
        })?;

        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| RequestError::Internal(format!("invalid method {}: {e}", request.method)))?;

        let mut builder = self.client.request(method, &request.url).bearer_auth(token);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RequestError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response
            .text()
            .await
            .map_err(|e| RequestError::Transport(e.to_string()))?;

        Ok(UpstreamResponse {
            status,
            retry_after,
            body,
        })
    }

    fn name(&self) -> &'static str {
        "reqwest"
    }
}

/// `Retry-After` in delta-seconds form; HTTP-date values are not used by Spotify
pub(crate) fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}
