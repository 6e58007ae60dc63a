//! Smart Request Dispatcher - Gated Upstream Calls
//!
//! Every outbound Spotify Web API call goes through [`SmartDispatcher::smart_request`].
//!
//! # Request Flow
//!
//! ```text
//! caller
//!   → cache lookup            (hit: return, no pool slot used)
//!   → rate limiter            (only when a user id is given)
//!   → circuit breaker         (open: fail fast)
//!   → deduplicator            (join identical in-flight call)
//!   → backoff spacing         (delay, never reject)
//!   → connection pool         (FIFO queue when saturated)
//!   → HTTP transport
//!   → breaker/backoff update, cache populate
//! ```
//!
//! # Classification
//!
//! | Status      | Outcome                                   | Breaker            |
//! |-------------|-------------------------------------------|--------------------|
//! | 2xx         | `Ok`, body parsed when present            | success            |
//! | 204, 404    | `Ok` with empty body                      | success            |
//! | 401, 403    | `AuthExpired`                             | untouched          |
//! | 429         | `RateLimited`, process-wide delay set     | untouched          |
//! | other 4xx   | `Rejected`                                | untouched          |
//! | 5xx / I/O   | `UpstreamFailure` / `Transport`           | failure            |
//!
//! A caller that joins a deduplicated call shares its outcome and, on success,
//! writes the body under its own cache key as well.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use crate::cache_store::{CacheName, CacheStore};
use crate::circuit_breaker::ResilienceController;
use crate::config::UpstreamConfig;
use crate::dedup::{RequestDeduplicator, RequestSignature};
use crate::error::{RateLimitScope, RequestError};
use crate::pool::ConnectionPool;
use crate::rate_limiter::RateLimiter;
use crate::traits::{HttpTransport, UpstreamRequest, UpstreamResponse};

/// Outcome shared between deduplicated callers
pub type DispatchResult = Result<ApiResponse, RequestError>;

/// Longest upstream error body kept in error messages
const ERROR_BODY_LIMIT: usize = 256;

/// Where and for how long a successful response is cached
#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    pub cache: CacheName,
    pub key: String,
    pub ttl: Duration,
}

/// An outbound call as seen by callers
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: String,
    /// Absolute URL, or a path joined onto the configured base URL
    pub url: String,
    pub body: Option<serde_json::Value>,
    /// Identity charged against the per-user rate limit
    pub user_id: Option<String>,
    pub cache: Option<CachePolicy>,
    /// Whether identical concurrent calls may be collapsed
    pub dedupe: bool,
}

impl ApiRequest {
    pub fn new(method: &str, url: impl Into<String>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.into(),
            body: None,
            user_id: None,
            cache: None,
            dedupe: true,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new("POST", url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new("PUT", url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new("DELETE", url)
    }

    #[must_use]
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Cache a successful body in `cache` using that cache's default TTL
    #[must_use]
    pub fn cached(self, cache: CacheName, key: impl Into<String>) -> Self {
        self.cached_for(cache, key, cache.default_ttl())
    }

    #[must_use]
    pub fn cached_for(mut self, cache: CacheName, key: impl Into<String>, ttl: Duration) -> Self {
        self.cache = Some(CachePolicy {
            cache,
            key: key.into(),
            ttl,
        });
        self
    }

    /// Never collapse this call with an identical one (player commands)
    #[must_use]
    pub fn without_dedup(mut self) -> Self {
        self.dedupe = false;
        self
    }
}

/// A classified upstream answer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    /// `None` for empty answers such as "nothing playing" (204) or 404
    pub body: Option<serde_json::Value>,
    /// Served from a named cache without touching the network
    pub from_cache: bool,
}

impl ApiResponse {
    fn cached(body: serde_json::Value) -> Self {
        Self {
            status: 200,
            body: Some(body),
            from_cache: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_none()
    }

    /// Deserialize the body, `None` when the response was empty
    ///
    /// # Errors
    ///
    /// [`RequestError::Decode`] if the body does not match `T`.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<Option<T>, RequestError> {
        self.body
            .as_ref()
            .map(|body| serde_json::from_value(body.clone()))
            .transpose()
            .map_err(RequestError::from)
    }
}

/// Components the dispatcher orchestrates; shared with the owning facade
#[derive(Clone)]
pub struct DispatcherParts {
    pub upstream: UpstreamConfig,
    pub transport: Arc<dyn HttpTransport>,
    pub rate_limiter: Arc<RateLimiter>,
    pub resilience: Arc<ResilienceController>,
    pub dedup: Arc<RequestDeduplicator<DispatchResult>>,
    pub pool: Arc<ConnectionPool>,
    pub caches: Arc<CacheStore>,
}

/// Orchestrates cache, rate limiter, breaker, deduplicator, spacing and pool
#[derive(Clone)]
pub struct SmartDispatcher {
    inner: Arc<DispatcherParts>,
}

impl SmartDispatcher {
    pub fn new(parts: DispatcherParts) -> Self {
        debug!(transport = parts.transport.name(), base_url = %parts.upstream.base_url, "Dispatcher ready");
        Self {
            inner: Arc::new(parts),
        }
    }

    /// Issue `request` through every gate
    ///
    /// # Errors
    ///
    /// Any [`RequestError`]; see the module-level classification table.
    pub async fn smart_request(&self, request: ApiRequest) -> DispatchResult {
        let url = self.inner.resolve_url(&request.url);
        let span = info_span!(
            "smart_request",
            request_id = %Uuid::new_v4(),
            method = %request.method,
            url = %url,
        );

        self.dispatch(request, url).instrument(span).await
    }

    async fn dispatch(&self, request: ApiRequest, url: String) -> DispatchResult {
        let parts = &self.inner;

        // 1. Cache
        if let Some(policy) = &request.cache {
            if let Some(body) = parts.caches.cache(policy.cache).get(&policy.key) {
                debug!(cache = %policy.cache, key = %policy.key, "Served from cache");
                return Ok(ApiResponse::cached(body));
            }
        }

        // 2. Rate limiter
        if let Some(user_id) = &request.user_id {
            parts.rate_limiter.check(user_id).into_result()?;
        }

        // 3. Circuit breaker
        parts.resilience.check()?;

        let upstream = UpstreamRequest {
            method: request.method.clone(),
            url,
            body: request.body.clone(),
        };

        // 4. Deduplicator
        if request.dedupe {
            let signature =
                RequestSignature::new(&upstream.method, &upstream.url, upstream.body.as_ref());
            let parts = Arc::clone(&self.inner);
            let cache = request.cache.clone();
            let (shared, joined) = self
                .inner
                .dedup
                .join_or_start(signature, move || spawn_execute(parts, upstream, cache));
            if !joined {
                return shared.await;
            }

            debug!("Joined identical in-flight request");
            let result = shared.await;
            // The leader only populates its own key
            if let (Ok(response), Some(policy)) = (&result, &request.cache) {
                if let Some(body) = &response.body {
                    self.inner
                        .caches
                        .cache(policy.cache)
                        .set(&policy.key, body.clone(), policy.ttl);
                }
            }
            return result;
        }

        spawn_execute(Arc::clone(&self.inner), upstream, request.cache).await
    }

    pub fn parts(&self) -> &DispatcherParts {
        &self.inner
    }
}

/// Run the network half of a request on its own task so it completes even if
/// every caller stops waiting
async fn spawn_execute(
    parts: Arc<DispatcherParts>,
    request: UpstreamRequest,
    cache: Option<CachePolicy>,
) -> DispatchResult {
    let task = tokio::spawn(
        async move { parts.execute(request, cache).await }.in_current_span(),
    );
    match task.await {
        Ok(result) => result,
        Err(err) => Err(RequestError::Internal(format!("request task failed: {err}"))),
    }
}

impl DispatcherParts {
    fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!(
                "{}/{}",
                self.upstream.base_url.trim_end_matches('/'),
                url.trim_start_matches('/')
            )
        }
    }

    async fn execute(&self, request: UpstreamRequest, cache: Option<CachePolicy>) -> DispatchResult {
        // 5. Backoff spacing
        let wait = self.resilience.reserve_slot();
        if !wait.is_zero() {
            debug!(wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX), "Delaying for backoff spacing");
            tokio::time::sleep(wait).await;
            // The breaker may have opened while this call slept
            self.resilience.check()?;
        }

        // 6. Pool slot
        let permit = self.pool.acquire().await?;
        // The breaker may have opened while this call was queued; dropping the
        // permit releases the slot without counting an outcome
        self.resilience.check()?;

        // 7. Network call
        let result = match self.transport.send(request).await {
            Ok(response) => self.classify(response),
            Err(err) => Err(err),
        };

        // Breaker state must be settled before the slot frees for a queued call
        match &result {
            Ok(response) => {
                self.resilience.record_success();
                if let (Some(policy), Some(body)) = (&cache, &response.body) {
                    self.caches
                        .cache(policy.cache)
                        .set(&policy.key, body.clone(), policy.ttl);
                }
            }
            Err(err) if err.trips_breaker() => {
                warn!(error = %err, "Upstream call failed");
                self.resilience.record_failure();
            }
            Err(err) => debug!(error = %err, "Upstream call not successful"),
        }
        permit.finish(result.is_ok());

        result
    }

    fn classify(&self, response: UpstreamResponse) -> DispatchResult {
        let status = response.status;
        match status {
            204 | 404 => Ok(ApiResponse {
                status,
                body: None,
                from_cache: false,
            }),
            200..=299 => {
                let body = if response.body.trim().is_empty() {
                    None
                } else {
                    Some(serde_json::from_str(&response.body)?)
                };
                Ok(ApiResponse {
                    status,
                    body,
                    from_cache: false,
                })
            }
            401 | 403 => Err(RequestError::AuthExpired { status }),
            429 => {
                let retry_after = response.retry_after.unwrap_or(Duration::from_secs(1));
                self.resilience.record_rate_limited(retry_after);
                Err(RequestError::RateLimited {
                    retry_after_secs: retry_after.as_secs().max(1),
                    scope: RateLimitScope::Upstream,
                })
            }
            400..=499 => Err(RequestError::Rejected {
                status,
                message: truncate(&response.body),
            }),
            _ => Err(RequestError::UpstreamFailure {
                status: Some(status),
                message: truncate(&response.body),
            }),
        }
    }
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((idx, _)) => format!("{}…", body.get(..idx).unwrap_or(body)),
        None => body.to_string(),
    }
}
