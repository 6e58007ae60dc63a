//! Spotify Access Layer
//!
//! A resilient mediation layer for every outbound call to the Spotify Web API:
//! - **Rate Limiting**: per-user and global sliding windows with retry-after hints
//! - **Circuit Breaking**: fail fast after repeated upstream failures
//! - **Exponential Backoff**: spacing between calls stretches on failure, relaxes on success
//! - **Request Deduplication**: identical concurrent calls share one network request
//! - **Named TTL Caches**: playback, queue and user-state caches with hit/miss/eviction stats
//! - **Bounded Pool**: FIFO queue in front of a fixed number of concurrent calls
//! - **Live Statistics**: one cheap snapshot for an operational dashboard
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use spotify_access_layer::{AccessLayerBuilder, ApiRequest, CacheName, StaticToken};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let layer = AccessLayerBuilder::new()
//!         .with_token_provider(Arc::new(StaticToken("BQD...".to_string())))
//!         .build()?;
//!
//!     let playback = layer
//!         .smart_request(
//!             ApiRequest::get("/me/player")
//!                 .for_user("alice")
//!                 .cached(CacheName::CurrentPlayback, "playback:alice"),
//!         )
//!         .await?;
//!     tracing::info!(playing = !playback.is_empty(), "Polled playback");
//!
//!     let stats = layer.stats();
//!     tracing::info!(completed = stats.connection_pool.completed_requests, "Pool stats");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! caller → cache → rate limiter → circuit breaker → dedup → spacing → pool → HTTP
//!            ↑                                                                 │
//!            └───────────── populate on success ◄── breaker/backoff update ◄──┘
//! ```
//!
//! All state lives in one [`AccessLayer`] instance; there are no globals, so
//! independent instances can coexist (one per process, or one per test).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod builder;
pub mod cache_store;
pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod rate_limiter;
pub mod spotify;
pub mod stats;
pub mod traits;
pub mod transport;

pub use builder::AccessLayerBuilder;
pub use cache_store::{CacheName, CacheStats, CacheStore, NamedCache};
pub use circuit_breaker::{BreakerStats, CircuitState, ResilienceController};
pub use config::{
    AccessLayerConfig, CacheConfig, DedupConfig, PoolConfig, RateLimitConfig, ResilienceConfig,
    UpstreamConfig,
};
pub use dedup::{DedupStats, RequestDeduplicator, RequestSignature};
pub use dispatcher::{
    ApiRequest, ApiResponse, CachePolicy, DispatchResult, DispatcherParts, SmartDispatcher,
};
pub use error::{RateLimitScope, RequestError};
pub use pool::{ConnectionPool, PoolStats};
pub use rate_limiter::{RateDecision, RateLimiter, RateLimiterStats, RateStatus};
pub use spotify::{PlayerCommand, SpotifyClient};
pub use stats::StatsSnapshot;
pub use traits::{HttpTransport, StaticToken, TokenProvider, UpstreamRequest, UpstreamResponse};
pub use transport::ReqwestTransport;

// Re-export async_trait for transport implementors
pub use async_trait::async_trait;

/// Install a `tracing` fmt subscriber filtered by `RUST_LOG` (default `info`)
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Main entry point: one instance of every component plus the dispatcher
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct AccessLayer {
    config: Arc<AccessLayerConfig>,
    dispatcher: SmartDispatcher,
}

impl AccessLayer {
    /// Build with default configuration around an existing transport
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self::from_parts(AccessLayerConfig::default(), transport)
    }

    /// Wire every component from `config`; callers are expected to have validated it
    pub(crate) fn from_parts(config: AccessLayerConfig, transport: Arc<dyn HttpTransport>) -> Self {
        info!("Initializing Spotify access layer");

        let parts = DispatcherParts {
            upstream: config.upstream.clone(),
            transport,
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            resilience: Arc::new(ResilienceController::new(config.resilience.clone())),
            dedup: Arc::new(RequestDeduplicator::new(config.dedup.ttl())),
            pool: Arc::new(ConnectionPool::new(config.pool.max_concurrent)),
            caches: Arc::new(CacheStore::new(config.cache.max_entries)),
        };

        info!(
            max_concurrent = config.pool.max_concurrent,
            base_url = %config.upstream.base_url,
            "Spotify access layer initialized"
        );

        Self {
            config: Arc::new(config),
            dispatcher: SmartDispatcher::new(parts),
        }
    }

    /// Issue a request through every gate
    ///
    /// # Errors
    ///
    /// Any [`RequestError`]; see [`dispatcher`] for the classification.
    pub async fn smart_request(&self, request: ApiRequest) -> DispatchResult {
        self.dispatcher.smart_request(request).await
    }

    pub fn dispatcher(&self) -> &SmartDispatcher {
        &self.dispatcher
    }

    /// Endpoint helpers sharing this layer's state
    pub fn spotify(&self) -> SpotifyClient {
        SpotifyClient::new(self.dispatcher.clone())
    }

    pub fn config(&self) -> &AccessLayerConfig {
        &self.config
    }

    /// A named cache, for direct reads, writes and invalidation
    pub fn cache(&self, name: CacheName) -> &Arc<NamedCache<serde_json::Value>> {
        self.dispatcher.parts().caches.cache(name)
    }

    /// Allow/deny and retry-after for `user_id` without issuing a call
    pub fn rate_status(&self, user_id: &str) -> RateStatus {
        self.dispatcher.parts().rate_limiter.status(user_id)
    }

    /// Dashboard snapshot of every component
    pub fn stats(&self) -> StatsSnapshot {
        let parts = self.dispatcher.parts();
        StatsSnapshot::collect(
            &parts.rate_limiter,
            &parts.pool,
            &parts.caches,
            &parts.resilience,
            &parts.dedup,
        )
    }

    /// `false` while the circuit breaker is open
    pub fn health_check(&self) -> bool {
        match self.dispatcher.parts().resilience.state() {
            CircuitState::Closed => {
                debug!("Access layer health check passed");
                true
            }
            CircuitState::Open => {
                warn!("Access layer health check - circuit open");
                false
            }
        }
    }

    /// Periodically purge expired cache entries, stale dedup entries and idle
    /// rate-limit records
    ///
    /// The task runs until the returned handle is aborted.
    pub fn spawn_janitor(&self, every: Duration) -> JoinHandle<()> {
        let parts = self.dispatcher.parts().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let caches = parts.caches.purge_expired();
                let dedup = parts.dedup.purge_stale();
                let users = parts.rate_limiter.evict_idle();
                if caches + dedup + users > 0 {
                    debug!(caches, dedup, users, "Janitor sweep");
                }
            }
        })
    }
}
