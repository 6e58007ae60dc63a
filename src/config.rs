//! Access layer configuration
//!
//! All tunables are injected at construction time. Defaults are conservative
//! enough to keep a single client well below Spotify's published limits.
//! [`AccessLayerConfig::from_env`] overlays `SPOTIFY_ACCESS_*` variables on the
//! defaults; hosts that keep configuration in files can deserialize the same
//! structure with serde.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Sliding-window limits, per user and process-wide
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Length of one sliding window
    pub window_ms: u64,
    /// Requests allowed per user within one window
    pub per_user_limit: u32,
    /// Requests allowed across all users within one window
    pub global_limit: u32,
    /// Per-user records untouched for this long are dropped
    pub idle_eviction_ms: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn idle_eviction(&self) -> Duration {
        Duration::from_millis(self.idle_eviction_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            per_user_limit: 100,
            global_limit: 1000,
            idle_eviction_ms: 600_000,
        }
    }
}

/// Circuit breaker and backoff spacing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Minimum spacing between outbound calls at multiplier 1
    pub base_interval_ms: u64,
    /// Ceiling for the backoff multiplier
    pub max_multiplier: f64,
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open
    pub cooldown_ms: u64,
}

impl ResilienceConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 100,
            max_multiplier: 32.0,
            failure_threshold: 5,
            cooldown_ms: 60_000,
        }
    }
}

/// In-flight request deduplication
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long a pending or completed result is shared with new callers
    pub ttl_ms: u64,
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { ttl_ms: 1000 }
    }
}

/// Bounded request pool
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrent outbound calls
    pub max_concurrent: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_concurrent: 10 }
    }
}

/// Named cache sizing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry cap per named cache; the least recently used entry goes first
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 1000 }
    }
}

/// Upstream HTTP endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL that relative request paths are joined onto
    pub base_url: String,
    /// Per-call timeout enforced by the HTTP client
    pub request_timeout_ms: u64,
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.spotify.com/v1".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

/// Complete access layer configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccessLayerConfig {
    pub rate_limit: RateLimitConfig,
    pub resilience: ResilienceConfig,
    pub dedup: DedupConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub upstream: UpstreamConfig,
}

impl AccessLayerConfig {
    /// Defaults overlaid with `SPOTIFY_ACCESS_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed, or if the
    /// resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let read = |name: &str| lookup(&format!("SPOTIFY_ACCESS_{name}"));

        if let Some(v) = read("RATE_WINDOW_MS") {
            config.rate_limit.window_ms = parse_var("RATE_WINDOW_MS", &v)?;
        }
        if let Some(v) = read("PER_USER_LIMIT") {
            config.rate_limit.per_user_limit = parse_var("PER_USER_LIMIT", &v)?;
        }
        if let Some(v) = read("GLOBAL_LIMIT") {
            config.rate_limit.global_limit = parse_var("GLOBAL_LIMIT", &v)?;
        }
        if let Some(v) = read("IDLE_EVICTION_MS") {
            config.rate_limit.idle_eviction_ms = parse_var("IDLE_EVICTION_MS", &v)?;
        }
        if let Some(v) = read("BASE_INTERVAL_MS") {
            config.resilience.base_interval_ms = parse_var("BASE_INTERVAL_MS", &v)?;
        }
        if let Some(v) = read("MAX_MULTIPLIER") {
            config.resilience.max_multiplier = parse_var("MAX_MULTIPLIER", &v)?;
        }
        if let Some(v) = read("FAILURE_THRESHOLD") {
            config.resilience.failure_threshold = parse_var("FAILURE_THRESHOLD", &v)?;
        }
        if let Some(v) = read("COOLDOWN_MS") {
            config.resilience.cooldown_ms = parse_var("COOLDOWN_MS", &v)?;
        }
        if let Some(v) = read("DEDUP_TTL_MS") {
            config.dedup.ttl_ms = parse_var("DEDUP_TTL_MS", &v)?;
        }
        if let Some(v) = read("MAX_CONCURRENT") {
            config.pool.max_concurrent = parse_var("MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = read("CACHE_MAX_ENTRIES") {
            config.cache.max_entries = parse_var("CACHE_MAX_ENTRIES", &v)?;
        }
        if let Some(v) = read("BASE_URL") {
            config.upstream.base_url = v;
        }
        if let Some(v) = read("REQUEST_TIMEOUT_MS") {
            config.upstream.request_timeout_ms = parse_var("REQUEST_TIMEOUT_MS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make the layer inert or unbounded
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.window_ms == 0 {
            bail!("rate_limit.window_ms must be greater than zero");
        }
        if self.rate_limit.per_user_limit == 0 || self.rate_limit.global_limit == 0 {
            bail!("rate limit ceilings must be greater than zero");
        }
        if self.resilience.max_multiplier < 1.0 || !self.resilience.max_multiplier.is_finite() {
            bail!("resilience.max_multiplier must be a finite value >= 1");
        }
        #[allow(clippy::cast_precision_loss)]
        let max_spacing_ms = self.resilience.base_interval_ms as f64 * self.resilience.max_multiplier;
        if max_spacing_ms > crate::circuit_breaker::MAX_SPACING.as_secs_f64() * 1000.0 {
            bail!("resilience.base_interval_ms x max_multiplier must not exceed one hour");
        }
        if self.resilience.failure_threshold == 0 {
            bail!("resilience.failure_threshold must be greater than zero");
        }
        if self.pool.max_concurrent == 0 {
            bail!("pool.max_concurrent must be greater than zero");
        }
        if self.cache.max_entries == 0 {
            bail!("cache.max_entries must be greater than zero");
        }
        if self.upstream.base_url.is_empty() {
            bail!("upstream.base_url must not be empty");
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("invalid value for SPOTIFY_ACCESS_{name}: {raw:?}"))
}
