//! Stats Aggregator
//!
//! Composes the counters of every component into one serializable snapshot
//! for the operational dashboard. Building a snapshot only reads counters and
//! takes short locks; it performs no I/O and is safe to call on every poll.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::cache_store::{CacheStats, CacheStore};
use crate::circuit_breaker::{BreakerStats, ResilienceController};
use crate::dedup::{DedupStats, RequestDeduplicator};
use crate::pool::{ConnectionPool, PoolStats};
use crate::rate_limiter::{RateLimiter, RateLimiterStats};

/// Dashboard snapshot
///
/// Serializes as:
///
/// ```text
/// {
///   "rateLimiter":    { activeUsers, globalRequests, globalWindowStart, memoryUsageKB },
///   "connectionPool": { activeRequests, queuedRequests, completedRequests, failedRequests,
///                       averageResponseTimeMs, maxConcurrent },
///   "cache":          { <name>: { hits, misses, evictions, sets, size, memoryUsage, hitRate } },
///   "circuitBreaker": { state, isOpen, consecutiveFailures, backoffMultiplier, ... },
///   "dedup":          { entries, coalesced },
///   "timestamp":      <unix epoch ms>
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub rate_limiter: RateLimiterStats,
    pub connection_pool: PoolStats,
    pub cache: BTreeMap<&'static str, CacheStats>,
    pub circuit_breaker: BreakerStats,
    pub dedup: DedupStats,
    pub timestamp: u64,
}

impl StatsSnapshot {
    pub(crate) fn collect<T>(
        rate_limiter: &RateLimiter,
        pool: &ConnectionPool,
        caches: &CacheStore,
        breaker: &ResilienceController,
        dedup: &RequestDeduplicator<T>,
    ) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self {
            rate_limiter: rate_limiter.stats(),
            connection_pool: pool.stats(),
            cache: caches.stats(),
            circuit_breaker: breaker.stats(),
            dedup: dedup.stats(),
            timestamp: epoch_millis(),
        }
    }

    /// JSON form consumed by the dashboard
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Milliseconds since the Unix epoch
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
