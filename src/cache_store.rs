//! Cache Store - Named TTL Caches
//!
//! Independent key/value caches, one per data domain, each with its own TTL
//! policy, size accounting and hit/miss/eviction counters.
//!
//! # Expiry
//!
//! A read at or after an entry's `expires_at` counts as a miss, removes the
//! entry and counts an eviction. Expired entries that are never read again are
//! reclaimed by [`NamedCache::purge_expired`] or when the cache is full.
//!
//! # Capacity
//!
//! Each cache holds at most `max_entries`. Inserting past the cap first drops
//! expired entries, then the least recently used ones. Every removal that is
//! not an explicit `remove`/`invalidate` counts as an eviction.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

/// Logical data domains served by the access layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheName {
    /// Generic upstream responses - 5 minutes TTL
    ApiResponses,
    /// Current playback polling - 2 seconds TTL
    CurrentPlayback,
    /// Playback queue contents - 30 seconds TTL
    Queue,
    /// Per-user computed state (profile, preferences) - 10 minutes TTL
    UserState,
}

impl CacheName {
    /// Every named cache, in dashboard order
    pub const ALL: [CacheName; 4] = [
        CacheName::ApiResponses,
        CacheName::CurrentPlayback,
        CacheName::Queue,
        CacheName::UserState,
    ];

    /// TTL tuned to how quickly the domain goes stale
    pub fn default_ttl(self) -> Duration {
        match self {
            Self::ApiResponses => Duration::from_secs(300),
            Self::CurrentPlayback => Duration::from_secs(2),
            Self::Queue => Duration::from_secs(30),
            Self::UserState => Duration::from_secs(600),
        }
    }

    /// Stable identifier used as the stats key
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApiResponses => "apiResponses",
            Self::CurrentPlayback => "currentPlayback",
            Self::Queue => "queue",
            Self::UserState => "userState",
        }
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache entry with expiration and recency tracking
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    size_bytes: u64,
    last_used: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Point-in-time counters for one named cache
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub sets: u64,
    /// Live entry count
    pub size: usize,
    /// Estimated bytes held by keys and values
    pub memory_usage: u64,
    /// `hits / (hits + misses)`, 0 when nothing was read yet
    pub hit_rate: f64,
}

/// A single TTL cache over values of type `V`
///
/// Values are cloned out on read, so `V` should be cheap to clone or wrapped
/// in an `Arc` by the caller.
pub struct NamedCache<V> {
    name: String,
    map: DashMap<String, CacheEntry<V>>,
    max_entries: usize,
    /// Recency clock; strictly increasing so ties cannot occur
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    sets: AtomicU64,
    memory_bytes: AtomicU64,
}

impl<V> NamedCache<V>
where
    V: Clone + Serialize,
{
    /// Create an empty cache holding at most `max_entries` entries
    pub fn new(name: impl Into<String>, max_entries: usize) -> Self {
        let name = name.into();
        debug!(cache = %name, max_entries, "Initializing named cache");

        Self {
            name,
            map: DashMap::new(),
            max_entries: max_entries.max(1),
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            memory_bytes: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a live value; expired entries are removed and reported as misses
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();

        if let Some(mut entry) = self.map.get_mut(key) {
            if !entry.is_expired(now) {
                entry.last_used = self.next_tick();
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            // Release the shard lock before removing
            drop(entry);
            if let Some((_, expired)) = self.map.remove_if(key, |_, e| e.is_expired(now)) {
                self.account_eviction(&expired);
                debug!(cache = %self.name, key = %key, "Expired entry evicted on read");
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `value` under `key` for `ttl`
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        let size_bytes = estimate_size(key, &value);
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
            size_bytes,
            last_used: self.next_tick(),
        };

        // Count the bytes before the entry becomes visible to removers
        self.memory_bytes.fetch_add(size_bytes, Ordering::Relaxed);
        if let Some(previous) = self.map.insert(key.to_string(), entry) {
            self.memory_bytes
                .fetch_sub(previous.size_bytes, Ordering::Relaxed);
        }
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(cache = %self.name, key = %key, ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX), "Cached key with TTL");

        if self.map.len() > self.max_entries {
            self.enforce_capacity(key);
        }
    }

    /// Remove a key without counting an eviction
    pub fn remove(&self, key: &str) -> bool {
        match self.map.remove(key) {
            Some((_, entry)) => {
                self.memory_bytes
                    .fetch_sub(entry.size_bytes, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Remove every key starting with `prefix`, returning how many went
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let keys: Vec<String> = self
            .map
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();

        keys.iter().filter(|k| self.remove(k)).count()
    }

    /// Drop every entry; counters are kept
    pub fn clear(&self) {
        let mut freed = 0;
        self.map.retain(|_, entry| {
            freed += entry.size_bytes;
            false
        });
        self.memory_bytes.fetch_sub(freed, Ordering::Relaxed);
    }

    /// Drop every expired entry, counting each as an eviction
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        let mut freed = 0;
        self.map.retain(|_, entry| {
            if entry.is_expired(now) {
                removed += 1;
                freed += entry.size_bytes;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            self.memory_bytes.fetch_sub(freed, Ordering::Relaxed);
            self.evictions.fetch_add(removed, Ordering::Relaxed);
            debug!(cache = %self.name, count = removed, "Purged expired entries");
        }
        usize::try_from(removed).unwrap_or(usize::MAX)
    }

    fn enforce_capacity(&self, keep: &str) {
        self.purge_expired();

        while self.map.len() > self.max_entries {
            let victim = self
                .map
                .iter()
                .filter(|e| e.key() != keep)
                .min_by_key(|e| e.value().last_used)
                .map(|e| e.key().clone());

            let Some(victim) = victim else { break };
            if let Some((_, entry)) = self.map.remove(&victim) {
                self.account_eviction(&entry);
                debug!(cache = %self.name, key = %victim, "Evicted least recently used entry");
            }
        }
    }

    fn account_eviction(&self, entry: &CacheEntry<V>) {
        self.memory_bytes
            .fetch_sub(entry.size_bytes, Ordering::Relaxed);
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Counter snapshot; pure atomic reads
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            size: self.map.len(),
            memory_usage: self.memory_bytes.load(Ordering::Relaxed),
            #[allow(clippy::cast_precision_loss)]
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }
}

fn estimate_size<V: Serialize>(key: &str, value: &V) -> u64 {
    let value_bytes = serde_json::to_vec(value).map_or(0, |bytes| bytes.len());
    u64::try_from(key.len() + value_bytes).unwrap_or(u64::MAX)
}

/// The set of named caches owned by one access layer instance
pub struct CacheStore {
    api_responses: Arc<NamedCache<serde_json::Value>>,
    current_playback: Arc<NamedCache<serde_json::Value>>,
    queue: Arc<NamedCache<serde_json::Value>>,
    user_state: Arc<NamedCache<serde_json::Value>>,
}

impl CacheStore {
    /// Create every named cache with the same entry cap
    pub fn new(max_entries: usize) -> Self {
        info!(max_entries, "Initializing cache store");

        Self {
            api_responses: Arc::new(NamedCache::new(CacheName::ApiResponses.as_str(), max_entries)),
            current_playback: Arc::new(NamedCache::new(
                CacheName::CurrentPlayback.as_str(),
                max_entries,
            )),
            queue: Arc::new(NamedCache::new(CacheName::Queue.as_str(), max_entries)),
            user_state: Arc::new(NamedCache::new(CacheName::UserState.as_str(), max_entries)),
        }
    }

    /// The cache serving `name`
    pub fn cache(&self, name: CacheName) -> &Arc<NamedCache<serde_json::Value>> {
        match name {
            CacheName::ApiResponses => &self.api_responses,
            CacheName::CurrentPlayback => &self.current_playback,
            CacheName::Queue => &self.queue,
            CacheName::UserState => &self.user_state,
        }
    }

    /// Purge expired entries in every cache
    pub fn purge_expired(&self) -> usize {
        CacheName::ALL
            .iter()
            .map(|name| self.cache(*name).purge_expired())
            .sum()
    }

    /// Per-cache counters keyed by cache name
    pub fn stats(&self) -> BTreeMap<&'static str, CacheStats> {
        CacheName::ALL
            .iter()
            .map(|name| (name.as_str(), self.cache(*name).stats()))
            .collect()
    }
}
