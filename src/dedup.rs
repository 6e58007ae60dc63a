//! Request Deduplicator - In-Flight Request Coalescing
//!
//! Identical outbound calls (same method, URL and body) issued within the
//! dedup TTL share a single operation. The entry is registered *before* the
//! operation resolves, so callers racing on the same signature collapse onto
//! one network call and all observe the same result. A completed result stays
//! shareable until the TTL elapses.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

/// A result handle that can be awaited by any number of callers
pub type SharedResult<T> = Shared<BoxFuture<'static, T>>;

/// Canonical identity of an outbound request: method + URL + body
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestSignature(String);

impl RequestSignature {
    pub fn new(method: &str, url: &str, body: Option<&serde_json::Value>) -> Self {
        // serde_json::Value serializes object keys in sorted order, so equal
        // bodies always produce equal signatures
        let body = body.map(ToString::to_string).unwrap_or_default();
        Self(format!("{} {url} {body}", method.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct DedupEntry<T> {
    created: Instant,
    pending: SharedResult<T>,
}

/// Dashboard counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupStats {
    /// Signatures currently tracked (pending or recently completed)
    pub entries: usize,
    /// Callers that joined an existing operation instead of starting one
    pub coalesced: u64,
}

/// Short-TTL memo of pending and recently completed operations
pub struct RequestDeduplicator<T> {
    ttl: Duration,
    entries: DashMap<RequestSignature, DedupEntry<T>>,
    coalesced: AtomicU64,
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Join a live operation for `signature`, or register one built by `operation`
    ///
    /// Returns the shared handle and whether the caller joined an existing one.
    /// `operation` is only invoked when no live entry exists; the returned future
    /// is driven by whoever polls the handle first.
    pub fn join_or_start<F, Fut>(&self, signature: RequestSignature, operation: F) -> (SharedResult<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let now = Instant::now();

        let handle = match self.entries.entry(signature) {
            Entry::Occupied(entry) if now.saturating_duration_since(entry.get().created) < self.ttl => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(signature = %entry.key(), "Joined in-flight request");
                return (entry.get().pending.clone(), true);
            }
            Entry::Occupied(mut entry) => {
                let pending = operation().boxed().shared();
                entry.insert(DedupEntry {
                    created: now,
                    pending: pending.clone(),
                });
                pending
            }
            Entry::Vacant(entry) => {
                let pending = operation().boxed().shared();
                entry.insert(DedupEntry {
                    created: now,
                    pending: pending.clone(),
                });
                pending
            }
        };

        self.purge_stale();
        (handle, false)
    }

    /// Drop entries older than the TTL
    pub fn purge_stale(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.created) < self.ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            entries: self.entries.len(),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}
