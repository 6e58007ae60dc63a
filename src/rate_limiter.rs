//! Sliding-window rate limiting, per user and process-wide
//!
//! Each user identity owns a `RateLimitRecord` created on first use. A window
//! restarts once more than `window` has passed since it opened; the counter is
//! incremented before the ceiling is compared, so denied attempts also count.
//! A separate global record applies its own ceiling to every checked call.
//!
//! Both records are updated inside one critical section so a check can never
//! observe a half-applied window reset.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::{RateLimitScope, RequestError};
use crate::stats::epoch_millis;

#[derive(Debug, Clone)]
struct RateLimitRecord {
    window_start: Instant,
    request_count: u32,
    last_seen: Instant,
}

impl RateLimitRecord {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            request_count: 0,
            last_seen: now,
        }
    }

    /// Restart the window if it has fully elapsed
    fn roll(&mut self, now: Instant, window: Duration) -> bool {
        if now.saturating_duration_since(self.window_start) > window {
            self.window_start = now;
            self.request_count = 0;
            true
        } else {
            false
        }
    }

    /// Whole seconds until this window closes, never less than one
    fn retry_after_secs(&self, now: Instant, window: Duration) -> u64 {
        let remaining = (self.window_start + window).saturating_duration_since(now);
        let millis = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX);
        millis.div_ceil(1000).max(1)
    }
}

#[derive(Debug)]
struct GlobalRateState {
    record: RateLimitRecord,
    window_start_epoch_ms: u64,
}

#[derive(Debug)]
struct Inner {
    users: HashMap<String, RateLimitRecord>,
    global: GlobalRateState,
    last_sweep: Instant,
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_secs: u64,
    /// Which ceiling denied the call, `None` when allowed
    #[serde(skip)]
    pub scope: Option<RateLimitScope>,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0,
            scope: None,
        }
    }

    fn deny(retry_after_secs: u64, scope: RateLimitScope) -> Self {
        Self {
            allowed: false,
            retry_after_secs,
            scope: Some(scope),
        }
    }

    /// Convert a denial into the dispatcher's error type
    pub fn into_result(self) -> Result<(), RequestError> {
        match self.scope {
            Some(scope) if !self.allowed => Err(RequestError::RateLimited {
                retry_after_secs: self.retry_after_secs,
                scope,
            }),
            _ => Ok(()),
        }
    }
}

/// Read-only view of one user's budget, without consuming a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateStatus {
    pub allowed: bool,
    pub retry_after_secs: u64,
    pub request_count: u32,
    pub remaining: u32,
}

/// Dashboard counters
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub active_users: usize,
    pub global_requests: u32,
    /// Unix epoch milliseconds at which the current global window opened
    pub global_window_start: u64,
    #[serde(rename = "memoryUsageKB")]
    pub memory_usage_kb: f64,
}

/// Per-user and global sliding-window limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        debug!(
            window_ms = config.window_ms,
            per_user = config.per_user_limit,
            global = config.global_limit,
            "Initializing rate limiter"
        );

        Self {
            config,
            inner: Mutex::new(Inner {
                users: HashMap::new(),
                global: GlobalRateState {
                    record: RateLimitRecord::new(now),
                    window_start_epoch_ms: epoch_millis(),
                },
                last_sweep: now,
            }),
        }
    }

    /// Count one request for `user_id` and decide whether it may proceed
    pub fn check(&self, user_id: &str) -> RateDecision {
        let now = Instant::now();
        let window = self.config.window();
        let mut inner = self.inner.lock();

        if now.saturating_duration_since(inner.last_sweep) > window {
            inner.last_sweep = now;
            Self::sweep_idle(&mut inner.users, now, self.config.idle_eviction());
        }

        let record = inner
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| RateLimitRecord::new(now));
        record.roll(now, window);
        record.request_count = record.request_count.saturating_add(1);
        record.last_seen = now;

        if record.request_count > self.config.per_user_limit {
            let retry = record.retry_after_secs(now, window);
            warn!(user = %user_id, retry_after_secs = retry, "Per-user rate limit exceeded");
            return RateDecision::deny(retry, RateLimitScope::User);
        }

        let global = &mut inner.global;
        if global.record.roll(now, window) {
            global.window_start_epoch_ms = epoch_millis();
        }
        global.record.request_count = global.record.request_count.saturating_add(1);

        if global.record.request_count > self.config.global_limit {
            let retry = global.record.retry_after_secs(now, window);
            warn!(retry_after_secs = retry, "Global rate limit exceeded");
            return RateDecision::deny(retry, RateLimitScope::Global);
        }

        RateDecision::allow()
    }

    /// What [`check`](Self::check) would answer for the next call, without counting it
    pub fn status(&self, user_id: &str) -> RateStatus {
        let now = Instant::now();
        let window = self.config.window();
        let inner = self.inner.lock();

        let mut user = inner
            .users
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| RateLimitRecord::new(now));
        user.roll(now, window);
        let mut global = inner.global.record.clone();
        global.roll(now, window);

        let remaining = self.config.per_user_limit.saturating_sub(user.request_count);
        let (allowed, retry_after_secs) = if remaining == 0 {
            (false, user.retry_after_secs(now, window))
        } else if global.request_count >= self.config.global_limit {
            (false, global.retry_after_secs(now, window))
        } else {
            (true, 0)
        };

        RateStatus {
            allowed,
            retry_after_secs,
            request_count: user.request_count,
            remaining,
        }
    }

    /// Drop user records idle for longer than the configured eviction delay
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.last_sweep = now;
        Self::sweep_idle(&mut inner.users, now, self.config.idle_eviction())
    }

    fn sweep_idle(users: &mut HashMap<String, RateLimitRecord>, now: Instant, idle: Duration) -> usize {
        let before = users.len();
        users.retain(|_, record| now.saturating_duration_since(record.last_seen) <= idle);
        let removed = before - users.len();
        if removed > 0 {
            debug!(count = removed, "Evicted idle rate limit records");
        }
        removed
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let window = self.config.window();
        let inner = self.inner.lock();

        let mut global = inner.global.record.clone();
        let expired = global.roll(now, window);

        let record_bytes = std::mem::size_of::<RateLimitRecord>();
        let bytes: usize = inner
            .users
            .keys()
            .map(|key| key.len() + record_bytes)
            .sum();

        RateLimiterStats {
            active_users: inner.users.len(),
            global_requests: global.request_count,
            global_window_start: if expired {
                epoch_millis()
            } else {
                inner.global.window_start_epoch_ms
            },
            #[allow(clippy::cast_precision_loss)]
            memory_usage_kb: bytes as f64 / 1024.0,
        }
    }
}
