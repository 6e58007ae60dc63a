//! Connection pool management.
//!
//! # Responsibilities
//! - Bound the number of concurrent outbound calls
//! - Queue the remainder in arrival order (the semaphore is FIFO-fair)
//! - Account active/queued/completed/failed calls and a running mean latency
//!
//! A [`PoolPermit`] is held for the duration of one upstream call. Dropping it
//! releases the slot and decrements `active`; [`PoolPermit::finish`] also
//! records the outcome.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::debug;

use crate::error::RequestError;

/// Dashboard counters
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub active_requests: usize,
    pub queued_requests: usize,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub average_response_time_ms: f64,
    pub max_concurrent: usize,
}

#[derive(Debug, Default)]
struct RunningMean {
    samples: u64,
    mean_ms: f64,
}

impl RunningMean {
    #[allow(clippy::cast_precision_loss)]
    fn record(&mut self, elapsed: Duration) {
        self.samples += 1;
        let sample = elapsed.as_secs_f64() * 1000.0;
        self.mean_ms += (sample - self.mean_ms) / self.samples as f64;
    }
}

/// Bounded-concurrency gate for upstream calls
pub struct ConnectionPool {
    semaphore: Semaphore,
    max_concurrent: usize,
    active: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    timing: Mutex<RunningMean>,
}

/// Decrements the queued counter however the wait ends
struct QueuedGuard<'a>(&'a AtomicUsize);

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ConnectionPool {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        debug!(max_concurrent, "Initializing connection pool");

        Self {
            semaphore: Semaphore::new(max_concurrent),
            max_concurrent,
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timing: Mutex::new(RunningMean::default()),
        }
    }

    /// Take a slot, waiting in FIFO order when the pool is saturated
    ///
    /// # Errors
    ///
    /// [`RequestError::Internal`] if the pool was closed.
    pub async fn acquire(&self) -> Result<PoolPermit<'_>, RequestError> {
        let permit = match self.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                self.queued.fetch_add(1, Ordering::Relaxed);
                let _queued = QueuedGuard(&self.queued);
                debug!(queued = self.queued.load(Ordering::Relaxed), "Pool saturated, request queued");
                self.semaphore
                    .acquire()
                    .await
                    .map_err(|_| RequestError::Internal("connection pool closed".to_string()))?
            }
        };

        self.active.fetch_add(1, Ordering::Relaxed);
        Ok(PoolPermit {
            pool: self,
            _permit: permit,
            started: Instant::now(),
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active_requests: self.active.load(Ordering::Relaxed),
            queued_requests: self.queued.load(Ordering::Relaxed),
            completed_requests: self.completed.load(Ordering::Relaxed),
            failed_requests: self.failed.load(Ordering::Relaxed),
            average_response_time_ms: self.timing.lock().mean_ms,
            max_concurrent: self.max_concurrent,
        }
    }
}

/// An occupied pool slot
pub struct PoolPermit<'a> {
    pool: &'a ConnectionPool,
    _permit: SemaphorePermit<'a>,
    started: Instant,
}

impl PoolPermit<'_> {
    /// Record the outcome of the call made under this permit and release it
    pub fn finish(self, success: bool) {
        let elapsed = self.started.elapsed();
        if success {
            self.pool.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.pool.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.pool.timing.lock().record(elapsed);
    }
}

impl Drop for PoolPermit<'_> {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::Relaxed);
    }
}
