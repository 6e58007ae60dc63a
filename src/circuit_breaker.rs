//! Circuit breaker and backoff spacing for the upstream API
//!
//! # States
//! - Closed: calls pass through
//! - Open: calls fail fast until `open_until`
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive_failures >= failure_threshold
//! Open → Closed: any success, or implicitly once now >= open_until
//! ```
//!
//! There is no half-open probe. After the cooldown the next call is attempted
//! normally; if it fails the failure count is still above the threshold, so the
//! circuit re-opens immediately.
//!
//! Independently of the breaker, a backoff multiplier (doubled per failure,
//! halved per success, bounded by `[1, max_multiplier]`) stretches the minimum
//! spacing between outbound calls. An upstream `429` pushes a process-wide
//! "not before" instant that spacing also honours.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ResilienceConfig;
use crate::error::RequestError;

/// Upper bound on the spacing between two outbound calls
pub const MAX_SPACING: Duration = Duration::from_secs(3600);

/// Breaker state as observed at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Closed,
    Open,
}

#[derive(Debug)]
struct BackoffState {
    consecutive_failures: u32,
    backoff_multiplier: f64,
    open_until: Option<Instant>,
    /// Send time handed to the most recent caller
    last_slot: Option<Instant>,
    /// Set from an upstream `Retry-After`
    upstream_backoff_until: Option<Instant>,
    trips: u64,
}

impl BackoffState {
    fn open_remaining(&self, now: Instant) -> Option<Duration> {
        self.open_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }
}

/// Dashboard counters
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub state: CircuitState,
    pub is_open: bool,
    pub consecutive_failures: u32,
    pub backoff_multiplier: f64,
    /// Seconds until the breaker closes, 0 when closed
    pub retry_after_seconds: u64,
    /// Current minimum spacing between outbound calls
    pub min_interval_ms: u64,
    /// Times the breaker has opened since start
    pub trips: u64,
}

/// Failure-driven breaker plus continuous backoff spacing
pub struct ResilienceController {
    config: ResilienceConfig,
    state: Mutex<BackoffState>,
}

impl ResilienceController {
    pub fn new(config: ResilienceConfig) -> Self {
        info!(
            failure_threshold = config.failure_threshold,
            cooldown_ms = config.cooldown_ms,
            base_interval_ms = config.base_interval_ms,
            max_multiplier = config.max_multiplier,
            "Circuit breaker initialized"
        );

        Self {
            config,
            state: Mutex::new(BackoffState {
                consecutive_failures: 0,
                backoff_multiplier: 1.0,
                open_until: None,
                last_slot: None,
                upstream_backoff_until: None,
                trips: 0,
            }),
        }
    }

    /// Current breaker state
    pub fn state(&self) -> CircuitState {
        let now = Instant::now();
        if self.state.lock().open_remaining(now).is_some() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Fail fast while the circuit is open
    ///
    /// # Errors
    ///
    /// [`RequestError::CircuitOpen`] carrying the remaining cooldown, rounded up.
    pub fn check(&self) -> Result<(), RequestError> {
        let now = Instant::now();
        let state = self.state.lock();
        match state.open_remaining(now) {
            Some(remaining) => Err(RequestError::CircuitOpen {
                retry_after_secs: ceil_secs(remaining),
            }),
            None => Ok(()),
        }
    }

    /// Reserve the next send slot and return how long the caller must wait for it
    ///
    /// The reservation happens under the lock, so concurrent callers are spaced
    /// out from each other rather than all waking at the same instant.
    pub fn reserve_slot(&self) -> Duration {
        let now = Instant::now();
        let mut state = self.state.lock();

        let interval = self.interval_for(state.backoff_multiplier);
        let mut slot = state
            .last_slot
            .and_then(|last| last.checked_add(interval))
            .map_or(now, |next| next.max(now));
        if let Some(until) = state.upstream_backoff_until {
            slot = slot.max(until);
        }
        state.last_slot = Some(slot);

        slot - now
    }

    /// Record a healthy upstream answer
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        let was_open = state.open_until.is_some();

        state.consecutive_failures = 0;
        state.backoff_multiplier = (state.backoff_multiplier / 2.0).max(1.0);
        state.open_until = None;

        if was_open {
            info!("Circuit breaker closed after successful call");
        }
    }

    /// Record an upstream failure (5xx or transport error)
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.backoff_multiplier =
            (state.backoff_multiplier * 2.0).min(self.config.max_multiplier);

        if state.consecutive_failures >= self.config.failure_threshold {
            if state.open_remaining(now).is_none() {
                state.trips += 1;
            }
            state.open_until = Some(now + self.config.cooldown());
            warn!(
                consecutive_failures = state.consecutive_failures,
                cooldown_ms = self.config.cooldown_ms,
                "Circuit breaker opened"
            );
        } else {
            debug!(
                consecutive_failures = state.consecutive_failures,
                backoff_multiplier = state.backoff_multiplier,
                "Upstream failure recorded"
            );
        }
    }

    /// Honour an upstream `Retry-After`; later calls are delayed until it passes
    pub fn record_rate_limited(&self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        let mut state = self.state.lock();
        state.upstream_backoff_until = Some(state.upstream_backoff_until.map_or(until, |u| u.max(until)));
        warn!(retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX), "Upstream rate limit, delaying outbound calls");
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.state.lock().backoff_multiplier
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Spacing at `multiplier`, saturating at [`MAX_SPACING`]
    fn interval_for(&self, multiplier: f64) -> Duration {
        let secs = self.config.base_interval().as_secs_f64() * multiplier;
        Duration::try_from_secs_f64(secs).map_or(MAX_SPACING, |interval| interval.min(MAX_SPACING))
    }

    pub fn stats(&self) -> BreakerStats {
        let now = Instant::now();
        let state = self.state.lock();
        let remaining = state.open_remaining(now);

        BreakerStats {
            state: if remaining.is_some() {
                CircuitState::Open
            } else {
                CircuitState::Closed
            },
            is_open: remaining.is_some(),
            consecutive_failures: state.consecutive_failures,
            backoff_multiplier: state.backoff_multiplier,
            retry_after_seconds: remaining.map_or(0, ceil_secs),
            min_interval_ms: u64::try_from(self.interval_for(state.backoff_multiplier).as_millis())
                .unwrap_or(u64::MAX),
            trips: state.trips,
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    millis.div_ceil(1000)
}
