//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - A scripted in-memory transport
//! - Access layer setup helpers
//! - Test data generators

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use spotify_access_layer::{
    AccessLayer, AccessLayerBuilder, AccessLayerConfig, HttpTransport, RequestError,
    UpstreamRequest, UpstreamResponse, async_trait,
};

/// Transport that replays scripted responses and records every request
///
/// Scripted responses are consumed in order; once exhausted, the fallback
/// response is returned for every call.
pub struct MockTransport {
    script: Mutex<VecDeque<Result<UpstreamResponse, RequestError>>>,
    fallback: Result<UpstreamResponse, RequestError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    requests: Mutex<Vec<UpstreamRequest>>,
}

impl MockTransport {
    /// Every call answers `200` with `body`
    pub fn ok(body: serde_json::Value) -> Self {
        Self::with_fallback(Ok(UpstreamResponse::json(200, body)))
    }

    pub fn with_fallback(fallback: Result<UpstreamResponse, RequestError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a one-off response ahead of the fallback
    #[must_use]
    pub fn then(self, response: Result<UpstreamResponse, RequestError>) -> Self {
        self.script.lock().push_back(response);
        self
    }

    /// Simulated network latency per call
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, RequestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Defaults with no spacing between calls, so tests only wait when they ask to
pub fn test_config() -> AccessLayerConfig {
    let mut config = AccessLayerConfig::default();
    config.resilience.base_interval_ms = 0;
    config
}

/// Build an access layer around `transport`
pub fn setup_layer(config: AccessLayerConfig, transport: Arc<MockTransport>) -> AccessLayer {
    spotify_access_layer::init_tracing();
    AccessLayerBuilder::new()
        .with_config(config)
        .with_transport(transport)
        .build()
        .unwrap_or_else(|e| panic!("Failed to build access layer: {e}"))
}

/// Create a unique user id so tests never share rate-limit state by accident
pub fn test_user(name: &str) -> String {
    format!("user_{}_{}", name, rand::random::<u32>())
}

/// Generate test data of various types
pub mod test_data {
    use serde_json::{Value, json};

    pub fn playback(track: &str, is_playing: bool) -> Value {
        json!({
            "is_playing": is_playing,
            "progress_ms": 42_000,
            "item": { "id": track, "name": format!("Track {track}"), "duration_ms": 215_000 },
            "device": { "id": "device-1", "name": "Kitchen" }
        })
    }

    pub fn queue(tracks: &[&str]) -> Value {
        json!({
            "currently_playing": { "id": tracks.first().copied().unwrap_or_default() },
            "queue": tracks.iter().skip(1).map(|id| json!({ "id": id })).collect::<Vec<_>>()
        })
    }

    pub fn profile(id: &str) -> Value {
        json!({
            "id": id,
            "display_name": format!("User {id}"),
            "product": "premium"
        })
    }
}

/// Unwrap the error of a call that must fail
pub fn must_fail<T: std::fmt::Debug>(result: Result<T, RequestError>, context: &str) -> RequestError {
    match result {
        Ok(value) => panic!("{context}: got Ok({value:?})"),
        Err(err) => err,
    }
}

/// Convenience for scripted server errors
pub fn server_error() -> Result<UpstreamResponse, RequestError> {
    Ok(UpstreamResponse::json(
        500,
        serde_json::json!({"error": {"status": 500, "message": "Server error"}}),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_generation() {
        let user1 = test_user("alice");
        let user2 = test_user("alice");
        assert_ne!(user1, user2, "User ids should be unique");
        assert!(user1.starts_with("user_alice_"));
    }

    #[test]
    fn test_data_generation() {
        let playback = test_data::playback("t1", true);
        assert_eq!(playback["item"]["id"], "t1");
        assert_eq!(test_data::queue(&["a", "b", "c"])["queue"].as_array().map(Vec::len), Some(2));
    }
}
