//! Integration tests for rate limiting, circuit breaking and backoff
//!
//! All tests run on a paused clock so windows and cooldowns are exact

mod common;

use common::*;
use spotify_access_layer::{
    ApiRequest, CircuitState, RateLimitScope, RequestError, UpstreamResponse,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, advance};

/// Three requests per ten seconds: the fourth is denied, and denials keep counting
#[tokio::test(start_paused = true)]
async fn test_per_user_rate_limit_window() {
    let transport = Arc::new(MockTransport::ok(serde_json::json!({"ok": true})));
    let mut config = test_config();
    config.rate_limit.per_user_limit = 3;
    config.rate_limit.window_ms = 10_000;
    let layer = setup_layer(config, Arc::clone(&transport));

    let call = || layer.smart_request(ApiRequest::get("/me").for_user("u1").without_dedup());

    for i in 0..3 {
        call()
            .await
            .unwrap_or_else(|e| panic!("Request {i} should be allowed: {e}"));
    }

    let err = must_fail(call().await, "Fourth request must be limited");
    assert_eq!(
        err,
        RequestError::RateLimited {
            retry_after_secs: 10,
            scope: RateLimitScope::User,
        }
    );

    advance(Duration::from_secs(2)).await;
    let err = must_fail(call().await, "Still inside the window");
    assert_eq!(err.retry_after(), Some(Duration::from_secs(8)));
    assert_eq!(transport.calls(), 3, "Denied calls never reach the network");

    let status = layer.rate_status("u1");
    assert!(!status.allowed);
    assert_eq!(status.request_count, 5);
    assert_eq!(status.remaining, 0);

    // Another user is unaffected
    layer
        .smart_request(ApiRequest::get("/me").for_user("u2").without_dedup())
        .await
        .unwrap_or_else(|e| panic!("Other user should be allowed: {e}"));

    advance(Duration::from_secs(9)).await;
    call()
        .await
        .unwrap_or_else(|e| panic!("New window should allow the call: {e}"));
    assert_eq!(layer.rate_status("u1").remaining, 2);
}

/// The global ceiling applies across users
#[tokio::test(start_paused = true)]
async fn test_global_rate_limit() {
    let transport = Arc::new(MockTransport::ok(serde_json::json!({})));
    let mut config = test_config();
    config.rate_limit.global_limit = 2;
    let layer = setup_layer(config, Arc::clone(&transport));

    for user in ["a", "b"] {
        layer
            .smart_request(ApiRequest::get("/me").for_user(user).without_dedup())
            .await
            .unwrap_or_else(|e| panic!("{user} should be allowed: {e}"));
    }

    let err = must_fail(
        layer
            .smart_request(ApiRequest::get("/me").for_user("c").without_dedup())
            .await,
        "Global ceiling must deny",
    );
    match err {
        RequestError::RateLimited { scope, retry_after_secs } => {
            assert_eq!(scope, RateLimitScope::Global);
            assert!(retry_after_secs >= 1);
        }
        other => panic!("Expected RateLimited, got {other:?}"),
    }

    // Calls without a user identity are not rate limited
    layer
        .smart_request(ApiRequest::get("/browse/new-releases"))
        .await
        .unwrap_or_else(|e| panic!("Anonymous call should pass: {e}"));
}

/// Two failures open the breaker; one second later callers get 59s without a network call
#[tokio::test(start_paused = true)]
async fn test_circuit_opens_and_fails_fast() {
    let transport = Arc::new(
        MockTransport::ok(serde_json::json!({"ok": true}))
            .then(server_error())
            .then(server_error()),
    );
    let mut config = test_config();
    config.resilience.failure_threshold = 2;
    config.resilience.cooldown_ms = 60_000;
    let layer = setup_layer(config, Arc::clone(&transport));

    for _ in 0..2 {
        let err = must_fail(
            layer.smart_request(ApiRequest::get("/me/player").without_dedup()).await,
            "Scripted 500 must fail",
        );
        assert!(
            matches!(err, RequestError::UpstreamFailure { status: Some(500), .. }),
            "got {err:?}"
        );
    }
    assert!(!layer.health_check());
    assert_eq!(layer.dispatcher().parts().resilience.state(), CircuitState::Open);

    advance(Duration::from_secs(1)).await;
    let err = must_fail(
        layer.smart_request(ApiRequest::get("/me/player").without_dedup()).await,
        "Open circuit must fail fast",
    );
    assert_eq!(err, RequestError::CircuitOpen { retry_after_secs: 59 });
    assert_eq!(transport.calls(), 2, "Open circuit must not reach the network");

    let stats = layer.stats().circuit_breaker;
    assert!(stats.is_open);
    assert_eq!(stats.retry_after_seconds, 59);
    assert_eq!(stats.consecutive_failures, 2);
    assert_eq!(stats.trips, 1);

    // After the cooldown the next call goes through and closes the circuit
    advance(Duration::from_secs(60)).await;
    layer
        .smart_request(ApiRequest::get("/me/player").without_dedup())
        .await
        .unwrap_or_else(|e| panic!("Call after cooldown should succeed: {e}"));

    assert!(layer.health_check());
    let stats = layer.stats().circuit_breaker;
    assert_eq!(stats.consecutive_failures, 0);
    assert!((stats.backoff_multiplier - 2.0).abs() < f64::EPSILON);
}

/// Connection-level failures count against the breaker like 5xx
#[tokio::test(start_paused = true)]
async fn test_transport_errors_trip_breaker() {
    let transport = Arc::new(MockTransport::with_fallback(Err(RequestError::Transport(
        "connection reset by peer".to_string(),
    ))));
    let mut config = test_config();
    config.resilience.failure_threshold = 1;
    let layer = setup_layer(config, Arc::clone(&transport));

    let err = must_fail(
        layer.smart_request(ApiRequest::get("/me").without_dedup()).await,
        "Transport error must fail",
    );
    assert!(err.is_retryable());

    let err = must_fail(
        layer.smart_request(ApiRequest::get("/me").without_dedup()).await,
        "Breaker must be open",
    );
    assert!(matches!(err, RequestError::CircuitOpen { .. }), "got {err:?}");
    assert_eq!(transport.calls(), 1);
}

/// Spacing between calls doubles with each failure
#[tokio::test(start_paused = true)]
async fn test_backoff_spacing_grows_with_failures() {
    let transport = Arc::new(MockTransport::with_fallback(server_error()));
    let mut config = test_config();
    config.resilience.base_interval_ms = 100;
    config.resilience.failure_threshold = 10;
    let layer = setup_layer(config, Arc::clone(&transport));

    let call = || layer.smart_request(ApiRequest::get("/me/player").without_dedup());

    // Slot 0ms, multiplier 1 -> 2
    let _ = call().await;
    // Slot 200ms, multiplier 2 -> 4
    let _ = call().await;

    let started = Instant::now();
    let _ = call().await;
    assert!(
        started.elapsed() >= Duration::from_millis(400),
        "Third call should wait 400ms, waited {:?}",
        started.elapsed()
    );

    let stats = layer.stats().circuit_breaker;
    assert!((stats.backoff_multiplier - 8.0).abs() < f64::EPSILON);
    assert_eq!(stats.min_interval_ms, 800);
}

/// Upstream 429 is reported to the caller and delays later calls without tripping the breaker
#[tokio::test(start_paused = true)]
async fn test_upstream_rate_limit_delays_calls() {
    let transport = Arc::new(
        MockTransport::ok(serde_json::json!({"ok": true})).then(Ok(
            UpstreamResponse::empty(429).with_retry_after(Duration::from_secs(5)),
        )),
    );
    let mut config = test_config();
    config.resilience.failure_threshold = 1;
    let layer = setup_layer(config, Arc::clone(&transport));

    let err = must_fail(
        layer.smart_request(ApiRequest::get("/me").without_dedup()).await,
        "429 must fail",
    );
    assert_eq!(
        err,
        RequestError::RateLimited {
            retry_after_secs: 5,
            scope: RateLimitScope::Upstream,
        }
    );
    assert!(layer.health_check(), "429 must not open the breaker");

    let started = Instant::now();
    layer
        .smart_request(ApiRequest::get("/me").without_dedup())
        .await
        .unwrap_or_else(|e| panic!("Delayed call should succeed: {e}"));
    assert!(started.elapsed() >= Duration::from_secs(5));
}

/// A 429 without Retry-After still backs off for one second
#[tokio::test(start_paused = true)]
async fn test_upstream_rate_limit_default_delay() {
    let transport = Arc::new(
        MockTransport::ok(serde_json::json!({})).then(Ok(UpstreamResponse::empty(429))),
    );
    let layer = setup_layer(test_config(), Arc::clone(&transport));

    let err = must_fail(
        layer.smart_request(ApiRequest::get("/me").without_dedup()).await,
        "429 must fail",
    );
    assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));

    let started = Instant::now();
    layer
        .smart_request(ApiRequest::get("/me").without_dedup())
        .await
        .unwrap_or_else(|e| panic!("Delayed call should succeed: {e}"));
    assert!(started.elapsed() >= Duration::from_secs(1));
}

/// Calls queued behind a failing call fail fast once it opens the breaker
#[tokio::test(start_paused = true)]
async fn test_queued_calls_fail_fast_when_breaker_opens() {
    let transport = Arc::new(
        MockTransport::with_fallback(server_error()).with_delay(Duration::from_millis(50)),
    );
    let mut config = test_config();
    config.pool.max_concurrent = 1;
    config.resilience.failure_threshold = 1;
    let layer = setup_layer(config, Arc::clone(&transport));

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..3 {
        let layer = layer.clone();
        tasks.spawn(async move { layer.smart_request(ApiRequest::get(format!("/tracks/{i}"))).await });
    }

    let mut upstream_failures = 0;
    let mut circuit_open = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap_or_else(|_| panic!("Task panicked")) {
            Err(RequestError::UpstreamFailure { .. }) => upstream_failures += 1,
            Err(RequestError::CircuitOpen { .. }) => circuit_open += 1,
            other => panic!("Unexpected outcome {other:?}"),
        }
    }

    assert_eq!(transport.calls(), 1, "Queued calls must not reach the network");
    assert_eq!(upstream_failures, 1);
    assert_eq!(circuit_open, 2);

    let stats = layer.stats();
    assert_eq!(stats.circuit_breaker.trips, 1);
    // Calls turned away after queueing are neither completed nor failed
    assert_eq!(stats.connection_pool.failed_requests, 1);
    assert_eq!(stats.connection_pool.completed_requests, 0);
    assert_eq!(stats.connection_pool.active_requests, 0);
}
