//! Benchmarks for the dispatch hot paths

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use serde_json::json;
use spotify_access_layer::{
    AccessLayer, AccessLayerBuilder, AccessLayerConfig, ApiRequest, CacheName, HttpTransport,
    RequestError, UpstreamRequest, UpstreamResponse, async_trait,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Answers every call after a short simulated round trip
struct SlowTransport;

#[async_trait]
impl HttpTransport for SlowTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, RequestError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(UpstreamResponse::json(200, json!({"url": request.url, "is_playing": true})))
    }
}

fn setup_layer() -> (AccessLayer, Runtime) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));
    let mut config = AccessLayerConfig::default();
    config.resilience.base_interval_ms = 0;
    config.rate_limit.per_user_limit = u32::MAX;
    config.rate_limit.global_limit = u32::MAX;

    let layer = rt.block_on(async {
        AccessLayerBuilder::new()
            .with_config(config)
            .with_transport(Arc::new(SlowTransport))
            .build()
            .unwrap_or_else(|_| panic!("Failed to build access layer"))
    });
    (layer, rt)
}

/// Benchmark a cache hit, which never reaches the transport
fn bench_cache_hit(c: &mut Criterion) {
    let (layer, rt) = setup_layer();
    layer
        .cache(CacheName::CurrentPlayback)
        .set("playback:bench", json!({"is_playing": true}), Duration::from_secs(3600));

    c.bench_function("dispatch_cache_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let request = ApiRequest::get("/me/player")
                    .for_user("bench")
                    .cached(CacheName::CurrentPlayback, "playback:bench");
                black_box(
                    layer
                        .smart_request(request)
                        .await
                        .unwrap_or_else(|_| panic!("Cache hit failed")),
                )
            })
        });
    });
}

/// Benchmark 100 identical concurrent calls collapsing into one
fn bench_dedup_100_concurrent(c: &mut Criterion) {
    let (layer, rt) = setup_layer();

    c.bench_function("dispatch_dedup_100_concurrent", |b| {
        b.iter(|| {
            rt.block_on(async {
                let url = format!("/tracks/{}", rand::random::<u32>());
                let mut handles = vec![];

                for _ in 0..100 {
                    let layer = layer.clone();
                    let url = url.clone();
                    handles.push(tokio::spawn(async move {
                        layer
                            .smart_request(ApiRequest::get(url))
                            .await
                            .unwrap_or_else(|_| panic!("Request failed"))
                    }));
                }

                for handle in handles {
                    black_box(handle.await.unwrap_or_else(|_| panic!("Task failed")));
                }
            });
        });
    });
}

/// Benchmark the stats snapshot polled by the dashboard
fn bench_stats_snapshot(c: &mut Criterion) {
    let (layer, _rt) = setup_layer();

    c.bench_function("stats_snapshot", |b| {
        b.iter(|| black_box(layer.stats().to_json()));
    });
}

criterion_group!(
    benches,
    bench_cache_hit,
    bench_dedup_100_concurrent,
    bench_stats_snapshot
);
criterion_main!(benches);
