//! Latency benchmarks for Relay.
//!
//! These measure the path a message takes through the running hub task and
//! the connection pumps.

use criterion::{criterion_group, criterion_main, Criterion};
use relay_bench::direct_message;
use relay_core::{Hub, HubConfig, MemoryWindowStore, RateLimitConfig, RateLimiter};
use relay_transport::{memory, pump};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

/// Handle -> hub task -> outbound queue.
fn bench_hub_round_trip(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("hub_round_trip");

    group.bench_function("direct", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let (hub, task) = Hub::spawn(&HubConfig::default());
                let (_key, mut queue) = hub.connect("user-0").await.unwrap();
                let envelope = direct_message("user-0", 64);

                let start = Instant::now();
                for _ in 0..iters {
                    hub.route(envelope.clone()).await.unwrap();
                    queue.recv().await.unwrap();
                }
                let elapsed = start.elapsed();

                hub.shutdown().await.unwrap();
                task.await.unwrap();
                elapsed
            })
        });
    });

    group.finish();
}

/// Raw client text -> read pump -> hub -> write pump -> client.
fn bench_pump_round_trip(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("pump_round_trip");
    let frame = r#"{"event":"msg","receiver_id":"self","receiver_type":"user","data":{"text":"hello"}}"#;

    group.bench_function("echo_to_self", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let (hub, task) = Hub::spawn(&HubConfig::default());
                let (mut client, source, sink) = memory::connection();
                let served = tokio::spawn(pump::serve_connection(
                    hub.clone(),
                    "self",
                    source,
                    sink,
                    pump::DEFAULT_WRITE_TIMEOUT,
                ));
                while hub.stats().await.unwrap().connections == 0 {
                    tokio::task::yield_now().await;
                }

                let start = Instant::now();
                for _ in 0..iters {
                    client.send_text(frame);
                    client.recv().await.unwrap();
                }
                let elapsed = start.elapsed();

                client.hang_up();
                served.await.unwrap().unwrap();
                hub.shutdown().await.unwrap();
                task.await.unwrap();
                elapsed
            })
        });
    });

    group.finish();
}

/// One rate-limit check against the in-memory store.
fn bench_rate_limit_check(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("rate_limit_check");

    let limiter = RateLimiter::new(
        Arc::new(MemoryWindowStore::new()),
        RateLimitConfig {
            limit: 100,
            window: Duration::from_secs(60),
        },
    );

    group.bench_function("memory_store", |b| {
        let mut now = 0u64;
        b.iter(|| {
            now += 1_000;
            rt.block_on(limiter.check_at("rate:ip:10.0.0.1", now))
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_hub_round_trip,
    bench_pump_round_trip,
    bench_rate_limit_check
);
criterion_main!(benches);
