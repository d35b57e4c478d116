//! End-to-end throughput benchmark for Relay.
//!
//! Connects pairs of clients to a running server; each client streams direct
//! messages to its partner. Reports delivered messages per second and how
//! many clients the server dropped as slow consumers.
//!
//! ```bash
//! RELAY__AUTH__JWT_SECRET=change-me cargo run --release -p relay-server &
//! RELAY__AUTH__JWT_SECRET=change-me cargo run --release -p relay-bench --bin e2e_throughput 32
//! ```

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Serialize)]
struct Claims {
    user_id: String,
    exp: u64,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args
        .get(1)
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(16)
        .max(2)
        & !1;
    let url = std::env::var("RELAY_URL").unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string());
    let secret = std::env::var("RELAY__AUTH__JWT_SECRET")
        .map_err(|_| "RELAY__AUTH__JWT_SECRET must match the server's secret")?;

    println!("Relay end-to-end throughput: {} clients against {}", num_clients, url);
    println!("Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);

    let received = Arc::new(AtomicU64::new(0));
    let live = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::with_capacity(num_clients);
    for client_id in 0..num_clients {
        let token = token(&secret, client_id)?;
        let url = format!("{}?token={}", url, token);
        let received = Arc::clone(&received);
        let live = Arc::clone(&live);
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(client_id, url, received, live, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        }));
    }

    barrier.wait().await;
    println!("All {} clients connected", num_clients);

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;
    received.store(0, Ordering::SeqCst);
    let start = Instant::now();

    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = received.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("Duration:        {:>10.2}s", elapsed.as_secs_f64());
    println!("Delivered:       {:>10}", total);
    println!("Throughput:      {:>10.0} msg/s", per_sec);
    println!("Per client:      {:>10.0} msg/s", per_sec / num_clients as f64);
    println!(
        "Still connected: {:>10} of {}",
        live.load(Ordering::SeqCst),
        num_clients
    );

    for handle in handles {
        handle.abort();
    }
    Ok(())
}

fn token(secret: &str, client_id: usize) -> Result<String, BoxError> {
    let exp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() + 3600;
    let claims = Claims {
        user_id: format!("bench-{}", client_id),
        exp,
    };
    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

async fn run_client(
    client_id: usize,
    url: String,
    received: Arc<AtomicU64>,
    live: Arc<AtomicUsize>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();
    live.fetch_add(1, Ordering::SeqCst);

    barrier.wait().await;

    let partner = format!("bench-{}", client_id ^ 1);
    let frame = json!({
        "event": "bench",
        "receiver_id": partner,
        "receiver_type": "user",
        "data": { "text": "x".repeat(64) },
    })
    .to_string();

    let recv_live = Arc::clone(&live);
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Text(_) = message {
                received.fetch_add(1, Ordering::Relaxed);
            }
        }
        recv_live.fetch_sub(1, Ordering::SeqCst);
    });

    loop {
        if sender.send(Message::Text(frame.clone())).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
