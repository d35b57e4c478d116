//! Rate-limit window stores.
//!
//! [`RedisWindowStore`] keeps each key's window in a sorted set and runs the
//! record/evict/count/expire steps as one Lua script, so every server sharing
//! the Redis instance sees the same windows. After a failed connect or call
//! the store reports itself unavailable for [`RECONNECT_BACKOFF`] instead of
//! dialing again, so the limiter fails open without waiting.

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use relay_core::{MemoryWindowStore, StoreError, WindowStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{StoreBackend, StoreConfig};

/// KEYS[1] = window key, ARGV = now_ms, window_ms, limit, token.
/// Returns 1 when admitted, 0 when over the limit.
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
redis.call("ZADD", KEYS[1], ARGV[1], ARGV[4])
redis.call("ZREMRANGEBYSCORE", KEYS[1], 0, ARGV[1] - ARGV[2])
local count = redis.call("ZCARD", KEYS[1])
if count > tonumber(ARGV[3]) then
    return 0
end
redis.call("PEXPIRE", KEYS[1], ARGV[2])
return 1
"#;

/// How long to stop dialing Redis after a failure.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Link {
    conn: Option<MultiplexedConnection>,
    retry_after: Option<Instant>,
}

/// Sliding windows held in Redis.
pub struct RedisWindowStore {
    client: Client,
    script: Script,
    timeout: Duration,
    // Never held across an await on Redis.
    link: Mutex<Link>,
}

impl RedisWindowStore {
    /// Create a store for `url`. No connection is made until first use.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if `url` is not a Redis URL.
    pub fn open(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(unavailable)?;
        Ok(Self {
            client,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
            timeout,
            link: Mutex::new(Link::default()),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        {
            let link = self.link.lock().await;
            if let Some(conn) = &link.conn {
                return Ok(conn.clone());
            }
            if link.retry_after.is_some_and(|at| Instant::now() < at) {
                return Err(StoreError::Unavailable(
                    "backing off after a failed connection".to_string(),
                ));
            }
        }

        match self
            .bounded(self.client.get_multiplexed_async_connection())
            .await
        {
            Ok(conn) => {
                let mut link = self.link.lock().await;
                link.retry_after = None;
                // Concurrent dials may race; the first one stored wins.
                let conn = link.conn.get_or_insert(conn).clone();
                debug!("Connected to Redis");
                Ok(conn)
            }
            Err(e) => {
                self.reset().await;
                Err(e)
            }
        }
    }

    /// Forget the cached connection and hold off reconnecting for
    /// [`RECONNECT_BACKOFF`].
    async fn reset(&self) {
        let mut link = self.link.lock().await;
        if link.conn.take().is_some() || link.retry_after.is_none() {
            warn!(backoff = ?RECONNECT_BACKOFF, "Redis unavailable, backing off");
        }
        link.retry_after = Some(Instant::now() + RECONNECT_BACKOFF);
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(unavailable),
            Err(_) => Err(StoreError::Unavailable(format!(
                "timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn record_and_check(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
        token: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let mut invocation = self.script.key(key);
        invocation.arg(now_ms).arg(window_ms).arg(limit).arg(token);

        let result: Result<i64, StoreError> =
            self.bounded(invocation.invoke_async(&mut conn)).await;
        match result {
            Ok(1) => Ok(true),
            Ok(0) => Ok(false),
            Ok(other) => Err(StoreError::Reply(other.to_string())),
            Err(e) => {
                self.reset().await;
                Err(e)
            }
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let cmd = redis::cmd("PING");
        let result: Result<String, StoreError> = self.bounded(cmd.query_async(&mut conn)).await;
        match result {
            Ok(reply) if reply == "PONG" => Ok(()),
            Ok(reply) => Err(StoreError::Reply(reply)),
            Err(e) => {
                self.reset().await;
                Err(e)
            }
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

fn unavailable(e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Build the configured store. The in-memory store gets a background sweeper.
///
/// # Errors
///
/// Returns an error if the Redis URL is invalid.
pub fn build_store(config: &StoreConfig) -> Result<Arc<dyn WindowStore>> {
    match config.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryWindowStore::new());
            spawn_sweeper(
                Arc::clone(&store),
                Duration::from_secs(config.sweep_interval_secs.max(1)),
            );
            info!("Rate-limit windows kept in memory");
            Ok(store)
        }
        StoreBackend::Redis => {
            let store = RedisWindowStore::open(
                &config.redis_url,
                Duration::from_millis(config.timeout_ms),
            )?;
            info!(url = %config.redis_url, "Rate-limit windows kept in Redis");
            Ok(Arc::new(store))
        }
    }
}

/// Periodically drop in-memory windows whose expiry has passed. The task
/// stops once the store has no other owners.
pub fn spawn_sweeper(store: Arc<MemoryWindowStore>, every: Duration) -> tokio::task::JoinHandle<()> {
    let store = Arc::downgrade(&store);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(store) = store.upgrade() else {
                break;
            };
            let removed = store.sweep(relay_core::ratelimit::now_ms());
            if removed > 0 {
                debug!(removed, remaining = store.len(), "Swept expired rate-limit windows");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{Decision, RateLimitConfig, RateLimiter};
    use tokio::net::TcpListener;

    // Nothing listens on port 1.
    const DEAD_REDIS: &str = "redis://127.0.0.1:1/";

    #[test]
    fn test_open_rejects_bad_url() {
        let result = RedisWindowStore::open("http://localhost", Duration::from_millis(100));
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_open() {
        let store = RedisWindowStore::open(DEAD_REDIS, Duration::from_millis(500)).unwrap();
        let limiter = RateLimiter::new(
            Arc::new(store),
            RateLimitConfig {
                limit: 1,
                window: Duration::from_secs(60),
            },
        );

        for _ in 0..3 {
            assert_eq!(limiter.check("rate:ip:10.0.0.1").await, Decision::Allowed);
        }
    }

    #[tokio::test]
    async fn test_silent_redis_does_not_queue_checks() {
        // Accepts connections and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let store =
            RedisWindowStore::open(&format!("redis://{}/", addr), Duration::from_millis(300))
                .unwrap();
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(store),
            RateLimitConfig {
                limit: 1,
                window: Duration::from_secs(60),
            },
        ));

        let started = std::time::Instant::now();
        let checks: Vec<_> = (0..8)
            .map(|i| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.check(&format!("rate:ip:10.0.0.{}", i)).await })
            })
            .collect();
        for check in checks {
            assert_eq!(check.await.unwrap(), Decision::Allowed);
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        // Backing off: the next check does not dial again.
        let started = std::time::Instant::now();
        assert_eq!(limiter.check("rate:ip:10.0.0.99").await, Decision::Allowed);
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_expires() {
        let store = RedisWindowStore::open(DEAD_REDIS, Duration::from_millis(500)).unwrap();
        store.reset().await;
        assert!(matches!(
            store.connection().await,
            Err(StoreError::Unavailable(reason)) if reason.contains("backing off")
        ));

        tokio::time::advance(RECONNECT_BACKOFF + Duration::from_millis(10)).await;
        let link = store.link.lock().await;
        assert!(link.retry_after.is_some_and(|at| Instant::now() >= at));
    }

    #[tokio::test]
    async fn test_unreachable_redis_ping_fails() {
        let store = RedisWindowStore::open(DEAD_REDIS, Duration::from_millis(500)).unwrap();
        assert!(store.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_build_memory_store() {
        let store = build_store(&StoreConfig::default()).unwrap();
        assert_eq!(store.name(), "memory");
        store.ping().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_with_store() {
        let store = Arc::new(MemoryWindowStore::new());
        store
            .record_and_check("k", 0, 1_000, 10, "t")
            .await
            .unwrap();

        let task = spawn_sweeper(Arc::clone(&store), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(store.is_empty());

        drop(store);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(task.is_finished());
    }
}
