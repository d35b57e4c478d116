//! Sliding-window rate limiting.
//!
//! Each check records the event, evicts events older than the window, counts
//! what is left and, when under the limit, refreshes the key's time-to-live.
//! A [`WindowStore`] performs those steps as one atomic operation per key.
//! When the store fails the limiter admits the event.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Window store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something unexpected.
    #[error("Unexpected store reply: {0}")]
    Reply(String),
}

/// Backing store for sliding windows.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Atomically record an event at `now_ms` tagged with `token`, evict
    /// events at or before `now_ms - window_ms`, and report whether the
    /// remaining count is within `limit`. The key's expiry is refreshed to
    /// `window_ms` only when the event is admitted.
    async fn record_and_check(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
        token: &str,
    ) -> Result<bool, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Store name for logs.
    fn name(&self) -> &'static str;
}

/// Limits applied by a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Events admitted per window.
    pub limit: u64,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The event may proceed.
    Allowed,
    /// The key is over its limit.
    Rejected,
}

impl Decision {
    /// Whether the event may proceed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Sliding-window rate limiter over a shared [`WindowStore`].
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store.name())
            .field("config", &self.config)
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter.
    #[must_use]
    pub fn new(store: Arc<dyn WindowStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// The configured limits.
    #[must_use]
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    /// Check `key` against the limit at the current wall-clock time.
    pub async fn check(&self, key: &str) -> Decision {
        self.check_at(key, now_ms()).await
    }

    /// Check `key` against the limit at `now_ms` (Unix milliseconds).
    pub async fn check_at(&self, key: &str, now_ms: u64) -> Decision {
        let token = Uuid::new_v4().to_string();
        let window_ms = u64::try_from(self.config.window.as_millis()).unwrap_or(u64::MAX);

        match self
            .store
            .record_and_check(key, now_ms, window_ms, self.config.limit, &token)
            .await
        {
            Ok(true) => Decision::Allowed,
            Ok(false) => {
                debug!(key = %key, limit = self.config.limit, "Rate limit exceeded");
                Decision::Rejected
            }
            Err(e) => {
                warn!(key = %key, store = self.store.name(), error = %e, "Rate limit store failed, allowing");
                Decision::Allowed
            }
        }
    }
}

/// Current Unix time in milliseconds.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Default)]
struct Window {
    /// (timestamp, token), ordered by timestamp.
    events: VecDeque<(u64, String)>,
    expires_at: Option<u64>,
}

/// In-process window store.
///
/// Each key's update runs under the key's map-entry lock, so concurrent
/// checks on one key are serialized.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    windows: DashMap<String, Window>,
}

impl MemoryWindowStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop keys whose time-to-live has elapsed. Returns how many were removed.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, window| window.expires_at.map_or(true, |at| at > now_ms));
        before - self.windows.len()
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn record_and_check(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
        token: &str,
    ) -> Result<bool, StoreError> {
        let mut window = self.windows.entry(key.to_string()).or_default();

        // An expired key starts over, as if the store had already reclaimed it.
        if window.expires_at.is_some_and(|at| at <= now_ms) {
            *window = Window::default();
        }

        let pos = window.events.partition_point(|(ts, _)| *ts <= now_ms);
        window.events.insert(pos, (now_ms, token.to_string()));

        if let Some(cutoff) = now_ms.checked_sub(window_ms) {
            while window.events.front().is_some_and(|(ts, _)| *ts <= cutoff) {
                window.events.pop_front();
            }
        }

        if window.events.len() as u64 > limit {
            return Ok(false);
        }

        window.expires_at = Some(now_ms.saturating_add(window_ms));
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE_MS: u64 = 60_000;

    fn limiter(limit: u64) -> (RateLimiter, Arc<MemoryWindowStore>) {
        let store = Arc::new(MemoryWindowStore::new());
        let limiter = RateLimiter::new(
            store.clone(),
            RateLimitConfig {
                limit,
                window: Duration::from_secs(60),
            },
        );
        (limiter, store)
    }

    struct FailingStore;

    #[async_trait]
    impl WindowStore for FailingStore {
        async fn record_and_check(
            &self,
            _key: &str,
            _now_ms: u64,
            _window_ms: u64,
            _limit: u64,
            _token: &str,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_limit_then_recover_after_window() {
        let (limiter, _) = limiter(10);
        let start = 1_700_000_000_000;

        for i in 0..10 {
            assert_eq!(
                limiter.check_at("rate:ip:1.2.3.4", start + i * 1000).await,
                Decision::Allowed,
                "call {} should pass",
                i + 1
            );
        }
        assert_eq!(
            limiter.check_at("rate:ip:1.2.3.4", start + 10_000).await,
            Decision::Rejected
        );

        let later = start + 10_000 + MINUTE_MS;
        assert_eq!(
            limiter.check_at("rate:ip:1.2.3.4", later).await,
            Decision::Allowed
        );
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (limiter, _) = limiter(2);

        assert!(limiter.check_at("k", 0).await.is_allowed());
        assert!(limiter.check_at("k", 30_000).await.is_allowed());
        assert!(!limiter.check_at("k", 59_000).await.is_allowed());

        // The event at 0 is evicted, but the rejected one at 59s still counts.
        assert!(!limiter.check_at("k", 60_000).await.is_allowed());

        // Rejected events keep counting until the key expires, one window
        // after the last admitted event.
        assert!(!limiter.check_at("k", 89_500).await.is_allowed());
        assert!(limiter.check_at("k", 90_000).await.is_allowed());
    }

    #[tokio::test]
    async fn test_identical_timestamps_are_distinct_events() {
        let (limiter, _) = limiter(3);

        for _ in 0..3 {
            assert!(limiter.check_at("k", 5_000).await.is_allowed());
        }
        assert!(!limiter.check_at("k", 5_000).await.is_allowed());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _) = limiter(1);

        assert!(limiter.check_at("rate:user:a", 0).await.is_allowed());
        assert!(!limiter.check_at("rate:user:a", 1).await.is_allowed());
        assert!(limiter.check_at("rate:user:b", 1).await.is_allowed());
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let limiter = RateLimiter::new(Arc::new(FailingStore), RateLimitConfig::default());

        for _ in 0..50 {
            assert_eq!(limiter.check("k").await, Decision::Allowed);
        }
        assert!(limiter.store().ping().await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_reclaims_idle_keys() {
        let (limiter, store) = limiter(5);

        limiter.check_at("idle", 0).await;
        limiter.check_at("busy", 50_000).await;
        assert_eq!(store.len(), 2);

        assert_eq!(store.sweep(MINUTE_MS), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_checks_never_exceed_limit() {
        let (limiter, _) = limiter(10);
        let mut tasks = Vec::new();

        for _ in 0..50 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move {
                limiter.check_at("shared", 1_000).await
            }));
        }

        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap().is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }
}
