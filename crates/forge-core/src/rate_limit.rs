//! Fixed-window rate limiting, keyed by `(userId, route, floor(now/window))`.
//!
//! The null-byte separator in the cache key is load-bearing: identifiers
//! containing `:` must not be able to collide across the (userId, route)
//! boundary (spec property: rate-limit key isolation).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_secs: u64,
}

impl RateDecision {
    fn allow() -> Self {
        RateDecision {
            allowed: true,
            retry_after_secs: 0,
        }
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, user_id: &str, route: &str) -> RateDecision;
}

fn cache_key(user_id: &str, route: &str) -> String {
    format!("{user_id}\0{route}")
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs()
}

/// `max_requests == 0` means the limiter is disabled: every call is allowed.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u64,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max_requests: 60,
            window_secs: 60,
        }
    }
}

struct WindowEntry {
    count: u64,
    window_start: u64,
}

/// In-process map backend. Stale entries are removed on a new window to
/// prevent unbounded growth of the map.
pub struct InProcessRateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, WindowEntry>>,
}

impl InProcessRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        InProcessRateLimiter {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateLimiter for InProcessRateLimiter {
    async fn check(&self, user_id: &str, route: &str) -> RateDecision {
        if self.config.max_requests == 0 {
            return RateDecision::allow();
        }
        let key = cache_key(user_id, route);
        let now = now_secs();
        let window_start = (now / self.config.window_secs) * self.config.window_secs;

        let mut windows = self.windows.lock();
        let entry = windows.get_mut(&key);
        let count = match entry {
            Some(entry) if entry.window_start == window_start => {
                entry.count += 1;
                entry.count
            }
            _ => {
                windows.insert(
                    key,
                    WindowEntry {
                        count: 1,
                        window_start,
                    },
                );
                1
            }
        };

        if count > self.config.max_requests {
            let next_boundary = window_start + self.config.window_secs;
            let retry_after = next_boundary.saturating_sub(now).max(1);
            RateDecision {
                allowed: false,
                retry_after_secs: retry_after,
            }
        } else {
            RateDecision::allow()
        }
    }
}

/// Atomic counter backend: first write for a window sets the value with a
/// TTL of one window length (native expiry); subsequent writes in the same
/// window are atomic increments. Suits a shared keyed store (e.g. Redis)
/// across multiple sidecar processes.
#[async_trait]
pub trait KeyedCounterStore: Send + Sync {
    /// Atomically increments `key`, setting a TTL of `ttl_secs` only if this
    /// call created the key. Returns the post-increment count.
    async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> anyhow::Result<u64>;
}

pub struct SharedKeyedRateLimiter<S: KeyedCounterStore> {
    config: RateLimitConfig,
    store: S,
}

impl<S: KeyedCounterStore> SharedKeyedRateLimiter<S> {
    pub fn new(config: RateLimitConfig, store: S) -> Self {
        SharedKeyedRateLimiter { config, store }
    }
}

#[async_trait]
impl<S: KeyedCounterStore> RateLimiter for SharedKeyedRateLimiter<S> {
    async fn check(&self, user_id: &str, route: &str) -> RateDecision {
        if self.config.max_requests == 0 {
            return RateDecision::allow();
        }
        let now = now_secs();
        let window_start = (now / self.config.window_secs) * self.config.window_secs;
        let key = format!("{}\0w={window_start}", cache_key(user_id, route));

        let count = match self.store.incr_with_ttl(&key, self.config.window_secs).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "rate limiter store error, failing open");
                return RateDecision::allow();
            }
        };

        if count > self.config.max_requests {
            let next_boundary = window_start + self.config.window_secs;
            let retry_after = next_boundary.saturating_sub(now).max(1);
            RateDecision {
                allowed: false,
                retry_after_secs: retry_after,
            }
        } else {
            RateDecision::allow()
        }
    }
}

#[cfg(feature = "redis-backend")]
pub mod redis_backend {
    use super::KeyedCounterStore;
    use async_trait::async_trait;
    use redis::AsyncCommands;

    pub struct RedisCounterStore {
        client: redis::Client,
    }

    impl RedisCounterStore {
        pub fn new(url: &str) -> anyhow::Result<Self> {
            Ok(RedisCounterStore {
                client: redis::Client::open(url)?,
            })
        }
    }

    #[async_trait]
    impl KeyedCounterStore for RedisCounterStore {
        async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> anyhow::Result<u64> {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let count: u64 = conn.incr(key, 1u64).await?;
            if count == 1 {
                let _: () = conn.expire(key, ttl_secs as i64).await?;
            }
            Ok(count)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn key_isolation_across_separators() {
        let limiter = InProcessRateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window_secs: 60,
        });
        // "a:x" as user with route "chat" vs user "a" with route "x:chat"
        // must not collide despite both containing a colon.
        let d1 = limiter.check("a:x", "chat").await;
        let d2 = limiter.check("a", "x:chat").await;
        assert!(d1.allowed);
        assert!(d2.allowed);
    }

    #[tokio::test]
    async fn blocks_over_cap_with_retry_after() {
        let limiter = InProcessRateLimiter::new(RateLimitConfig {
            max_requests: 2,
            window_secs: 60,
        });
        assert!(limiter.check("u", "chat").await.allowed);
        assert!(limiter.check("u", "chat").await.allowed);
        let third = limiter.check("u", "chat").await;
        assert!(!third.allowed);
        assert!(third.retry_after_secs >= 1 && third.retry_after_secs <= 60);
    }

    #[tokio::test]
    async fn disabled_limiter_always_allows() {
        let limiter = InProcessRateLimiter::new(RateLimitConfig {
            max_requests: 0,
            window_secs: 60,
        });
        for _ in 0..10 {
            assert!(limiter.check("u", "chat").await.allowed);
        }
    }
}
