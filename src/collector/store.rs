//! Dedup and rate-limit backends for the event collector.
//!
//! Two implementations share the same interface: in-memory
//! for dev/standalone, Redis-backed for production. Rate-limit windows are
//! fixed, not sliding — the bucket key includes `floor(now / window_secs)`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

/// Dedup check: has this fingerprint been seen before (within its TTL)?
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn contains(&self, fingerprint: &str) -> bool;
    async fn insert(&self, fingerprint: &str, ttl_secs: u64);
}

/// Per-affiliate fixed-window rate-limit counter.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count of events accepted for `affiliate` in the current fixed
    /// window of length `window_secs`.
    async fn current_count(&self, affiliate: &str, window_secs: u64) -> u64;

    /// Atomically increments the current window's bucket for `affiliate`.
    async fn increment(&self, affiliate: &str, window_secs: u64);
}

fn window_start(window_secs: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    if window_secs == 0 {
        now
    } else {
        now / window_secs
    }
}

/// In-memory dedup + rate-limit store for dev/standalone use. Shares one
/// structure since both are simple TTL'd/windowed counters; a production
/// deployment picks the Redis implementation below instead.
#[derive(Default)]
pub struct InMemoryCollectorStore {
    fingerprints: Mutex<HashMap<String, u64>>, // fingerprint -> expiry (unix secs)
    buckets: Mutex<HashMap<(String, u64), u64>>, // (affiliate, window_start) -> count
}

#[async_trait]
impl DedupStore for InMemoryCollectorStore {
    async fn contains(&self, fingerprint: &str) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let mut fingerprints = self.fingerprints.lock().expect("dedup lock poisoned");
        match fingerprints.get(fingerprint) {
            Some(expiry) if *expiry > now => true,
            Some(_) => {
                fingerprints.remove(fingerprint);
                false
            }
            None => false,
        }
    }

    async fn insert(&self, fingerprint: &str, ttl_secs: u64) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        self.fingerprints
            .lock()
            .expect("dedup lock poisoned")
            .insert(fingerprint.to_string(), now + ttl_secs);
    }
}

#[async_trait]
impl RateLimitStore for InMemoryCollectorStore {
    async fn current_count(&self, affiliate: &str, window_secs: u64) -> u64 {
        let key = (affiliate.to_string(), window_start(window_secs));
        *self.buckets.lock().expect("rate-limit lock poisoned").get(&key).unwrap_or(&0)
    }

    async fn increment(&self, affiliate: &str, window_secs: u64) {
        let key = (affiliate.to_string(), window_start(window_secs));
        *self
            .buckets
            .lock()
            .expect("rate-limit lock poisoned")
            .entry(key)
            .or_insert(0) += 1;
    }
}

/// Redis-backed dedup + rate-limit store, suitable for production
/// deployment. Dedup uses `SET NX EX`; rate limiting uses `INCR` on a
/// window-keyed counter with `EXPIRE` set only on first increment.
#[cfg(feature = "redis")]
pub struct RedisCollectorStore {
    manager: redis::aio::ConnectionManager,
}

#[cfg(feature = "redis")]
impl RedisCollectorStore {
    pub async fn connect(host: &str, port: u16) -> redis::RedisResult<Self> {
        let client = redis::Client::open(format!("redis://{host}:{port}"))?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl DedupStore for RedisCollectorStore {
    async fn contains(&self, fingerprint: &str) -> bool {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let key = format!("collector:fingerprint:{fingerprint}");
        conn.exists(&key).await.unwrap_or(false)
    }

    async fn insert(&self, fingerprint: &str, ttl_secs: u64) {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let key = format!("collector:fingerprint:{fingerprint}");
        let _: redis::RedisResult<()> = conn.set_ex(&key, true, ttl_secs.max(1)).await;
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl RateLimitStore for RedisCollectorStore {
    async fn current_count(&self, affiliate: &str, window_secs: u64) -> u64 {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let key = format!("collector:rate:{affiliate}:{}", window_start(window_secs));
        conn.get(&key).await.unwrap_or(0)
    }

    async fn increment(&self, affiliate: &str, window_secs: u64) {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let key = format!("collector:rate:{affiliate}:{}", window_start(window_secs));
        let count: u64 = conn.incr(&key, 1u64).await.unwrap_or(0);
        if count == 1 {
            let _: redis::RedisResult<()> = conn.expire(&key, window_secs.max(1) as i64).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_fingerprint_is_not_duplicate() {
        let store = InMemoryCollectorStore::default();
        assert!(!store.contains("fp-1").await);
    }

    #[tokio::test]
    async fn inserted_fingerprint_is_duplicate_within_ttl() {
        let store = InMemoryCollectorStore::default();
        store.insert("fp-2", 60).await;
        assert!(store.contains("fp-2").await);
    }

    #[tokio::test]
    async fn expired_fingerprint_is_not_duplicate() {
        let store = InMemoryCollectorStore::default();
        store.insert("fp-3", 0).await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!store.contains("fp-3").await);
    }

    #[tokio::test]
    async fn rate_limit_increments_within_window() {
        let store = InMemoryCollectorStore::default();
        assert_eq!(store.current_count("A1", 60).await, 0);
        store.increment("A1", 60).await;
        store.increment("A1", 60).await;
        assert_eq!(store.current_count("A1", 60).await, 2);
    }

    #[tokio::test]
    async fn rate_limit_is_per_affiliate() {
        let store = InMemoryCollectorStore::default();
        store.increment("A1", 60).await;
        assert_eq!(store.current_count("A2", 60).await, 0);
    }
}
