//! Cache (C9): two-tier, read-through, TTL-bound memoisation for hot read
//! endpoints (spec §4.9) — an in-process L1 backed by an optional shared L2
//! in Redis, so a single-process deployment still gets the L1 win and a
//! multi-process one shares cached computations across workers.

pub mod key;
mod memory;
mod redis;

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use key::build_key;
pub use memory::InMemoryCache;
pub use redis::RedisCache;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Read-through cache over a caller-provided compute closure. A miss at
/// every tier, or a tier backend error, degrades straight to calling
/// `compute` — cache infrastructure is never allowed to turn into a caller
/// error (spec §4.9).
pub struct Cache {
    l1: InMemoryCache,
    l2: Option<RedisCache>,
}

impl Cache {
    pub fn new(l2: Option<RedisCache>) -> Self {
        Self { l1: InMemoryCache::new(), l2 }
    }

    pub fn in_memory_only() -> Self {
        Self::new(None)
    }

    pub fn with_redis(pool: deadpool_redis::Pool) -> Self {
        Self::new(Some(RedisCache::new(pool)))
    }

    /// Look up `key`, falling through L1 -> L2 -> `compute`, populating
    /// every tier above the one that satisfied the request.
    pub async fn get_or_compute<T, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(cached) = self.l1.get(key) {
            if let Ok(value) = serde_json::from_value(cached) {
                return value;
            }
        }

        if let Some(l2) = &self.l2 {
            if let Some(cached) = l2.get(key).await {
                if let Ok(value) = serde_json::from_value::<T>(cached.clone()) {
                    self.l1.set(key.to_string(), cached, ttl);
                    return value;
                }
            }
        }

        let computed = compute().await;
        if let Ok(value) = serde_json::to_value(&computed) {
            self.l1.set(key.to_string(), value.clone(), ttl);
            if let Some(l2) = &self.l2 {
                l2.set(key, &value, ttl).await;
            }
        }
        computed
    }

    /// Invalidate by full key, `<module>:<endpoint>:*`, or `<module>:*`
    /// (spec §4.9 "Invalidation modes").
    pub async fn invalidate(&self, pattern: &str) {
        self.l1.invalidate(pattern);
        if let Some(l2) = &self.l2 {
            l2.invalidate(pattern).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn recomputes_on_miss_then_serves_from_l1_on_hit() {
        let cache = Cache::in_memory_only();
        let calls = Arc::new(AtomicUsize::new(0));

        let compute = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            42u32
        };

        let key = build_key("monitor", "metrics", &[]);
        let first = cache.get_or_compute(&key, Duration::from_secs(60), || compute(calls.clone())).await;
        let second = cache.get_or_compute(&key, Duration::from_secs(60), || compute(calls.clone())).await;

        assert_eq!(first, 42);
        assert_eq!(second, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_recompute() {
        let cache = Cache::in_memory_only();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = build_key("monitor", "metrics", &[]);

        cache
            .get_or_compute(&key, Duration::from_secs(60), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    1u32
                }
            })
            .await;
        cache.invalidate("monitor:metrics:*").await;
        cache
            .get_or_compute(&key, Duration::from_secs(60), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    1u32
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
