//! In-process L1 cache tier: a `DashMap` with per-entry expiry.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::key::InvalidationTarget;

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryCache {
    entries: DashMap<String, Entry>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn set(&self, key: String, value: serde_json::Value, ttl: Duration) {
        self.entries.insert(key, Entry { value, expires_at: Instant::now() + ttl });
    }

    pub fn invalidate(&self, pattern: &str) {
        match InvalidationTarget::parse(pattern) {
            InvalidationTarget::Key(key) => {
                self.entries.remove(&key);
            }
            InvalidationTarget::Prefix(prefix) => {
                self.entries.retain(|key, _| !key.starts_with(&prefix));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get_round_trips() {
        let cache = InMemoryCache::new();
        cache.set("monitor:metrics:".to_string(), json!({"ok": true}), Duration::from_secs(60));
        assert_eq!(cache.get("monitor:metrics:"), Some(json!({"ok": true})));
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let cache = InMemoryCache::new();
        cache.set("k".to_string(), json!(1), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn invalidate_by_full_key() {
        let cache = InMemoryCache::new();
        cache.set("monitor:metrics:a=1".to_string(), json!(1), Duration::from_secs(60));
        cache.invalidate("monitor:metrics:a=1");
        assert_eq!(cache.get("monitor:metrics:a=1"), None);
    }

    #[test]
    fn invalidate_by_endpoint_prefix_leaves_other_endpoints() {
        let cache = InMemoryCache::new();
        cache.set("monitor:metrics:a=1".to_string(), json!(1), Duration::from_secs(60));
        cache.set("monitor:settings:a=1".to_string(), json!(1), Duration::from_secs(60));
        cache.invalidate("monitor:metrics:*");
        assert_eq!(cache.get("monitor:metrics:a=1"), None);
        assert!(cache.get("monitor:settings:a=1").is_some());
    }

    #[test]
    fn invalidate_by_module_prefix_clears_every_endpoint() {
        let cache = InMemoryCache::new();
        cache.set("monitor:metrics:a=1".to_string(), json!(1), Duration::from_secs(60));
        cache.set("monitor:settings:a=1".to_string(), json!(1), Duration::from_secs(60));
        cache.invalidate("monitor:*");
        assert_eq!(cache.get("monitor:metrics:a=1"), None);
        assert_eq!(cache.get("monitor:settings:a=1"), None);
    }
}
