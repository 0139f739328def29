//! Shared L2 cache tier, backed by Redis. A miss or a backend error here
//! degrades to "nothing cached" rather than propagating (spec §4.9 "cache
//! errors never propagate to the caller").

use std::time::Duration;

use deadpool_redis::Pool;
use redis::AsyncCommands;

use crate::key::InvalidationTarget;

const SCAN_COUNT: usize = 200;

pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "cache: redis connection unavailable, treating as miss");
                return None;
            }
        };
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(key, error = %err, "cache: redis GET failed, treating as miss");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &serde_json::Value, ttl: Duration) {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "cache: redis connection unavailable, skipping set");
                return;
            }
        };
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(key, error = %err, "cache: failed to serialize cache value, skipping set");
                return;
            }
        };
        let ttl_secs = ttl.as_secs().max(1);
        if let Err(err) = conn.set_ex::<_, _, ()>(key, raw, ttl_secs).await {
            tracing::warn!(key, error = %err, "cache: redis SET failed");
        }
    }

    pub async fn invalidate(&self, pattern: &str) {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "cache: redis connection unavailable, skipping invalidate");
                return;
            }
        };
        match InvalidationTarget::parse(pattern) {
            InvalidationTarget::Key(key) => {
                if let Err(err) = conn.del::<_, ()>(&key).await {
                    tracing::warn!(key, error = %err, "cache: redis DEL failed");
                }
            }
            InvalidationTarget::Prefix(prefix) => {
                self.scan_delete(&mut conn, &format!("{prefix}*")).await;
            }
        }
    }

    /// `SCAN`-cursor over `match_pattern` rather than `KEYS`, so invalidation
    /// never blocks the Redis event loop on a large keyspace.
    async fn scan_delete(&self, conn: &mut deadpool_redis::Connection, match_pattern: &str) {
        let mut cursor: u64 = 0;
        loop {
            let result: Result<(u64, Vec<String>), redis::RedisError> =
                redis::cmd("SCAN").arg(cursor).arg("MATCH").arg(match_pattern).arg("COUNT").arg(SCAN_COUNT).query_async(conn).await;
            let (next_cursor, keys) = match result {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(pattern = match_pattern, error = %err, "cache: redis SCAN failed");
                    return;
                }
            };
            if !keys.is_empty() {
                if let Err(err) = conn.del::<_, ()>(&keys).await {
                    tracing::warn!(pattern = match_pattern, error = %err, "cache: redis DEL (batch) failed");
                }
            }
            if next_cursor == 0 {
                return;
            }
            cursor = next_cursor;
        }
    }
}
