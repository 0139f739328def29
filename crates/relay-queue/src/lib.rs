//! Queue Broker Adapter (C2): named queues backed by Redis, with
//! independent retry/backoff policies per queue (spec §4.2).
//!
//! All mutations of one item are serialised via the backing store's atomic
//! primitives (Lua scripts in the Redis implementation); the adapter itself
//! is safe under parallel callers (spec §4.2 "Concurrency").

use async_trait::async_trait;
use relay_core::QueueName;

pub mod in_memory;
pub mod redis_broker;
mod scripts;
pub mod types;

pub use in_memory::InMemoryQueueBroker;
pub use redis_broker::RedisQueueBroker;
pub use types::{EnqueueOptions, ItemState, QueueCounts, QueuedItem};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue item {0} not found")]
    NotFound(String),

    #[error("queue {0} is paused")]
    Paused(String),

    #[error("queue broker backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Contract for a named, Redis-backed work queue.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Enqueue a new item. Returns the generated item id.
    async fn enqueue(
        &self,
        queue: QueueName,
        name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<String, QueueError>;

    /// Atomically claim one `waiting` item (whose delay, if any, has
    /// elapsed) and move it to `active` under a lease. Returns `None` if no
    /// item is ready. Delayed items are invisible until `delay_until <= now`
    /// (spec §4.2 "Ordering").
    async fn reserve(&self, queue: QueueName, worker_id: &str, lease_ms: u64) -> Result<Option<QueuedItem>, QueueError>;

    /// Mark an active item complete, releasing its lease.
    async fn complete(&self, queue: QueueName, id: &str, return_value: serde_json::Value) -> Result<(), QueueError>;

    /// Mark an active item failed. Requeues with the next backoff delay if
    /// `attempts_made < attempts`, otherwise terminates as `failed`.
    async fn fail(&self, queue: QueueName, id: &str, reason: &str) -> Result<(), QueueError>;

    async fn pause(&self, queue: QueueName) -> Result<(), QueueError>;
    async fn resume(&self, queue: QueueName) -> Result<(), QueueError>;
    async fn obliterate(&self, queue: QueueName) -> Result<(), QueueError>;

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError>;
    async fn list(&self, queue: QueueName, state: ItemState, offset: u64, limit: u64) -> Result<Vec<QueuedItem>, QueueError>;
    async fn get(&self, queue: QueueName, id: &str) -> Result<Option<QueuedItem>, QueueError>;
    async fn retry(&self, queue: QueueName, id: &str) -> Result<(), QueueError>;
    async fn remove(&self, queue: QueueName, id: &str) -> Result<(), QueueError>;

    /// Sweep `active` items whose lease has expired and return them to
    /// `waiting` with `attempts_made += 1` (spec §4.2 stall recovery).
    /// Returns the number of items recovered.
    async fn recover_stalled(&self, queue: QueueName) -> Result<u32, QueueError>;
}
