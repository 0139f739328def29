//! Ephemeral queue item types (spec §3 "Queued Item").

use chrono::{DateTime, Utc};
use relay_core::BackoffPolicy;
use serde::{Deserialize, Serialize};

/// State of a queued item, owned exclusively by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
}

impl ItemState {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Waiting => "waiting",
            ItemState::Active => "active",
            ItemState::Completed => "completed",
            ItemState::Failed => "failed",
            ItemState::Delayed => "delayed",
            ItemState::Paused => "paused",
        }
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An item moving through a named queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedItem {
    pub id: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub attempts_made: u32,
    pub attempts_allowed: u32,
    pub backoff: BackoffPolicy,
    pub delay_until: Option<DateTime<Utc>>,
    pub priority: i32,
    pub state: ItemState,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    /// Number of times an `active` lease silently expired and the item was
    /// returned to `waiting` (spec §4.2 stall recovery, capped by
    /// [`relay_core::MAX_STALLED_COUNT`]).
    pub stalled_count: u32,
}

/// Options accepted by [`crate::QueueBroker::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub priority: i32,
    pub delay_ms: u64,
    pub attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self { priority: 0, delay_ms: 0, attempts: None, backoff: None }
    }
}

/// Per-state counts returned by [`crate::QueueBroker::counts`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
}
