//! In-memory [`QueueBroker`] used by unit tests and `relay-testkit`.
//!
//! Mirrors the ordering/retry/stall semantics of [`crate::redis_broker::RedisQueueBroker`]
//! without needing a live Redis instance, the way `seesaw-rs`'s
//! `testing.rs` provides in-memory stand-ins for its Postgres-backed traits.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{QueueName, MAX_STALLED_COUNT};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::types::{EnqueueOptions, ItemState, QueueCounts, QueuedItem};
use crate::{QueueBroker, QueueError};

#[derive(Default)]
struct QueueState {
    waiting: Vec<QueuedItem>,
    active: HashMap<String, (QueuedItem, DateTime<Utc>)>,
    completed: std::collections::VecDeque<QueuedItem>,
    failed: std::collections::VecDeque<QueuedItem>,
    paused: bool,
    seq: u64,
}

struct Inner {
    salesforce: Mutex<QueueState>,
    email: Mutex<QueueState>,
    notifications: Mutex<QueueState>,
}

impl Inner {
    fn state(&self, queue: QueueName) -> &Mutex<QueueState> {
        match queue {
            QueueName::Salesforce => &self.salesforce,
            QueueName::Email => &self.email,
            QueueName::Notifications => &self.notifications,
        }
    }
}

/// In-memory, single-process implementation of the Queue Broker Adapter (C2).
///
/// Safe under parallel callers: every operation takes the per-queue
/// [`tokio::sync::Mutex`] for the duration of its mutation (spec §4.2
/// "Concurrency").
pub struct InMemoryQueueBroker {
    inner: Inner,
}

impl Default for InMemoryQueueBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueueBroker {
    pub fn new() -> Self {
        Self {
            inner: Inner {
                salesforce: Mutex::new(QueueState::default()),
                email: Mutex::new(QueueState::default()),
                notifications: Mutex::new(QueueState::default()),
            },
        }
    }
}

#[async_trait]
impl QueueBroker for InMemoryQueueBroker {
    async fn enqueue(
        &self,
        queue: QueueName,
        name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        let defaults = queue.defaults();
        let mut state = self.inner.state(queue).lock().await;
        state.seq += 1;
        let now = Utc::now();
        let delay_until = if options.delay_ms > 0 {
            Some(now + chrono::Duration::milliseconds(options.delay_ms as i64))
        } else {
            None
        };
        let item = QueuedItem {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            payload,
            attempts_made: 0,
            attempts_allowed: options.attempts.unwrap_or(defaults.attempts),
            backoff: options.backoff.unwrap_or(defaults.backoff),
            delay_until,
            priority: options.priority,
            state: if delay_until.is_some() { ItemState::Delayed } else { ItemState::Waiting },
            enqueued_at: now,
            started_at: None,
            finished_at: None,
            failed_reason: None,
            stalled_count: 0,
        };
        let id = item.id.clone();
        // `waiting` holds both immediately-visible and delayed items; reserve()
        // filters by `delay_until` at pop time (spec §4.2 "Ordering": delayed
        // items are invisible until elapsed).
        state.waiting.push(item);
        Ok(id)
    }

    async fn reserve(&self, queue: QueueName, _worker_id: &str, lease_ms: u64) -> Result<Option<QueuedItem>, QueueError> {
        let mut state = self.inner.state(queue).lock().await;
        if state.paused {
            return Ok(None);
        }
        let now = Utc::now();
        // Higher `priority` wins; within equal priority, FIFO by position in
        // `waiting` (insertion order), per spec §4.2 "Ordering". Delayed items
        // are invisible until their delay has elapsed.
        let mut best: Option<(usize, i32)> = None;
        for (idx, item) in state.waiting.iter().enumerate() {
            if item.delay_until.map(|d| d > now).unwrap_or(false) {
                continue;
            }
            match best {
                Some((_, best_priority)) if best_priority >= item.priority => {}
                _ => best = Some((idx, item.priority)),
            }
        }
        let Some((idx, _)) = best else {
            return Ok(None);
        };
        let mut item = state.waiting.remove(idx);
        item.state = ItemState::Active;
        item.started_at = Some(now);
        let lease_expiry = now + chrono::Duration::milliseconds(lease_ms as i64);
        let result = item.clone();
        state.active.insert(item.id.clone(), (item, lease_expiry));
        Ok(Some(result))
    }

    async fn complete(&self, queue: QueueName, id: &str, return_value: serde_json::Value) -> Result<(), QueueError> {
        let defaults = queue.defaults();
        let mut state = self.inner.state(queue).lock().await;
        let (mut item, _) = state.active.remove(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        item.state = ItemState::Completed;
        item.finished_at = Some(Utc::now());
        item.payload = return_value;
        state.completed.push_back(item);
        while state.completed.len() > defaults.remove_on_complete as usize {
            state.completed.pop_front();
        }
        Ok(())
    }

    async fn fail(&self, queue: QueueName, id: &str, reason: &str) -> Result<(), QueueError> {
        let defaults = queue.defaults();
        let mut state = self.inner.state(queue).lock().await;
        let (mut item, _) = state.active.remove(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        item.attempts_made += 1;
        item.failed_reason = Some(reason.to_string());

        if item.attempts_made < item.attempts_allowed {
            let delay = item.backoff.delay_for_attempt(item.attempts_made.saturating_sub(1));
            item.delay_until = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
            item.state = if delay.is_zero() { ItemState::Waiting } else { ItemState::Delayed };
            item.started_at = None;
            state.waiting.push(item);
        } else {
            item.state = ItemState::Failed;
            item.finished_at = Some(Utc::now());
            state.failed.push_back(item);
            while state.failed.len() > defaults.remove_on_fail as usize {
                state.failed.pop_front();
            }
        }
        Ok(())
    }

    async fn pause(&self, queue: QueueName) -> Result<(), QueueError> {
        self.inner.state(queue).lock().await.paused = true;
        Ok(())
    }

    async fn resume(&self, queue: QueueName) -> Result<(), QueueError> {
        self.inner.state(queue).lock().await.paused = false;
        Ok(())
    }

    async fn obliterate(&self, queue: QueueName) -> Result<(), QueueError> {
        let mut state = self.inner.state(queue).lock().await;
        *state = QueueState { paused: state.paused, ..QueueState::default() };
        Ok(())
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError> {
        let state = self.inner.state(queue).lock().await;
        let (waiting, delayed) = state.waiting.iter().fold((0u64, 0u64), |(w, d), item| {
            if matches!(item.state, ItemState::Delayed) {
                (w, d + 1)
            } else {
                (w + 1, d)
            }
        });
        Ok(QueueCounts {
            waiting,
            active: state.active.len() as u64,
            completed: state.completed.len() as u64,
            failed: state.failed.len() as u64,
            delayed,
            paused: if state.paused { 1 } else { 0 },
        })
    }

    async fn list(&self, queue: QueueName, state_filter: ItemState, offset: u64, limit: u64) -> Result<Vec<QueuedItem>, QueueError> {
        let state = self.inner.state(queue).lock().await;
        let items: Vec<QueuedItem> = match state_filter {
            ItemState::Waiting | ItemState::Delayed => state.waiting.iter().filter(|i| i.state == state_filter).cloned().collect(),
            ItemState::Active => state.active.values().map(|(i, _)| i.clone()).collect(),
            ItemState::Completed => state.completed.iter().cloned().collect(),
            ItemState::Failed => state.failed.iter().cloned().collect(),
            ItemState::Paused => Vec::new(),
        };
        Ok(items.into_iter().skip(offset as usize).take(limit as usize).collect())
    }

    async fn get(&self, queue: QueueName, id: &str) -> Result<Option<QueuedItem>, QueueError> {
        let state = self.inner.state(queue).lock().await;
        if let Some((item, _)) = state.active.get(id) {
            return Ok(Some(item.clone()));
        }
        if let Some(item) = state.waiting.iter().find(|i| i.id == id) {
            return Ok(Some(item.clone()));
        }
        if let Some(item) = state.completed.iter().find(|i| i.id == id) {
            return Ok(Some(item.clone()));
        }
        if let Some(item) = state.failed.iter().find(|i| i.id == id) {
            return Ok(Some(item.clone()));
        }
        Ok(None)
    }

    async fn retry(&self, queue: QueueName, id: &str) -> Result<(), QueueError> {
        let mut state = self.inner.state(queue).lock().await;
        let pos = state.failed.iter().position(|i| i.id == id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let mut item = state.failed.remove(pos).unwrap();
        item.state = ItemState::Waiting;
        item.delay_until = None;
        item.finished_at = None;
        item.failed_reason = None;
        state.waiting.push(item);
        Ok(())
    }

    async fn remove(&self, queue: QueueName, id: &str) -> Result<(), QueueError> {
        let mut state = self.inner.state(queue).lock().await;
        state.waiting.retain(|i| i.id != id);
        state.active.remove(id);
        state.completed.retain(|i| i.id != id);
        state.failed.retain(|i| i.id != id);
        Ok(())
    }

    async fn recover_stalled(&self, queue: QueueName) -> Result<u32, QueueError> {
        let defaults = queue.defaults();
        let mut state = self.inner.state(queue).lock().await;
        let now = Utc::now();
        let stalled_ids: Vec<String> = state
            .active
            .iter()
            .filter(|(_, (_, lease))| *lease <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut recovered = 0u32;
        for id in stalled_ids {
            let (mut item, _) = state.active.remove(&id).expect("checked present above");
            if item.stalled_count >= MAX_STALLED_COUNT {
                item.state = ItemState::Failed;
                item.failed_reason = Some("stalled: lease expired beyond MAX_STALLED_COUNT".to_string());
                item.finished_at = Some(now);
                state.failed.push_back(item);
                while state.failed.len() > defaults.remove_on_fail as usize {
                    state.failed.pop_front();
                }
            } else {
                item.stalled_count += 1;
                item.attempts_made += 1;
                item.state = ItemState::Waiting;
                item.started_at = None;
                state.waiting.push(item);
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fifo_within_priority() {
        let broker = InMemoryQueueBroker::new();
        broker.enqueue(QueueName::Email, "a", json!(1), EnqueueOptions::default()).await.unwrap();
        broker.enqueue(QueueName::Email, "b", json!(2), EnqueueOptions::default()).await.unwrap();

        let first = broker.reserve(QueueName::Email, "w1", 30_000).await.unwrap().unwrap();
        assert_eq!(first.name, "a");
        let second = broker.reserve(QueueName::Email, "w1", 30_000).await.unwrap().unwrap();
        assert_eq!(second.name, "b");
    }

    #[tokio::test]
    async fn higher_priority_wins_regardless_of_enqueue_order() {
        let broker = InMemoryQueueBroker::new();
        broker
            .enqueue(QueueName::Salesforce, "low", json!(null), EnqueueOptions { priority: 0, ..Default::default() })
            .await
            .unwrap();
        broker
            .enqueue(QueueName::Salesforce, "high", json!(null), EnqueueOptions { priority: 5, ..Default::default() })
            .await
            .unwrap();

        let first = broker.reserve(QueueName::Salesforce, "w1", 30_000).await.unwrap().unwrap();
        assert_eq!(first.name, "high");
    }

    #[tokio::test]
    async fn delayed_items_invisible_until_elapsed() {
        let broker = InMemoryQueueBroker::new();
        broker
            .enqueue(QueueName::Notifications, "later", json!(null), EnqueueOptions { delay_ms: 60_000, ..Default::default() })
            .await
            .unwrap();

        let result = broker.reserve(QueueName::Notifications, "w1", 30_000).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn fail_requeues_until_attempts_exhausted_then_terminates() {
        let broker = InMemoryQueueBroker::new();
        let id = broker
            .enqueue(
                QueueName::Salesforce,
                "job",
                json!(null),
                EnqueueOptions { attempts: Some(2), backoff: Some(relay_core::BackoffPolicy::Fixed { base_ms: 0 }), ..Default::default() },
            )
            .await
            .unwrap();

        let item = broker.reserve(QueueName::Salesforce, "w1", 30_000).await.unwrap().unwrap();
        assert_eq!(item.id, id);
        broker.fail(QueueName::Salesforce, &id, "first failure").await.unwrap();

        let counts = broker.counts(QueueName::Salesforce).await.unwrap();
        assert_eq!(counts.waiting, 1);

        let item = broker.reserve(QueueName::Salesforce, "w1", 30_000).await.unwrap().unwrap();
        broker.fail(QueueName::Salesforce, &item.id, "second failure").await.unwrap();

        let counts = broker.counts(QueueName::Salesforce).await.unwrap();
        assert_eq!(counts.waiting, 0);
        assert_eq!(counts.failed, 1);
    }

    #[tokio::test]
    async fn complete_moves_item_out_of_active() {
        let broker = InMemoryQueueBroker::new();
        let id = broker.enqueue(QueueName::Email, "job", json!(null), EnqueueOptions::default()).await.unwrap();
        broker.reserve(QueueName::Email, "w1", 30_000).await.unwrap();
        broker.complete(QueueName::Email, &id, json!({"ok": true})).await.unwrap();

        let counts = broker.counts(QueueName::Email).await.unwrap();
        assert_eq!(counts.active, 0);
        assert_eq!(counts.completed, 1);
    }

    #[tokio::test]
    async fn paused_queue_yields_no_reservations() {
        let broker = InMemoryQueueBroker::new();
        broker.enqueue(QueueName::Email, "job", json!(null), EnqueueOptions::default()).await.unwrap();
        broker.pause(QueueName::Email).await.unwrap();

        let result = broker.reserve(QueueName::Email, "w1", 30_000).await.unwrap();
        assert!(result.is_none());

        broker.resume(QueueName::Email).await.unwrap();
        let result = broker.reserve(QueueName::Email, "w1", 30_000).await.unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn stall_recovery_requeues_once_then_terminates() {
        let broker = InMemoryQueueBroker::new();
        let id = broker.enqueue(QueueName::Email, "job", json!(null), EnqueueOptions::default()).await.unwrap();
        broker.reserve(QueueName::Email, "w1", 0).await.unwrap();

        // lease_ms = 0 means the lease has already expired.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let recovered = broker.recover_stalled(QueueName::Email).await.unwrap();
        assert_eq!(recovered, 1);
        let counts = broker.counts(QueueName::Email).await.unwrap();
        assert_eq!(counts.waiting, 1);

        broker.reserve(QueueName::Email, "w1", 0).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let recovered = broker.recover_stalled(QueueName::Email).await.unwrap();
        assert_eq!(recovered, 0);
        let counts = broker.counts(QueueName::Email).await.unwrap();
        assert_eq!(counts.failed, 1);
        let item = broker.get(QueueName::Email, &id).await.unwrap().unwrap();
        assert_eq!(item.state, ItemState::Failed);
    }

    #[tokio::test]
    async fn retry_moves_failed_item_back_to_waiting() {
        let broker = InMemoryQueueBroker::new();
        let id = broker
            .enqueue(
                QueueName::Email,
                "job",
                json!(null),
                EnqueueOptions { attempts: Some(1), ..Default::default() },
            )
            .await
            .unwrap();
        broker.reserve(QueueName::Email, "w1", 30_000).await.unwrap();
        broker.fail(QueueName::Email, &id, "boom").await.unwrap();

        broker.retry(QueueName::Email, &id).await.unwrap();
        let counts = broker.counts(QueueName::Email).await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.failed, 0);
    }
}
