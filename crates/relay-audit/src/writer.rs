//! Batched Audit Writer (C5): a single actor, fed by all workers, that
//! coalesces job-status updates into size/time-bounded Job Store
//! transactions (spec §4.5).

use std::sync::Arc;
use std::time::Duration;

use relay_core::{JobPatch, JobStatus};
use relay_store::JobStore;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const BATCH_SIZE: usize = 100;
pub const BATCH_TIMEOUT: Duration = Duration::from_millis(5_000);

/// One buffered job-status mutation, keyed by `idempotency_key`. Mirrors
/// [`JobPatch`] field-for-field; kept as a distinct type since it's the
/// writer's wire shape, not the store's.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub idempotency_key: String,
    pub status: JobStatus,
    pub crm_response: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl From<JobUpdate> for JobPatch {
    fn from(update: JobUpdate) -> Self {
        JobPatch {
            idempotency_key: update.idempotency_key,
            status: update.status,
            crm_response: update.crm_response,
            error_message: update.error_message,
        }
    }
}

/// Cheaply cloneable handle workers hold to submit updates. The channel is
/// the backpressure sink described in spec §4.5: a full channel applies
/// backpressure to `push` callers rather than dropping anything.
#[derive(Clone)]
pub struct BatchedAuditWriterHandle {
    tx: mpsc::Sender<JobUpdate>,
    flush_tx: mpsc::Sender<tokio::sync::oneshot::Sender<()>>,
}

impl BatchedAuditWriterHandle {
    pub async fn push(&self, update: JobUpdate) -> Result<(), mpsc::error::SendError<JobUpdate>> {
        self.tx.send(update).await
    }

    /// Force an out-of-band flush of whatever is currently buffered,
    /// regardless of `BATCH_SIZE`/`BATCH_TIMEOUT` (spec §6 `POST
    /// /queue/monitor/force-flush`). Resolves once the actor has completed
    /// the flush attempt.
    pub async fn force_flush(&self) -> anyhow::Result<()> {
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        self.flush_tx.send(ack_tx).await.map_err(|_| anyhow::anyhow!("batched audit writer has shut down"))?;
        ack_rx.await.map_err(|_| anyhow::anyhow!("batched audit writer dropped the flush request"))
    }
}

/// The actor loop. Owns the buffer and is the sole caller of
/// [`JobStore::apply_patch_batch`] (spec §4.5 invariant).
struct BatchedAuditWriter<S: JobStore> {
    store: Arc<S>,
    rx: mpsc::Receiver<JobUpdate>,
    flush_rx: mpsc::Receiver<tokio::sync::oneshot::Sender<()>>,
    buffer: Vec<JobUpdate>,
    oldest_buffered_at: Option<Instant>,
}

impl<S: JobStore> BatchedAuditWriter<S> {
    /// Drive the actor until `shutdown` fires, force-flushing on the way out.
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let deadline = self.oldest_buffered_at.map(|at| at + BATCH_TIMEOUT);

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::info!("batched audit writer: shutdown signalled, force-flushing");
                    self.force_flush().await;
                    break;
                }

                maybe_update = self.rx.recv() => {
                    match maybe_update {
                        Some(update) => {
                            if self.buffer.is_empty() {
                                self.oldest_buffered_at = Some(Instant::now());
                            }
                            self.buffer.push(update);
                            if self.buffer.len() >= BATCH_SIZE {
                                self.flush().await;
                            }
                        }
                        None => {
                            tracing::info!("batched audit writer: channel closed, force-flushing");
                            self.force_flush().await;
                            break;
                        }
                    }
                }

                _ = sleep_until_or_pending(deadline) => {
                    self.flush().await;
                }

                maybe_ack = self.flush_rx.recv() => {
                    if let Some(ack) = maybe_ack {
                        self.force_flush().await;
                        let _ = ack.send(());
                    }
                }
            }
        }
    }

    /// Flush the current buffer in one transaction; re-prepend on failure
    /// per spec §4.5 ("re-prepend the batch to the buffer and log").
    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        self.oldest_buffered_at = None;

        let patches: Vec<JobPatch> = batch.clone().into_iter().map(JobPatch::from).collect();
        match self.store.apply_patch_batch(patches).await {
            Ok(results) => {
                for (key, outcome) in results {
                    if let Err(err) = outcome {
                        tracing::warn!(idempotency_key = %key, error = %err, "batched audit writer: patch rejected");
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, batch_size = batch.len(), "batched audit writer: flush transaction failed, re-prepending batch");
                let mut requeued = batch;
                requeued.append(&mut self.buffer);
                self.buffer = requeued;
                self.oldest_buffered_at = Some(Instant::now());
                if self.buffer.len() > 2 * BATCH_SIZE {
                    tracing::warn!(backlog = self.buffer.len(), "batched audit writer: backlog exceeds 2x batch size");
                }
            }
        }
    }

    async fn force_flush(&mut self) {
        while !self.buffer.is_empty() {
            let before = self.buffer.len();
            self.flush().await;
            if self.buffer.len() >= before {
                tracing::error!(backlog = self.buffer.len(), "batched audit writer: force-flush made no progress, giving up");
                break;
            }
        }
    }
}

/// Resolves only when `deadline` is `Some` and has elapsed; stays pending
/// forever for `None`, so the surrounding `select!` arm never fires on an
/// empty buffer.
async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Spawn the writer actor, returning the handle callers submit updates
/// through and the task's `JoinHandle` for the composition root to await.
pub fn spawn<S: JobStore + 'static>(
    store: Arc<S>,
    channel_capacity: usize,
    shutdown: CancellationToken,
) -> (BatchedAuditWriterHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(channel_capacity);
    let (flush_tx, flush_rx) = mpsc::channel(8);
    let actor = BatchedAuditWriter { store, rx, flush_rx, buffer: Vec::new(), oldest_buffered_at: None };
    let handle = tokio::spawn(actor.run(shutdown));
    (BatchedAuditWriterHandle { tx, flush_tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{JobStatus, NewJob};
    use relay_store::InMemoryJobStore;
    use serde_json::json;

    async fn seed(store: &InMemoryJobStore, key: &str) {
        store.create(NewJob { idempotency_key: key.to_string(), payload: json!(null) }).await.unwrap();
    }

    #[tokio::test]
    async fn flushes_on_batch_timeout_and_applies_patch() {
        let store = Arc::new(InMemoryJobStore::new());
        seed(&store, "pledge-1").await;

        let shutdown = CancellationToken::new();
        let (handle, join) = spawn(store.clone(), 16, shutdown.clone());

        handle
            .push(JobUpdate {
                idempotency_key: "pledge-1".into(),
                status: JobStatus::Processing,
                crm_response: None,
                error_message: None,
            })
            .await
            .unwrap();

        tokio::time::sleep(BATCH_TIMEOUT + Duration::from_millis(200)).await;

        let job = store.get("pledge-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);

        shutdown.cancel();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn flushes_immediately_at_batch_size() {
        let store = Arc::new(InMemoryJobStore::new());
        for i in 0..BATCH_SIZE {
            seed(&store, &format!("k-{i}")).await;
        }

        let shutdown = CancellationToken::new();
        let (handle, join) = spawn(store.clone(), BATCH_SIZE + 1, shutdown.clone());

        for i in 0..BATCH_SIZE {
            handle
                .push(JobUpdate {
                    idempotency_key: format!("k-{i}"),
                    status: JobStatus::Processing,
                    crm_response: None,
                    error_message: None,
                })
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        let job = store.get("k-0").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);

        shutdown.cancel();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn force_flushes_on_shutdown() {
        let store = Arc::new(InMemoryJobStore::new());
        seed(&store, "pledge-1").await;

        let shutdown = CancellationToken::new();
        let (handle, join) = spawn(store.clone(), 16, shutdown.clone());

        handle
            .push(JobUpdate {
                idempotency_key: "pledge-1".into(),
                status: JobStatus::Processing,
                crm_response: None,
                error_message: None,
            })
            .await
            .unwrap();

        shutdown.cancel();
        join.await.unwrap();

        let job = store.get("pledge-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn force_flush_drains_buffer_without_waiting_for_batch_size_or_timeout() {
        let store = Arc::new(InMemoryJobStore::new());
        seed(&store, "pledge-1").await;

        let shutdown = CancellationToken::new();
        let (handle, join) = spawn(store.clone(), 16, shutdown.clone());

        handle
            .push(JobUpdate {
                idempotency_key: "pledge-1".into(),
                status: JobStatus::Processing,
                crm_response: None,
                error_message: None,
            })
            .await
            .unwrap();

        handle.force_flush().await.unwrap();

        let job = store.get("pledge-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);

        shutdown.cancel();
        join.await.unwrap();
    }
}
