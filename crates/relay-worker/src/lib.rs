//! Worker Pool (C3): per-queue `reserve -> process -> complete|fail` loops,
//! bounded concurrency, graceful drain, hard stop, and stall recovery (spec
//! §4.3, §5).

pub mod handler;
pub mod metrics;
pub mod payload;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::QueueName;
use relay_queue::{QueueBroker, QueuedItem};
use tokio_util::sync::CancellationToken;

pub use handler::{process_salesforce_job, HandlerContext, HandlerOutcome};
pub use metrics::WorkerMetrics;

/// A typed handler a [`WorkerPool`] drives against each reserved item. The
/// only production implementation is [`SalesforceHandler`]; other queues
/// (`email`, `notifications`) are out of the detailed handler contract spec
/// §4.3 specifies, but share the same pool/loop shape.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, item: &QueuedItem) -> HandlerOutcome;
}

/// Adapts [`process_salesforce_job`] to [`JobHandler`], deserialising the
/// reserved item's payload into a [`payload::SalesforceJob`] first.
pub struct SalesforceHandler {
    pub ctx: HandlerContext,
}

#[async_trait]
impl JobHandler for SalesforceHandler {
    async fn handle(&self, item: &QueuedItem) -> HandlerOutcome {
        let job: payload::SalesforceJob = match serde_json::from_value(item.payload.clone()) {
            Ok(job) => job,
            Err(err) => {
                tracing::error!(item_id = %item.id, error = %err, "malformed salesforce job payload");
                return HandlerOutcome::Failed { reason: format!("malformed payload: {err}") };
            }
        };
        process_salesforce_job(&self.ctx, job, item).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    /// Number of concurrent `reserve -> process -> complete|fail` loops.
    /// Spec §4.3: "default: 20 for `salesforce` in production".
    pub concurrency: usize,
    /// Lease duration handed to [`QueueBroker::reserve`].
    pub lease_ms: u64,
    /// How long an idle worker sleeps between empty `reserve` polls.
    pub poll_interval: Duration,
}

impl WorkerPoolConfig {
    pub fn salesforce_production() -> Self {
        Self { concurrency: 20, lease_ms: 30_000, poll_interval: Duration::from_millis(250) }
    }
}

/// Drives `concurrency` independent worker loops against one named queue.
///
/// Graceful drain: signalling `drain` stops new `reserve` calls; in-flight
/// handlers are allowed to finish. Hard stop: signalling `hard_stop` aborts
/// whatever handler task is currently in flight and fails its item
/// immediately (spec §5 "cancel their per-call contexts").
pub struct WorkerPool<H: JobHandler + 'static> {
    queue: QueueName,
    broker: Arc<dyn QueueBroker>,
    handler: Arc<H>,
    config: WorkerPoolConfig,
}

impl<H: JobHandler + 'static> WorkerPool<H> {
    pub fn new(queue: QueueName, broker: Arc<dyn QueueBroker>, handler: Arc<H>, config: WorkerPoolConfig) -> Arc<Self> {
        Arc::new(Self { queue, broker, handler, config })
    }

    /// Spawn `config.concurrency` worker loop tasks, returning their join
    /// handles for the composition root to await at shutdown.
    pub fn spawn(self: &Arc<Self>, drain: CancellationToken, hard_stop: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.concurrency)
            .map(|i| {
                let pool = self.clone();
                let worker_id = format!("{}-{i}", pool.queue);
                let drain = drain.clone();
                let hard_stop = hard_stop.clone();
                tokio::spawn(async move { pool.run(worker_id, drain, hard_stop).await })
            })
            .collect()
    }

    async fn run(self: Arc<Self>, worker_id: String, drain: CancellationToken, hard_stop: CancellationToken) {
        loop {
            if drain.is_cancelled() {
                tracing::info!(worker_id, queue = %self.queue, "worker draining, stopping reservations");
                return;
            }

            let item = match self.broker.reserve(self.queue, &worker_id, self.config.lease_ms).await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    tokio::select! {
                        _ = drain.cancelled() => return,
                        _ = tokio::time::sleep(self.config.poll_interval) => continue,
                    }
                }
                Err(err) => {
                    tracing::error!(worker_id, queue = %self.queue, error = %err, "reserve failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            let outcome = self.run_one(&worker_id, &item, &hard_stop).await;
            self.finish(&worker_id, &item, outcome).await;
        }
    }

    /// Run the handler for one reserved item, spawned as its own task so a
    /// panic is caught at the `JoinHandle` rather than taking the whole
    /// worker loop down (spec §9 ambient "worker panic containment").
    async fn run_one(&self, worker_id: &str, item: &QueuedItem, hard_stop: &CancellationToken) -> HandlerOutcome {
        let handler = self.handler.clone();
        let item_owned = item.clone();
        let mut task = tokio::spawn(async move { handler.handle(&item_owned).await });

        tokio::select! {
            biased;
            _ = hard_stop.cancelled() => {
                tracing::warn!(worker_id, item_id = %item.id, "hard stop: cancelling in-flight handler");
                task.abort();
                HandlerOutcome::Failed { reason: "cancelled on shutdown".to_string() }
            }
            joined = &mut task => match joined {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    tracing::error!(worker_id, item_id = %item.id, error = %join_err, "worker handler panicked");
                    HandlerOutcome::Failed { reason: "worker panicked".to_string() }
                }
            },
        }
    }

    async fn finish(&self, worker_id: &str, item: &QueuedItem, outcome: HandlerOutcome) {
        match outcome {
            HandlerOutcome::Completed => {
                if let Err(err) = self.broker.complete(self.queue, &item.id, serde_json::Value::Null).await {
                    tracing::error!(worker_id, item_id = %item.id, queue = %self.queue, error = %err, "broker.complete failed");
                }
            }
            HandlerOutcome::Failed { reason } => {
                if let Err(err) = self.broker.fail(self.queue, &item.id, &reason).await {
                    tracing::error!(worker_id, item_id = %item.id, queue = %self.queue, error = %err, "broker.fail failed");
                }
            }
        }
    }
}

/// Periodically sweep `queue` for stalled `active` items (spec §4.2 stall
/// recovery). A separate maintenance loop rather than worker-loop
/// responsibility, since a stalled item by definition has no worker still
/// watching it.
pub fn spawn_stall_sweeper(
    queue: QueueName,
    broker: Arc<dyn QueueBroker>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {
                    match broker.recover_stalled(queue).await {
                        Ok(0) => {}
                        Ok(n) => tracing::warn!(queue = %queue, recovered = n, "stall recovery requeued stalled items"),
                        Err(err) => tracing::error!(queue = %queue, error = %err, "stall recovery sweep failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_audit::writer::JobUpdate;
    use relay_audit::InMemoryAuditStore;
    use relay_core::collaborators::CrmResponse;
    use relay_core::NewJob;
    use relay_queue::{EnqueueOptions, InMemoryQueueBroker};
    use relay_store::{InMemoryJobStore, JobStore};
    use relay_testkit::{FakeCrmClient, FakeErrorLog};
    use serde_json::json;
    use std::time::Duration as StdDuration;

    async fn setup() -> (Arc<InMemoryQueueBroker>, Arc<InMemoryJobStore>, Arc<InMemoryAuditStore>, Arc<FakeCrmClient>, HandlerContext) {
        let broker = Arc::new(InMemoryQueueBroker::new());
        let job_store = Arc::new(InMemoryJobStore::new());
        let audit_store = Arc::new(InMemoryAuditStore::new());
        let crm = Arc::new(FakeCrmClient::new());
        let shutdown = CancellationToken::new();
        let (writer, _join) = relay_audit::writer::spawn(job_store.clone(), 64, shutdown);
        let ctx = HandlerContext {
            crm: crm.clone(),
            audit: audit_store.clone(),
            writer,
            error_log: Arc::new(FakeErrorLog::new()),
            metrics: Arc::new(WorkerMetrics::new()),
        };
        (broker, job_store, audit_store, crm, ctx)
    }

    #[tokio::test]
    async fn pool_drains_a_reserved_item_through_to_completion() {
        let (broker, job_store, audit_store, crm, ctx) = setup().await;
        crm.push_response(CrmResponse {
            http_code: 200,
            data: json!({"data": [{"Success": true, "OrderId": "O1", "Id": "I1", "Message": "ok"}]}),
            error_flag: false,
            headers: None,
            transport_code: None,
        });

        job_store.create(NewJob { idempotency_key: "pledge-1".into(), payload: json!(null) }).await.unwrap();
        let payload = json!({
            "endpoint": "/core/pledge/v2.0/",
            "payload": {"SourceExternalId": "S1"},
            "token": "T1",
            "type": "pledge",
            "client_id": "client-1",
            "idempotency_key": "pledge-1",
        });
        broker.enqueue(QueueName::Salesforce, "pledge", payload, EnqueueOptions::default()).await.unwrap();

        let handler = Arc::new(SalesforceHandler { ctx });
        let pool = WorkerPool::new(
            QueueName::Salesforce,
            broker.clone(),
            handler,
            WorkerPoolConfig { concurrency: 1, lease_ms: 30_000, poll_interval: StdDuration::from_millis(20) },
        );
        let drain = CancellationToken::new();
        let hard_stop = CancellationToken::new();
        let handles = pool.spawn(drain.clone(), hard_stop);

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        drain.cancel();
        for h in handles {
            let _ = tokio::time::timeout(StdDuration::from_secs(1), h).await;
        }

        let counts = broker.counts(QueueName::Salesforce).await.unwrap();
        assert_eq!(counts.completed, 1);

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        let result = audit_store.query(&relay_audit::AuditFilter::default()).await.unwrap();
        assert!(result.items.iter().any(|e| e.action == relay_core::AuditAction::JobCompleted));
    }

    #[tokio::test]
    async fn hard_stop_aborts_in_flight_handler_and_fails_the_item() {
        let (broker, _job_store, _audit_store, crm, ctx) = setup().await;
        // No scripted response: FakeCrmClient::direct_api will bail immediately,
        // which is enough to exercise the hard-stop race without needing a
        // slow handler.
        let _ = &crm;

        let payload = json!({
            "endpoint": "/core/pledge/v2.0/",
            "payload": {},
            "token": "T1",
            "type": "pledge",
            "client_id": "client-1",
            "idempotency_key": "pledge-1",
        });
        broker.enqueue(QueueName::Salesforce, "pledge", payload, EnqueueOptions::default()).await.unwrap();

        let handler = Arc::new(SalesforceHandler { ctx });
        let pool = WorkerPool::new(
            QueueName::Salesforce,
            broker.clone(),
            handler,
            WorkerPoolConfig { concurrency: 1, lease_ms: 30_000, poll_interval: StdDuration::from_millis(20) },
        );
        let drain = CancellationToken::new();
        let hard_stop = CancellationToken::new();
        hard_stop.cancel();
        let handles = pool.spawn(drain.clone(), hard_stop);

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        drain.cancel();
        for h in handles {
            let _ = tokio::time::timeout(StdDuration::from_secs(1), h).await;
        }

        let counts = broker.counts(QueueName::Salesforce).await.unwrap();
        assert_eq!(counts.failed, 1);
    }

    #[tokio::test]
    async fn stall_sweeper_recovers_expired_leases() {
        let broker: Arc<dyn QueueBroker> = Arc::new(InMemoryQueueBroker::new());
        broker.enqueue(QueueName::Email, "job", json!(null), EnqueueOptions::default()).await.unwrap();
        broker.reserve(QueueName::Email, "w1", 0).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(5)).await;

        let shutdown = CancellationToken::new();
        let handle = spawn_stall_sweeper(QueueName::Email, broker.clone(), StdDuration::from_millis(10), shutdown.clone());
        tokio::time::sleep(StdDuration::from_millis(60)).await;
        shutdown.cancel();
        let _ = tokio::time::timeout(StdDuration::from_secs(1), handle).await;

        let counts = broker.counts(QueueName::Email).await.unwrap();
        assert_eq!(counts.waiting, 1);
    }
}
