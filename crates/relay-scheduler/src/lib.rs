//! Scheduler (C4): four named cron-driven producers into the Queue Broker,
//! an overlap guard per job type, and durable enable/disable state (spec
//! §4.4).

pub mod state;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use dashmap::DashSet;
use relay_audit::AuditStore;
use relay_core::collaborators::TokenProvider;
use relay_core::{status_code, AuditAction, NewAuditEntry, NewJob, QueueName};
use relay_queue::{EnqueueOptions, QueueBroker};
use relay_store::{JobStore, StoreError};
use serde_json::json;
use tokio_util::sync::CancellationToken;

pub use state::{CronJobStateStore, InMemoryCronJobStateStore, PgCronJobStateStore};

/// One of the four named jobs tied to a cron expression (spec §4.4 table).
/// `cron_expr` is six-field (seconds-first), matching the `cron` crate's
/// expectation.
#[derive(Debug, Clone, Copy)]
pub struct JobDefinition {
    pub job_type: &'static str,
    pub cron_expr: &'static str,
    pub queue: QueueName,
    pub priority: i32,
    pub attempts: Option<u32>,
    pub delay_ms: u64,
    /// Whether this job type needs a freshly fetched CRM token before
    /// enqueueing (spec §4.4 step 4).
    pub crm_bound: bool,
}

pub const JOB_DEFINITIONS: [JobDefinition; 4] = [
    JobDefinition {
        job_type: "pledge",
        cron_expr: "0 */2 * * * *",
        queue: QueueName::Salesforce,
        priority: 1,
        attempts: Some(3),
        delay_ms: 0,
        crm_bound: true,
    },
    JobDefinition {
        job_type: "oneoff",
        cron_expr: "0 */2 * * * *",
        queue: QueueName::Salesforce,
        priority: 1,
        attempts: Some(3),
        delay_ms: 0,
        crm_bound: true,
    },
    JobDefinition {
        job_type: "recurring",
        cron_expr: "0 */5 * * * *",
        queue: QueueName::Notifications,
        priority: 0,
        attempts: None,
        delay_ms: 300_000,
        crm_bound: false,
    },
    JobDefinition {
        job_type: "hourly",
        cron_expr: "0 0 * * * *",
        queue: QueueName::Notifications,
        priority: 1,
        attempts: None,
        delay_ms: 0,
        crm_bound: false,
    },
];

/// Drives the four [`JOB_DEFINITIONS`] against a Job Store, Queue Broker,
/// Cron Job State store and Audit/Event Log.
pub struct Scheduler {
    job_store: Arc<dyn JobStore>,
    broker: Arc<dyn QueueBroker>,
    state: Arc<dyn CronJobStateStore>,
    audit: Arc<dyn AuditStore>,
    token_provider: Arc<dyn TokenProvider>,
    /// Overlap guard: a job type present in this set has a tick still
    /// running (spec §4.4 step 2).
    running: Arc<DashSet<&'static str>>,
}

impl Scheduler {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        broker: Arc<dyn QueueBroker>,
        state: Arc<dyn CronJobStateStore>,
        audit: Arc<dyn AuditStore>,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Arc<Self> {
        Arc::new(Self { job_store, broker, state, audit, token_provider, running: Arc::new(DashSet::new()) })
    }

    /// Spawn one independent driver task per job definition. Each computes
    /// its own next-occurrence sleep rather than sharing a single ticker, so
    /// a slow tick on one job type never delays another's schedule.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        JOB_DEFINITIONS
            .iter()
            .map(|def| {
                let scheduler = self.clone();
                let shutdown = shutdown.clone();
                let def = *def;
                tokio::spawn(async move { scheduler.drive(def, shutdown).await })
            })
            .collect()
    }

    async fn drive(self: Arc<Self>, def: JobDefinition, shutdown: CancellationToken) {
        let schedule = match Schedule::from_str(def.cron_expr) {
            Ok(schedule) => schedule,
            Err(err) => {
                tracing::error!(job_type = def.job_type, cron_expr = def.cron_expr, error = %err, "unparsable cron expression, driver exiting");
                return;
            }
        };

        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                tracing::error!(job_type = def.job_type, "cron schedule produced no further occurrences");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(job_type = def.job_type, "scheduler driver stopping");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            self.tick(def).await;
        }
    }

    /// Run one tick for `job_type` immediately, outside its cron schedule
    /// (the admin surface's `POST /cron-jobs/:type/run`). Returns `false` if
    /// no such job type exists.
    pub async fn run_now(&self, job_type: &str) -> bool {
        let Some(def) = JOB_DEFINITIONS.iter().find(|d| d.job_type == job_type) else {
            return false;
        };
        self.tick(*def).await;
        true
    }

    /// One cron occurrence for `def` (spec §4.4 "For each tick").
    async fn tick(&self, def: JobDefinition) {
        match self.state.is_enabled(def.job_type).await {
            Ok(false) => {
                tracing::debug!(job_type = def.job_type, "scheduler tick skipped: job disabled");
                return;
            }
            Err(err) => {
                tracing::error!(job_type = def.job_type, error = %err, "failed to read cron job state, assuming enabled");
            }
            Ok(true) => {}
        }

        if !self.running.insert(def.job_type) {
            tracing::warn!(job_type = def.job_type, "scheduler tick skipped: previous run still in progress");
            return;
        }

        let result = self.run_once(def).await;
        // Always released, regardless of how run_once concluded (spec §4.4 step 7).
        self.running.remove(def.job_type);

        if let Err(err) = result {
            tracing::error!(job_type = def.job_type, error = %err, "scheduler tick failed");
        }
    }

    async fn run_once(&self, def: JobDefinition) -> anyhow::Result<()> {
        let token = if def.crm_bound {
            match self.token_provider.get_token().await {
                Ok(result) if result.success => result.token,
                Ok(result) => {
                    self.emit_scheduled(def, false, result.error.or_else(|| Some("token fetch did not succeed".to_string()))).await;
                    return Ok(());
                }
                Err(err) => {
                    self.emit_scheduled(def, false, Some(err.to_string())).await;
                    return Ok(());
                }
            }
        } else {
            None
        };

        let idempotency_key = format!("{}-{}", def.job_type, Utc::now().timestamp_millis());
        let payload = json!({ "type": def.job_type });

        match self.job_store.create(NewJob { idempotency_key: idempotency_key.clone(), payload: payload.clone() }).await {
            Ok(_) => {}
            Err(StoreError::DuplicateKey(_)) => {
                // Already scheduled this tick somehow; skip without re-enqueueing (P3).
                tracing::debug!(job_type = def.job_type, idempotency_key, "scheduler: duplicate idempotency key, skipping enqueue");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        let mut enqueue_payload = payload.clone();
        enqueue_payload["idempotency_key"] = json!(idempotency_key);
        if let Some(token) = &token {
            enqueue_payload["token"] = json!(token);
        }

        let mut options = EnqueueOptions { priority: def.priority, delay_ms: def.delay_ms, ..EnqueueOptions::default() };
        options.attempts = def.attempts;

        self.broker.enqueue(def.queue, def.job_type, enqueue_payload, options).await?;
        self.emit_scheduled(def, true, None).await;
        Ok(())
    }

    /// Emit the `JOB_SCHEDULED` audit entry. `is_delivered` defaults `true`
    /// for internal-only job types, `false` for CRM-bound ones so the
    /// Delivery Handoff can later pick them up (spec §9 Open Question
    /// decision).
    async fn emit_scheduled(&self, def: JobDefinition, success: bool, error_message: Option<String>) {
        let entry = NewAuditEntry {
            action: Some(AuditAction::JobScheduled),
            method: "CRON".to_string(),
            endpoint: format!("scheduler:{}", def.job_type),
            job_type: def.job_type.to_string(),
            status_code: if success { status_code::COMPLETED } else { status_code::FAILED },
            status_message: error_message,
            ip_address: Some("system".to_string()),
            is_delivered: Some(!def.crm_bound),
            ..Default::default()
        };
        if let Err(err) = self.audit.create(entry).await {
            tracing::warn!(job_type = def.job_type, error = %err, "failed to write JOB_SCHEDULED audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_audit::InMemoryAuditStore;
    use relay_queue::InMemoryQueueBroker;
    use relay_store::InMemoryJobStore;
    use relay_testkit::FakeTokenProvider;

    const PLEDGE: JobDefinition = JOB_DEFINITIONS[0];
    const HOURLY: JobDefinition = JOB_DEFINITIONS[3];

    fn scheduler(token_provider: Arc<dyn TokenProvider>) -> (Arc<Scheduler>, Arc<InMemoryJobStore>, Arc<InMemoryQueueBroker>, Arc<InMemoryAuditStore>) {
        let job_store = Arc::new(InMemoryJobStore::new());
        let broker = Arc::new(InMemoryQueueBroker::new());
        let state = Arc::new(InMemoryCronJobStateStore::new());
        let audit = Arc::new(InMemoryAuditStore::new());
        let scheduler = Scheduler::new(job_store.clone(), broker.clone(), state, audit.clone(), token_provider);
        (scheduler, job_store, broker, audit)
    }

    #[tokio::test]
    async fn crm_bound_tick_enqueues_with_fetched_token_and_undelivered_audit() {
        let token_provider = Arc::new(FakeTokenProvider::succeeding("T1"));
        let (scheduler, _job_store, broker, audit) = scheduler(token_provider);

        scheduler.tick(PLEDGE).await;

        let counts = broker.counts(QueueName::Salesforce).await.unwrap();
        assert_eq!(counts.waiting, 1);

        let result = audit.query(&relay_audit::AuditFilter::default()).await.unwrap();
        let entry = result.items.iter().find(|e| e.action == AuditAction::JobScheduled).unwrap();
        assert!(!entry.is_delivered);
    }

    #[tokio::test]
    async fn internal_job_tick_enqueues_without_a_token_and_delivered_audit() {
        let token_provider = Arc::new(FakeTokenProvider::succeeding("unused"));
        let (scheduler, _job_store, broker, audit) = scheduler(token_provider);

        scheduler.tick(HOURLY).await;

        let counts = broker.counts(QueueName::Notifications).await.unwrap();
        assert_eq!(counts.waiting, 1);

        let result = audit.query(&relay_audit::AuditFilter::default()).await.unwrap();
        let entry = result.items.iter().find(|e| e.action == AuditAction::JobScheduled).unwrap();
        assert!(entry.is_delivered);
    }

    #[tokio::test]
    async fn token_fetch_failure_skips_enqueue_and_releases_guard() {
        let token_provider = Arc::new(FakeTokenProvider::failing("token service down"));
        let (scheduler, _job_store, broker, audit) = scheduler(token_provider);

        scheduler.tick(PLEDGE).await;

        let counts = broker.counts(QueueName::Salesforce).await.unwrap();
        assert_eq!(counts.waiting, 0);
        assert!(!scheduler.running.contains(PLEDGE.job_type));

        let result = audit.query(&relay_audit::AuditFilter::default()).await.unwrap();
        let entry = result.items.iter().find(|e| e.action == AuditAction::JobScheduled).unwrap();
        assert_eq!(entry.status_code, status_code::FAILED);
    }

    #[tokio::test]
    async fn disabled_job_type_is_skipped() {
        let token_provider = Arc::new(FakeTokenProvider::succeeding("T1"));
        let job_store = Arc::new(InMemoryJobStore::new());
        let broker = Arc::new(InMemoryQueueBroker::new());
        let state = Arc::new(InMemoryCronJobStateStore::new());
        let audit = Arc::new(InMemoryAuditStore::new());
        state.set_enabled(PLEDGE.job_type, false).await.unwrap();
        let scheduler = Scheduler::new(job_store, broker.clone(), state, audit, token_provider);

        scheduler.tick(PLEDGE).await;

        let counts = broker.counts(QueueName::Salesforce).await.unwrap();
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped_while_one_is_running() {
        let token_provider = Arc::new(FakeTokenProvider::succeeding("T1"));
        let (scheduler, _job_store, broker, _audit) = scheduler(token_provider);

        scheduler.running.insert(PLEDGE.job_type);
        scheduler.tick(PLEDGE).await;

        let counts = broker.counts(QueueName::Salesforce).await.unwrap();
        assert_eq!(counts.waiting, 0);
    }
}
