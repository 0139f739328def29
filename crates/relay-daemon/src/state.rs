//! Shared application state handed to every HTTP handler via `Extension`,
//! following the teacher's `Extension(state): Extension<AppState>` pattern
//! (`packages/server/src/server/routes/health.rs`).

use std::sync::Arc;

use relay_audit::{AuditStore, BatchedAuditWriterHandle, PgAuditStore, SettingsSnapshot};
use relay_cache::Cache;
use relay_handoff::DeliveryHandoff;
use relay_monitor::PerformanceMonitor;
use relay_queue::QueueBroker;
use relay_scheduler::{CronJobStateStore, Scheduler};
use relay_store::JobStore;
use relay_worker::WorkerMetrics;
use sqlx::PgPool;

/// Everything an HTTP handler needs, cloned cheaply behind `Arc`s.
///
/// `audit` is the trait-object view general-purpose routes query against;
/// `handoff` wraps the same underlying rows through the concrete
/// `PgAuditStore` the Delivery Handoff needs, since `DeliveryHandoff<S>` is
/// generic over its store and therefore not `dyn`-safe.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub job_store: Arc<dyn JobStore>,
    pub broker: Arc<dyn QueueBroker>,
    pub audit: Arc<dyn AuditStore>,
    pub handoff: Arc<DeliveryHandoff<PgAuditStore>>,
    pub cron_state: Arc<dyn CronJobStateStore>,
    pub scheduler: Arc<Scheduler>,
    pub monitor: Arc<PerformanceMonitor>,
    pub salesforce_metrics: Arc<WorkerMetrics>,
    pub audit_writer: BatchedAuditWriterHandle,
    pub settings: Arc<SettingsSnapshot>,
    pub cache: Arc<Cache>,
}
