//! Composition root: wires config, telemetry, persistence, and the C1-C9
//! components into one supervised process with an admin/monitor/handoff
//! HTTP surface (spec §2 data flow, §5 concurrency/shutdown model).
//!
//! Follows the teacher's `bin/server.rs` shape (env load -> pool connect
//! -> migrate -> build long-lived components -> spawn background loops ->
//! serve -> wait for shutdown signal), generalised from one HTTP API
//! process into one process that also owns the Scheduler and Worker Pools.

mod collaborators;
mod router;
mod routes;
mod shutdown;
mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use relay_audit::writer::spawn as spawn_audit_writer;
use relay_audit::{PgAuditStore, SettingsSnapshot};
use relay_cache::Cache;
use relay_config::Config;
use relay_core::collaborators::TokenProvider;
use relay_core::QueueName;
use relay_handoff::DeliveryHandoff;
use relay_monitor::{AlertThresholds, PerformanceMonitor};
use relay_queue::RedisQueueBroker;
use relay_scheduler::{PgCronJobStateStore, Scheduler};
use relay_store::PgJobStore;
use relay_worker::{spawn_stall_sweeper, HandlerContext, SalesforceHandler, WorkerMetrics, WorkerPool, WorkerPoolConfig};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{HttpCrmClient, HttpTokenProvider, StaticSettingsProvider, TracingErrorLog};
use crate::state::AppState;

const AUDIT_WRITER_CHANNEL_CAPACITY: usize = 1024;
const STALL_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    relay_telemetry::init();
    tracing::info!("starting the durable job execution plane");

    let config = Config::from_env().context("failed to load configuration")?;

    tracing::info!("connecting to postgres");
    let db_pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .context("failed to connect to postgres")?;

    tracing::info!("connecting to redis");
    let redis_cfg = deadpool_redis::Config::from_url(config.redis_url.clone());
    let redis_pool = redis_cfg
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .context("failed to build redis connection pool")?;

    let job_store = Arc::new(PgJobStore::new(db_pool.clone()));
    job_store.migrate().await.context("failed to run job store migrations")?;

    let audit_postgres = Arc::new(PgAuditStore::new(db_pool.clone()));
    audit_postgres.migrate().await.context("failed to run audit log migrations")?;
    let audit: Arc<dyn relay_audit::AuditStore> = audit_postgres.clone();

    let cron_state = Arc::new(PgCronJobStateStore::new(db_pool.clone()));
    cron_state.migrate().await.context("failed to run cron job state migrations")?;

    let broker: Arc<dyn relay_queue::QueueBroker> = Arc::new(RedisQueueBroker::new(redis_pool.clone()));

    let settings_provider: Arc<dyn relay_core::collaborators::SettingsProvider> = Arc::new(StaticSettingsProvider::from_env());
    let settings = Arc::new(SettingsSnapshot::new(settings_provider));

    let writer_shutdown = CancellationToken::new();
    let (audit_writer, writer_handle) = spawn_audit_writer(job_store.clone(), AUDIT_WRITER_CHANNEL_CAPACITY, writer_shutdown.clone());

    let crm_client: Arc<dyn relay_core::collaborators::CrmClient> = Arc::new(HttpCrmClient::from_env());
    let token_provider: Arc<dyn TokenProvider> = Arc::new(HttpTokenProvider::from_env());
    let error_log: Arc<dyn relay_core::collaborators::ErrorLog> = Arc::new(TracingErrorLog);

    let salesforce_metrics = Arc::new(WorkerMetrics::new());
    let handler_ctx = HandlerContext {
        crm: crm_client,
        audit: audit.clone(),
        writer: audit_writer.clone(),
        error_log,
        metrics: salesforce_metrics.clone(),
    };
    let salesforce_handler = Arc::new(SalesforceHandler { ctx: handler_ctx });
    let salesforce_pool = WorkerPool::new(QueueName::Salesforce, broker.clone(), salesforce_handler, WorkerPoolConfig::salesforce_production());

    let scheduler = Scheduler::new(job_store.clone(), broker.clone(), cron_state.clone(), audit.clone(), token_provider);

    let monitor = PerformanceMonitor::new(broker.clone(), salesforce_metrics.clone(), AlertThresholds::default());

    let cache = Arc::new(Cache::with_redis(redis_pool));
    let handoff = Arc::new(DeliveryHandoff::new(audit_postgres));

    let state = AppState {
        db_pool: db_pool.clone(),
        job_store: job_store.clone(),
        broker: broker.clone(),
        audit,
        handoff,
        cron_state: cron_state.clone(),
        scheduler: scheduler.clone(),
        monitor: monitor.clone(),
        salesforce_metrics,
        audit_writer: audit_writer.clone(),
        settings,
        cache,
    };

    let scheduler_shutdown = CancellationToken::new();
    let drain = CancellationToken::new();
    let hard_stop = CancellationToken::new();
    let broker_shutdown = CancellationToken::new();

    let mut background_handles = Vec::new();
    background_handles.extend(scheduler.spawn(scheduler_shutdown.clone()));
    background_handles.extend(salesforce_pool.spawn(drain.clone(), hard_stop.clone()));
    background_handles.extend(monitor.spawn(broker_shutdown.clone()));
    background_handles.push(spawn_stall_sweeper(QueueName::Salesforce, broker.clone(), STALL_SWEEP_INTERVAL, broker_shutdown.clone()));
    background_handles.push(spawn_stall_sweeper(QueueName::Email, broker.clone(), STALL_SWEEP_INTERVAL, broker_shutdown.clone()));
    background_handles.push(spawn_stall_sweeper(QueueName::Notifications, broker.clone(), STALL_SWEEP_INTERVAL, broker_shutdown.clone()));

    let app = router::build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind admin/monitor/handoff listener")?;
    tracing::info!(%addr, "admin/monitor/handoff surface listening");

    let serve_shutdown = broker_shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
            .await
    });

    shutdown::wait_for_signal_and_shut_down(scheduler_shutdown, drain, hard_stop, writer_shutdown, broker_shutdown).await;

    for handle in background_handles {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
    }
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), writer_handle).await;
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), server).await;

    tracing::info!("shutdown complete");
    Ok(())
}
