//! Router assembly, following the teacher's `build_app` shape
//! (`packages/server/src/server/app.rs`): build routes, then attach shared
//! state and cross-cutting layers with `.layer(...)`.

use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::routes;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health_handler))
        .route("/queue/jobs", get(routes::list_jobs))
        .route("/queue/jobs/:id", get(routes::get_job))
        .route("/queue/jobs/:id", delete(routes::remove_job))
        .route("/queue/jobs/:id/retry", post(routes::retry_job))
        .route("/queue/queues/:name/pause", post(routes::pause_queue))
        .route("/queue/queues/:name/resume", post(routes::resume_queue))
        .route("/queue/queues/:name/clear", post(routes::clear_queue))
        .route("/queue/stats", get(routes::queue_counts))
        .route("/queue/counts", get(routes::queue_counts))
        .route("/queue/performance", get(routes::queue_performance))
        .route("/queue/export", post(routes::export_audit_log))
        .route("/queue/monitor/health", get(routes::monitor_health))
        .route("/queue/monitor/detailed", get(routes::monitor_detailed))
        .route("/queue/monitor/metrics", get(routes::monitor_metrics))
        .route("/queue/monitor/alerts", get(routes::monitor_alerts))
        .route("/queue/monitor/force-flush", post(routes::monitor_force_flush))
        .route("/cron-jobs", get(routes::list_cron_jobs))
        .route("/cron-jobs/stats", get(routes::cron_stats))
        .route("/cron-jobs/schedules", get(routes::cron_schedules))
        .route("/cron-jobs/states", get(routes::cron_states))
        .route("/cron-jobs/:type/run", post(routes::run_cron_job_now))
        .route("/cron-jobs/:type/toggle", put(routes::toggle_cron_job))
        .route("/v1/:crm/pledge-cron-jobs", get(routes::pledge_cron_jobs))
        .route("/v1/:crm/oneoff-cron-jobs", get(routes::oneoff_cron_jobs))
        .route("/audit/mark-delivered", post(routes::mark_delivered))
        .layer(axum::Extension(state))
        .layer(TraceLayer::new_for_http())
}
