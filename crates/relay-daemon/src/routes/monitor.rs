//! Performance Monitor admin routes (spec §6): `GET /queue/monitor/{health,
//! detailed,metrics,alerts}` and `POST /queue/monitor/force-flush`.

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::Json;
use relay_core::QueueName;
use serde::Serialize;

use crate::state::AppState;

/// Narrower than the ambient `GET /health`: queue/worker health only, no
/// database ping (the teacher's `routes/health.rs` distinguishes the two
/// the same way — liveness vs. a specific subsystem's readiness).
pub async fn monitor_health(Extension(state): Extension<AppState>) -> StatusCode {
    match state.broker.counts(QueueName::Salesforce).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[derive(Serialize)]
pub struct DetailedHealth {
    queues: std::collections::HashMap<String, relay_queue::QueueCounts>,
    worker_completed_total: u64,
    worker_failed_total: u64,
}

pub async fn monitor_detailed(Extension(state): Extension<AppState>) -> Result<Json<DetailedHealth>, (StatusCode, String)> {
    let mut queues = std::collections::HashMap::new();
    for queue in QueueName::ALL {
        let counts = state.broker.counts(queue).await.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        queues.insert(queue.as_str().to_string(), counts);
    }
    Ok(Json(DetailedHealth {
        queues,
        worker_completed_total: state.salesforce_metrics.completed_total(),
        worker_failed_total: state.salesforce_metrics.failed_total(),
    }))
}

pub async fn monitor_metrics(
    Extension(state): Extension<AppState>,
) -> Result<Json<relay_monitor::MetricsSnapshot>, (StatusCode, String)> {
    state
        .monitor
        .latest_snapshot()
        .await
        .map(Json)
        .ok_or((StatusCode::SERVICE_UNAVAILABLE, "no sample taken yet".to_string()))
}

pub async fn monitor_alerts(Extension(state): Extension<AppState>) -> Result<Json<Vec<relay_monitor::Alert>>, (StatusCode, String)> {
    let snapshot = state
        .monitor
        .latest_snapshot()
        .await
        .ok_or((StatusCode::SERVICE_UNAVAILABLE, "no sample taken yet".to_string()))?;
    Ok(Json(state.monitor.evaluate_alerts(&snapshot)))
}

pub async fn monitor_force_flush(Extension(state): Extension<AppState>) -> Result<StatusCode, (StatusCode, String)> {
    state.audit_writer.force_flush().await.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}
