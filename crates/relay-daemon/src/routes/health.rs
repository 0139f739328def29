//! Ambient `GET /health` (spec §9 "Supplemented operational details"),
//! distinct from `GET /queue/monitor/health` which reports queue/worker
//! health specifically. Follows the teacher's health-check handler shape
//! (`packages/server/src/server/routes/health.rs`): a timed DB ping plus a
//! status code that reflects the result.

use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    database: ComponentHealth,
    broker: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn ok() -> ComponentHealth {
    ComponentHealth { status: "ok".to_string(), error: None }
}

fn err(message: impl std::fmt::Display) -> ComponentHealth {
    ComponentHealth { status: "error".to_string(), error: Some(message.to_string()) }
}

pub async fn health_handler(Extension(state): Extension<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = match tokio::time::timeout(std::time::Duration::from_secs(5), sqlx::query("SELECT 1").execute(&state.db_pool)).await {
        Ok(Ok(_)) => ok(),
        Ok(Err(e)) => err(format!("query failed: {e}")),
        Err(_) => err("query timeout (>5s)"),
    };

    let broker = match state.broker.counts(relay_core::QueueName::Salesforce).await {
        Ok(_) => ok(),
        Err(e) => err(e),
    };

    let healthy = database.status == "ok" && broker.status == "ok";
    let status_code = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let status = if healthy { "healthy" } else { "unhealthy" }.to_string();

    (status_code, Json(HealthResponse { status, database, broker }))
}
