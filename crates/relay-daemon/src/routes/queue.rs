//! Queue management admin routes (spec §6): list/inspect/retry/remove
//! queue items, pause/resume/clear a named queue, aggregate counts, and
//! the audit-log export endpoint.

use std::collections::HashMap;

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::Json;
use relay_core::QueueName;
use relay_queue::types::ItemState;
use relay_queue::QueuedItem;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

fn parse_queue_name(raw: &str) -> Option<QueueName> {
    match raw {
        "salesforce" => Some(QueueName::Salesforce),
        "email" => Some(QueueName::Email),
        "notifications" => Some(QueueName::Notifications),
        _ => None,
    }
}

fn parse_item_state(raw: &str) -> Option<ItemState> {
    match raw {
        "waiting" => Some(ItemState::Waiting),
        "active" => Some(ItemState::Active),
        "completed" => Some(ItemState::Completed),
        "failed" => Some(ItemState::Failed),
        "delayed" => Some(ItemState::Delayed),
        "paused" => Some(ItemState::Paused),
        _ => None,
    }
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    pub queue: String,
    pub status: Option<String>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Serialize)]
pub struct ListJobsResponse {
    pub items: Vec<QueuedItem>,
}

pub async fn list_jobs(
    Extension(state): Extension<AppState>,
    Query(params): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, (StatusCode, String)> {
    let queue = parse_queue_name(&params.queue).ok_or((StatusCode::BAD_REQUEST, format!("unknown queue {}", params.queue)))?;
    let item_state = params
        .status
        .as_deref()
        .map(parse_item_state)
        .unwrap_or(Some(ItemState::Waiting))
        .ok_or((StatusCode::BAD_REQUEST, "unknown status".to_string()))?;

    let items = state
        .broker
        .list(queue, item_state, params.offset.unwrap_or(0), params.limit.unwrap_or(50))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(ListJobsResponse { items }))
}

#[derive(Deserialize)]
pub struct QueueParam {
    pub queue: String,
}

pub async fn get_job(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Query(params): Query<QueueParam>,
) -> Result<Json<QueuedItem>, (StatusCode, String)> {
    let queue = parse_queue_name(&params.queue).ok_or((StatusCode::BAD_REQUEST, format!("unknown queue {}", params.queue)))?;
    let item = state.broker.get(queue, &id).await.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    item.map(Json).ok_or((StatusCode::NOT_FOUND, format!("no such item {id}")))
}

pub async fn retry_job(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Query(params): Query<QueueParam>,
) -> Result<StatusCode, (StatusCode, String)> {
    let queue = parse_queue_name(&params.queue).ok_or((StatusCode::BAD_REQUEST, format!("unknown queue {}", params.queue)))?;
    state.broker.retry(queue, &id).await.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_job(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Query(params): Query<QueueParam>,
) -> Result<StatusCode, (StatusCode, String)> {
    let queue = parse_queue_name(&params.queue).ok_or((StatusCode::BAD_REQUEST, format!("unknown queue {}", params.queue)))?;
    state.broker.remove(queue, &id).await.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pause_queue(Extension(state): Extension<AppState>, Path(name): Path<String>) -> Result<StatusCode, (StatusCode, String)> {
    let queue = parse_queue_name(&name).ok_or((StatusCode::BAD_REQUEST, format!("unknown queue {name}")))?;
    state.broker.pause(queue).await.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn resume_queue(Extension(state): Extension<AppState>, Path(name): Path<String>) -> Result<StatusCode, (StatusCode, String)> {
    let queue = parse_queue_name(&name).ok_or((StatusCode::BAD_REQUEST, format!("unknown queue {name}")))?;
    state.broker.resume(queue).await.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn clear_queue(Extension(state): Extension<AppState>, Path(name): Path<String>) -> Result<StatusCode, (StatusCode, String)> {
    let queue = parse_queue_name(&name).ok_or((StatusCode::BAD_REQUEST, format!("unknown queue {name}")))?;
    state.broker.obliterate(queue).await.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn queue_counts(Extension(state): Extension<AppState>) -> Result<Json<HashMap<String, relay_queue::QueueCounts>>, (StatusCode, String)> {
    let mut out = HashMap::new();
    for queue in QueueName::ALL {
        let counts = state.broker.counts(queue).await.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        out.insert(queue.as_str().to_string(), counts);
    }
    Ok(Json(out))
}

#[derive(Serialize)]
pub struct PerformanceResponse {
    pub completed_total: u64,
    pub failed_total: u64,
    pub avg_processing_ms: Option<f64>,
}

pub async fn queue_performance(Extension(state): Extension<AppState>) -> Json<PerformanceResponse> {
    Json(PerformanceResponse {
        completed_total: state.salesforce_metrics.completed_total(),
        failed_total: state.salesforce_metrics.failed_total(),
        avg_processing_ms: state.salesforce_metrics.avg_processing_ms().await,
    })
}

#[derive(Deserialize)]
pub struct ExportRequest {
    pub format: String,
    #[serde(default)]
    pub filter: Option<relay_audit_filter_shim::AuditFilterWire>,
}

/// A wire-shape mirror of [`relay_audit::AuditFilter`] so the export route
/// can deserialise a JSON body without requiring every field to round-trip
/// through `serde` on the core type itself.
mod relay_audit_filter_shim {
    use serde::Deserialize;

    #[derive(Deserialize, Default)]
    pub struct AuditFilterWire {
        pub action: Option<String>,
        pub method: Option<String>,
        pub status_code: Option<i32>,
        pub search: Option<String>,
    }
}

pub async fn export_audit_log(
    Extension(state): Extension<AppState>,
    Json(request): Json<ExportRequest>,
) -> Result<(StatusCode, Vec<u8>), (StatusCode, String)> {
    let format = match request.format.as_str() {
        "csv" => relay_audit::export::ExportFormat::Csv,
        "json" => relay_audit::export::ExportFormat::Json,
        "xlsx" => relay_audit::export::ExportFormat::Xlsx,
        other => return Err((StatusCode::BAD_REQUEST, format!("unknown export format {other}"))),
    };

    let wire = request.filter.unwrap_or_default();
    let filter = relay_audit::AuditFilter {
        action: wire.action,
        method: wire.method,
        status_code: wire.status_code,
        search: wire.search,
        ..Default::default()
    };

    let bytes = relay_audit::export::export(state.audit.as_ref(), &filter, format, None)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok((StatusCode::OK, bytes))
}
