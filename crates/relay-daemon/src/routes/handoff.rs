//! Delivery Handoff routes (spec §6): the two CRM-polled "fetch, then
//! flip" endpoints plus the standalone mark-delivered endpoint.

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::Json;
use relay_core::AuditEntry;
use relay_handoff::{FetchRequest, MarkDeliveredRequest, MarkDeliveredResponse};
use serde::Deserialize;

use crate::state::AppState;

#[derive(Deserialize)]
pub struct HandoffQuery {
    pub max: Option<u32>,
}

async fn fetch_and_flip(state: &AppState, job_type: &str, max: Option<u32>) -> Result<Vec<AuditEntry>, (StatusCode, String)> {
    let entries = state
        .handoff
        .fetch(FetchRequest { type_filter: Some(job_type.to_string()), max })
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if !entries.is_empty() {
        let job_ids = entries.iter().map(|e| e.id).collect();
        if let Err(err) = state.handoff.mark_delivered(MarkDeliveredRequest { job_ids }).await {
            tracing::error!(job_type, error = %err, "delivery handoff: mark-delivered failed after fetch");
        }
    }

    Ok(entries)
}

/// `GET /v1/:crm/pledge-cron-jobs`. `crm` identifies the caller, not a
/// routing key; every CRM polls the same underlying `pledge` job type.
pub async fn pledge_cron_jobs(
    Extension(state): Extension<AppState>,
    Path(_crm): Path<String>,
    Query(params): Query<HandoffQuery>,
) -> Result<Json<Vec<AuditEntry>>, (StatusCode, String)> {
    fetch_and_flip(&state, "pledge", params.max).await.map(Json)
}

pub async fn oneoff_cron_jobs(
    Extension(state): Extension<AppState>,
    Path(_crm): Path<String>,
    Query(params): Query<HandoffQuery>,
) -> Result<Json<Vec<AuditEntry>>, (StatusCode, String)> {
    fetch_and_flip(&state, "oneoff", params.max).await.map(Json)
}

pub async fn mark_delivered(
    Extension(state): Extension<AppState>,
    Json(request): Json<MarkDeliveredRequest>,
) -> Result<Json<MarkDeliveredResponse>, (StatusCode, String)> {
    state.handoff.mark_delivered(request).await.map(Json).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
