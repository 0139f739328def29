//! Cron control admin routes (spec §6): inspect job definitions/schedules,
//! force an out-of-schedule run, and toggle a job type's enabled state.

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use relay_scheduler::JOB_DEFINITIONS;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

#[derive(Serialize)]
pub struct CronJobView {
    job_type: &'static str,
    queue: &'static str,
    priority: i32,
    delay_ms: u64,
    crm_bound: bool,
}

pub async fn list_cron_jobs() -> Json<Vec<CronJobView>> {
    Json(
        JOB_DEFINITIONS
            .iter()
            .map(|def| CronJobView {
                job_type: def.job_type,
                queue: def.queue.as_str(),
                priority: def.priority,
                delay_ms: def.delay_ms,
                crm_bound: def.crm_bound,
            })
            .collect(),
    )
}

#[derive(Serialize)]
pub struct CronScheduleView {
    job_type: &'static str,
    cron_expr: &'static str,
}

pub async fn cron_schedules() -> Json<Vec<CronScheduleView>> {
    Json(JOB_DEFINITIONS.iter().map(|def| CronScheduleView { job_type: def.job_type, cron_expr: def.cron_expr }).collect())
}

#[derive(Serialize)]
pub struct CronJobStats {
    job_type: &'static str,
    completed_total: u64,
    failed_total: u64,
}

/// Stats are only tracked in detail for the `salesforce` worker pool (spec
/// §4.7); other job types report zero counters rather than a fabricated
/// per-job-type breakdown the system doesn't keep.
pub async fn cron_stats(Extension(state): Extension<AppState>) -> Json<Vec<CronJobStats>> {
    Json(
        JOB_DEFINITIONS
            .iter()
            .map(|def| {
                if def.crm_bound {
                    CronJobStats {
                        job_type: def.job_type,
                        completed_total: state.salesforce_metrics.completed_total(),
                        failed_total: state.salesforce_metrics.failed_total(),
                    }
                } else {
                    CronJobStats { job_type: def.job_type, completed_total: 0, failed_total: 0 }
                }
            })
            .collect(),
    )
}

#[derive(Serialize)]
pub struct CronJobState {
    job_type: &'static str,
    enabled: bool,
}

pub async fn cron_states(Extension(state): Extension<AppState>) -> Result<Json<Vec<CronJobState>>, (StatusCode, String)> {
    let mut out = Vec::with_capacity(JOB_DEFINITIONS.len());
    for def in JOB_DEFINITIONS.iter() {
        let enabled = state.cron_state.is_enabled(def.job_type).await.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        out.push(CronJobState { job_type: def.job_type, enabled });
    }
    Ok(Json(out))
}

pub async fn run_cron_job_now(Extension(state): Extension<AppState>, Path(job_type): Path<String>) -> Result<StatusCode, StatusCode> {
    if state.scheduler.run_now(&job_type).await {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

#[derive(Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

pub async fn toggle_cron_job(
    Extension(state): Extension<AppState>,
    Path(job_type): Path<String>,
    Json(body): Json<ToggleRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    if !JOB_DEFINITIONS.iter().any(|d| d.job_type == job_type) {
        return Err((StatusCode::NOT_FOUND, format!("no such job type {job_type}")));
    }
    state.cron_state.set_enabled(&job_type, body.enabled).await.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}
