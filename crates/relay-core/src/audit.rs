//! The Audit Entry record: the append-only unit tracked by the Audit/Event Log (C6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Action tag recorded on every audit entry.
///
/// `CronJob` entries are the ones the Delivery Handoff (C8) hands to external
/// pollers; the rest are observability-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    CronJob,
    JobStarted,
    JobScheduled,
    JobCompleted,
    JobFailed,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditAction::CronJob => "CRON_JOB",
            AuditAction::JobStarted => "JOB_STARTED",
            AuditAction::JobScheduled => "JOB_SCHEDULED",
            AuditAction::JobCompleted => "JOB_COMPLETED",
            AuditAction::JobFailed => "JOB_FAILED",
        };
        write!(f, "{s}")
    }
}

/// Status codes used on audit entries (spec §6): 202 started, 200 completed,
/// 500 failed. Kept as plain `i32` rather than a wrapping enum since the
/// audit log stores whatever the producer passes through.
pub mod status_code {
    pub const STARTED: i32 = 202;
    pub const COMPLETED: i32 = 200;
    pub const FAILED: i32 = 500;
}

/// An immutable (save for the single `is_delivered: false -> true` transition)
/// record of an API/job/scheduler event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Ulid,
    pub user_id: Option<uuid::Uuid>,
    pub api_key_id: Option<uuid::Uuid>,
    pub action: AuditAction,
    pub method: String,
    pub endpoint: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub reference_id: Option<String>,
    pub external_id: Option<String>,
    pub status_code: i32,
    pub status_message: Option<String>,
    pub request_data: Option<serde_json::Value>,
    pub response_data: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub duration_ms: Option<i64>,
    pub is_delivered: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields accepted when creating a new entry; `id`/`created_at` are assigned
/// by the store, `is_delivered` defaults per spec §3 (false for `CronJob`
/// entries, caller-specified otherwise).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewAuditEntry {
    pub user_id: Option<uuid::Uuid>,
    pub api_key_id: Option<uuid::Uuid>,
    pub action: Option<AuditAction>,
    pub method: String,
    pub endpoint: String,
    pub job_type: String,
    pub reference_id: Option<String>,
    pub external_id: Option<String>,
    pub status_code: i32,
    pub status_message: Option<String>,
    pub request_data: Option<serde_json::Value>,
    pub response_data: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub duration_ms: Option<i64>,
    pub is_delivered: Option<bool>,
}

impl NewAuditEntry {
    /// Resolve the `is_delivered` default: `false` for `CRON_JOB` entries
    /// (so the Handoff can later deliver them), caller-specified otherwise.
    pub fn resolved_is_delivered(&self) -> bool {
        self.is_delivered.unwrap_or(!matches!(self.action, Some(AuditAction::CronJob)))
    }
}
