//! The Job record: the persistent unit of work tracked by the Job Store (C1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Job`].
///
/// Transitions are monotonic along `Queued -> Processing -> {Completed | Failed}`,
/// with `Failed -> Processing` permitted on retry. Backwards transitions (e.g.
/// `Completed -> Processing`) are rejected by the store, never by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether `self -> next` is a legal transition per the state machine in
    /// spec §4.1.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing) | (Processing, Completed) | (Processing, Failed) | (Failed, Processing)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A scheduled/processed job attempt, keyed by `idempotency_key`.
///
/// Owned exclusively by the Batched Audit Writer's (C5) flush pipeline once
/// created; workers never mutate this row directly (spec §4.5 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub idempotency_key: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub crm_response: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted by [`crate::store::JobStore::create`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub idempotency_key: String,
    pub payload: serde_json::Value,
}

/// A merge-patch applied atomically by the Batched Audit Writer (C5).
///
/// `attempts` is always incremented by one per applied patch; it is never
/// set to an absolute value, keeping the "monotonically non-decreasing"
/// invariant trivially true regardless of patch ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPatch {
    pub idempotency_key: String,
    pub status: JobStatus,
    pub crm_response: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Processing));
    }

    #[test]
    fn illegal_transitions_rejected() {
        use JobStatus::*;
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Queued));
    }

    #[test]
    fn display_matches_status_strings() {
        assert_eq!(JobStatus::Queued.to_string(), "queued");
        assert_eq!(JobStatus::Processing.to_string(), "processing");
        assert_eq!(JobStatus::Completed.to_string(), "completed");
        assert_eq!(JobStatus::Failed.to_string(), "failed");
    }
}
