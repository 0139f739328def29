//! Job Store (C1): the persistent record of every scheduled/processed job
//! attempt, keyed by `idempotency_key`.
//!
//! The store trait is the seam: the Scheduler (C4) calls [`JobStore::create`]
//! and treats `DuplicateKey` as "already scheduled, skip" (P3); the Batched
//! Audit Writer (C5) is the sole caller of [`JobStore::apply_patch`] (spec
//! §4.5 invariant, P6).

use async_trait::async_trait;
use chrono::Utc;
use relay_core::{Job, JobPatch, JobStatus, NewJob};

mod postgres;
pub use postgres::PgJobStore;

/// Errors raised by the Job Store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `create()` was called with an `idempotency_key` that already exists.
    #[error("job already exists for idempotency key {0}")]
    DuplicateKey(String),

    /// A patch attempted an illegal status transition (spec §4.1); rejected
    /// rather than silently applied.
    #[error("illegal status transition for {idempotency_key}: {from} -> {to}")]
    InvalidTransition {
        idempotency_key: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Contract for claiming and mutating jobs from persistent storage (spec §4.1).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a new job row. Fails with [`StoreError::DuplicateKey`] if the
    /// key already exists; the Scheduler treats this as "already scheduled,
    /// skip" rather than an error to propagate.
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError>;

    /// Atomically merge a patch onto the row matched by
    /// `patch.idempotency_key`: sets `status`, `crm_response`,
    /// `error_message`, increments `attempts` by one, and bumps `updated_at`.
    ///
    /// Returns `Ok(None)` (logged, not an error) if the key is missing, per
    /// spec §4.1 "no-op if key missing (logged)". Returns
    /// [`StoreError::InvalidTransition`] if `patch.status` is not reachable
    /// from the row's current status.
    async fn apply_patch(&self, patch: JobPatch) -> Result<Option<Job>, StoreError>;

    /// Read a job by its idempotency key.
    async fn get(&self, idempotency_key: &str) -> Result<Option<Job>, StoreError>;

    /// Apply a batch of patches as a single unit (spec §4.5 flush algorithm:
    /// "open a single DB transaction containing one update per buffered
    /// record"). The default implementation applies patches one at a time
    /// and is only atomic per-row; [`PgJobStore`] overrides this with a real
    /// transaction spanning the whole batch.
    async fn apply_patch_batch(&self, patches: Vec<JobPatch>) -> Result<Vec<(String, Result<Option<Job>, StoreError>)>, StoreError> {
        let mut results = Vec::with_capacity(patches.len());
        for patch in patches {
            let key = patch.idempotency_key.clone();
            let outcome = self.apply_patch(patch).await;
            results.push((key, outcome));
        }
        Ok(results)
    }
}

/// In-memory store for unit tests and the in-process daemon dry-run mode.
#[derive(Default)]
pub struct InMemoryJobStore {
    rows: tokio::sync::Mutex<std::collections::HashMap<String, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&new_job.idempotency_key) {
            return Err(StoreError::DuplicateKey(new_job.idempotency_key));
        }
        let now = Utc::now();
        let job = Job {
            idempotency_key: new_job.idempotency_key.clone(),
            payload: new_job.payload,
            status: JobStatus::Queued,
            attempts: 0,
            crm_response: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        rows.insert(new_job.idempotency_key, job.clone());
        Ok(job)
    }

    async fn apply_patch(&self, patch: JobPatch) -> Result<Option<Job>, StoreError> {
        let mut rows = self.rows.lock().await;
        let Some(job) = rows.get_mut(&patch.idempotency_key) else {
            tracing::warn!(idempotency_key = %patch.idempotency_key, "apply_patch: no such job, skipping");
            return Ok(None);
        };
        if !job.status.can_transition_to(patch.status) {
            return Err(StoreError::InvalidTransition {
                idempotency_key: patch.idempotency_key,
                from: job.status,
                to: patch.status,
            });
        }
        job.status = patch.status;
        job.crm_response = patch.crm_response;
        job.error_message = patch.error_message;
        job.attempts += 1;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn get(&self, idempotency_key: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.rows.lock().await.get(idempotency_key).cloned())
    }
}
