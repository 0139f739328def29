use async_trait::async_trait;
use relay_core::{Job, JobPatch, JobStatus, NewJob};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::{JobStore, StoreError};

/// Apply a single patch within an already-open transaction, without
/// committing. Shared by [`PgJobStore::apply_patch`] (single-row
/// transaction) and [`PgJobStore::apply_patch_batch`] (one transaction
/// spanning the whole flush, spec §4.5).
async fn apply_one_in_tx(tx: &mut Transaction<'_, Postgres>, patch: JobPatch) -> Result<Option<Job>, StoreError> {
    let current = sqlx::query(
        "SELECT idempotency_key, payload, status, attempts, crm_response, error_message, created_at, updated_at \
         FROM jobs WHERE idempotency_key = $1 FOR UPDATE",
    )
    .bind(&patch.idempotency_key)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| StoreError::Backend(e.into()))?;

    let Some(current_row) = current else {
        tracing::warn!(idempotency_key = %patch.idempotency_key, "apply_patch: no such job, skipping");
        return Ok(None);
    };
    let current_job = row_to_job(&current_row)?;

    if !current_job.status.can_transition_to(patch.status) {
        return Err(StoreError::InvalidTransition {
            idempotency_key: patch.idempotency_key,
            from: current_job.status,
            to: patch.status,
        });
    }

    let status_str = patch.status.to_string();
    let updated = sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2, crm_response = $3, error_message = $4, attempts = attempts + 1, updated_at = now()
        WHERE idempotency_key = $1
        RETURNING idempotency_key, payload, status, attempts, crm_response, error_message, created_at, updated_at
        "#,
    )
    .bind(&patch.idempotency_key)
    .bind(&status_str)
    .bind(&patch.crm_response)
    .bind(&patch.error_message)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| StoreError::Backend(e.into()))?;

    Ok(Some(row_to_job(&updated)?))
}

/// Postgres-backed [`JobStore`], following the teacher's `sqlx::PgPool` +
/// row-to-domain-type mapping idiom.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run pending migrations. Called once at daemon startup, before the
    /// scheduler or any worker loop starts.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    let status_str: String = row.try_get("status").map_err(|e| StoreError::Backend(e.into()))?;
    let status = match status_str.as_str() {
        "queued" => JobStatus::Queued,
        "processing" => JobStatus::Processing,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        other => return Err(StoreError::Backend(anyhow::anyhow!("unknown job status in row: {other}"))),
    };
    Ok(Job {
        idempotency_key: row.try_get("idempotency_key").map_err(|e| StoreError::Backend(e.into()))?,
        payload: row.try_get("payload").map_err(|e| StoreError::Backend(e.into()))?,
        status,
        attempts: row.try_get("attempts").map_err(|e| StoreError::Backend(e.into()))?,
        crm_response: row.try_get("crm_response").map_err(|e| StoreError::Backend(e.into()))?,
        error_message: row.try_get("error_message").map_err(|e| StoreError::Backend(e.into()))?,
        created_at: row.try_get("created_at").map_err(|e| StoreError::Backend(e.into()))?,
        updated_at: row.try_get("updated_at").map_err(|e| StoreError::Backend(e.into()))?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (idempotency_key, payload, status, attempts)
            VALUES ($1, $2, 'queued', 0)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING idempotency_key, payload, status, attempts, crm_response, error_message, created_at, updated_at
            "#,
        )
        .bind(&new_job.idempotency_key)
        .bind(&new_job.payload)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        match result {
            Some(row) => row_to_job(&row),
            None => Err(StoreError::DuplicateKey(new_job.idempotency_key)),
        }
    }

    async fn apply_patch(&self, patch: JobPatch) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.into()))?;
        let result = apply_one_in_tx(&mut tx, patch).await?;
        tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
        Ok(result)
    }

    async fn apply_patch_batch(&self, patches: Vec<JobPatch>) -> Result<Vec<(String, Result<Option<Job>, StoreError>)>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.into()))?;
        let mut results = Vec::with_capacity(patches.len());

        // Each row is wrapped in its own savepoint so one job's InvalidTransition
        // doesn't poison the rest of the batch's statements.
        for (i, patch) in patches.into_iter().enumerate() {
            let key = patch.idempotency_key.clone();
            let savepoint = format!("sp_{i}");
            sqlx::query(&format!("SAVEPOINT {savepoint}")).execute(&mut *tx).await.map_err(|e| StoreError::Backend(e.into()))?;
            let outcome = apply_one_in_tx(&mut tx, patch).await;
            if outcome.is_err() {
                sqlx::query(&format!("ROLLBACK TO SAVEPOINT {savepoint}"))
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Backend(e.into()))?;
            }
            results.push((key, outcome));
        }

        tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
        Ok(results)
    }

    async fn get(&self, idempotency_key: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            "SELECT idempotency_key, payload, status, attempts, crm_response, error_message, created_at, updated_at \
             FROM jobs WHERE idempotency_key = $1",
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        row.as_ref().map(row_to_job).transpose()
    }
}
