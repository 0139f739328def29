//! Cron Job State: the durable enable/disable toggle per job type (spec
//! §4.4 "State store for enable/disable is durable (survives restart)").

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::{PgPool, Row};

#[async_trait]
pub trait CronJobStateStore: Send + Sync {
    /// Defaults to enabled for a job type never explicitly toggled.
    async fn is_enabled(&self, job_type: &str) -> anyhow::Result<bool>;
    async fn set_enabled(&self, job_type: &str, enabled: bool) -> anyhow::Result<()>;
}

/// Single-process stand-in; durability is Postgres's job in production
/// ([`PgCronJobStateStore`]).
#[derive(Default)]
pub struct InMemoryCronJobStateStore {
    state: DashMap<String, bool>,
}

impl InMemoryCronJobStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CronJobStateStore for InMemoryCronJobStateStore {
    async fn is_enabled(&self, job_type: &str) -> anyhow::Result<bool> {
        Ok(*self.state.entry(job_type.to_string()).or_insert(true))
    }

    async fn set_enabled(&self, job_type: &str, enabled: bool) -> anyhow::Result<()> {
        self.state.insert(job_type.to_string(), enabled);
        Ok(())
    }
}

pub struct PgCronJobStateStore {
    pool: PgPool,
}

impl PgCronJobStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CronJobStateStore for PgCronJobStateStore {
    async fn is_enabled(&self, job_type: &str) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT enabled FROM cron_job_state WHERE job_type = $1")
            .bind(job_type)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<bool, _>("enabled")?),
            None => Ok(true),
        }
    }

    async fn set_enabled(&self, job_type: &str, enabled: bool) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO cron_job_state (job_type, enabled) VALUES ($1, $2) \
             ON CONFLICT (job_type) DO UPDATE SET enabled = EXCLUDED.enabled, updated_at = now()",
        )
        .bind(job_type)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_to_enabled() {
        let store = InMemoryCronJobStateStore::new();
        assert!(store.is_enabled("pledge").await.unwrap());
    }

    #[tokio::test]
    async fn toggle_persists_within_the_store() {
        let store = InMemoryCronJobStateStore::new();
        store.set_enabled("pledge", false).await.unwrap();
        assert!(!store.is_enabled("pledge").await.unwrap());
        store.set_enabled("pledge", true).await.unwrap();
        assert!(store.is_enabled("pledge").await.unwrap());
    }
}
