//! Delivery Handoff (C8): the two-endpoint protocol external CRM-side
//! pollers use to drain `CRON_JOB` audit entries exactly once (spec §4.8).

use std::sync::Arc;

use relay_audit::{AuditError, AuditStore};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Default page size for [`DeliveryHandoff::fetch`] when the caller doesn't
/// specify one (spec §4.8 "capped at `max <= 10_000` (default 1 000)").
pub const DEFAULT_FETCH_MAX: u32 = 1_000;
pub const MAX_FETCH_MAX: u32 = 10_000;

/// Up to this many ids may be marked delivered in one call (spec §4.8).
pub const MAX_MARK_DELIVERED_IDS: usize = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("too many ids: {0} exceeds the {MAX_MARK_DELIVERED_IDS} per-call limit")]
    TooManyIds(usize),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Restrict to a single job `type` (e.g. `pledge`, `oneoff`); `None`
    /// returns all undelivered `CRON_JOB` entries.
    pub type_filter: Option<String>,
    pub max: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkDeliveredRequest {
    pub job_ids: Vec<Ulid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkDeliveredResponse {
    /// The number of rows actually flipped `false -> true`; may be less
    /// than `job_ids.len()` if some were already delivered (P2).
    pub updated: u64,
}

/// Wraps an [`AuditStore`] with the Handoff's fetch/mark-delivered
/// semantics. A thin seam so `relay-daemon`'s HTTP handlers stay pure
/// routing (spec §9 "routing only").
pub struct DeliveryHandoff<S: AuditStore> {
    store: Arc<S>,
}

impl<S: AuditStore> DeliveryHandoff<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Earliest-first page of undelivered `CRON_JOB` entries produced by
    /// the system (spec §4.8 "Fetch"), capped at [`MAX_FETCH_MAX`].
    pub async fn fetch(&self, request: FetchRequest) -> Result<Vec<relay_core::AuditEntry>, HandoffError> {
        let max = request.max.unwrap_or(DEFAULT_FETCH_MAX).min(MAX_FETCH_MAX);
        let entries = self.store.fetch_undelivered(request.type_filter.as_deref(), max).await?;
        Ok(entries)
    }

    /// Conditional compare-and-swap mark-delivered (spec §4.8 "Mark-delivered").
    /// At-most-once: a duplicate or concurrent call against an
    /// already-delivered id contributes 0 to `updated` (P2).
    pub async fn mark_delivered(&self, request: MarkDeliveredRequest) -> Result<MarkDeliveredResponse, HandoffError> {
        if request.job_ids.len() > MAX_MARK_DELIVERED_IDS {
            return Err(HandoffError::TooManyIds(request.job_ids.len()));
        }
        let updated = self.store.mark_delivered(&request.job_ids).await?;
        Ok(MarkDeliveredResponse { updated })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_audit::InMemoryAuditStore;
    use relay_core::{AuditAction, NewAuditEntry};

    fn cron_entry(job_type: &str) -> NewAuditEntry {
        NewAuditEntry {
            action: Some(AuditAction::CronJob),
            method: "CRON".into(),
            endpoint: "/v1/salesforce/pledge-cron-jobs".into(),
            job_type: job_type.into(),
            ip_address: Some("system".into()),
            status_code: 200,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fetch_returns_undelivered_entries_earliest_first() {
        let store = Arc::new(InMemoryAuditStore::new());
        let first = store.create(cron_entry("pledge")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store.create(cron_entry("pledge")).await.unwrap();

        let handoff = DeliveryHandoff::new(store);
        let page = handoff.fetch(FetchRequest { type_filter: None, max: None }).await.unwrap();

        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, first.id);
        assert_eq!(page[1].id, second.id);
    }

    #[tokio::test]
    async fn fetch_honors_type_filter() {
        let store = Arc::new(InMemoryAuditStore::new());
        store.create(cron_entry("pledge")).await.unwrap();
        store.create(cron_entry("oneoff")).await.unwrap();

        let handoff = DeliveryHandoff::new(store);
        let page = handoff.fetch(FetchRequest { type_filter: Some("oneoff".into()), max: None }).await.unwrap();

        assert_eq!(page.len(), 1);
        assert_eq!(page[0].job_type, "oneoff");
    }

    #[tokio::test]
    async fn mark_delivered_is_at_most_once_across_duplicate_requests() {
        let store = Arc::new(InMemoryAuditStore::new());
        let entry = store.create(cron_entry("pledge")).await.unwrap();
        let handoff = DeliveryHandoff::new(store);

        let first = handoff.mark_delivered(MarkDeliveredRequest { job_ids: vec![entry.id] }).await.unwrap();
        let second = handoff.mark_delivered(MarkDeliveredRequest { job_ids: vec![entry.id] }).await.unwrap();

        assert_eq!(first.updated, 1);
        assert_eq!(second.updated, 0);
    }

    #[tokio::test]
    async fn mark_delivered_rejects_oversized_batches() {
        let store = Arc::new(InMemoryAuditStore::new());
        let handoff = DeliveryHandoff::new(store);

        let job_ids: Vec<Ulid> = (0..MAX_MARK_DELIVERED_IDS + 1).map(|_| Ulid::new()).collect();
        let result = handoff.mark_delivered(MarkDeliveredRequest { job_ids }).await;

        assert!(matches!(result, Err(HandoffError::TooManyIds(_))));
    }
}
