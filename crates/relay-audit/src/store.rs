//! Audit/Event Log (C6) store contract, plus an in-memory implementation
//! used by unit tests and `relay-testkit`-style fakes elsewhere in the
//! workspace.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use relay_core::{AuditAction, AuditEntry, NewAuditEntry};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::query::{
    AuditFilter, AuditQueryResult, ColumnFilter, ColumnOperator, HourlyBucket, StatusClassHistogram, TopBucket,
    CRM_METHODS, CRON_METHODS, SEARCH_COLUMNS,
};

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit entry {0} not found")]
    NotFound(String),

    #[error("audit store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Contract for the append-only Audit/Event Log (spec §3 "Audit Entry", §4.6).
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append a new entry. `id`/`created_at` are assigned by the store;
    /// `is_delivered` resolves via [`NewAuditEntry::resolved_is_delivered`].
    async fn create(&self, entry: NewAuditEntry) -> Result<AuditEntry, AuditError>;

    async fn get(&self, id: Ulid) -> Result<Option<AuditEntry>, AuditError>;

    /// General filtered/paginated query (spec §4.6).
    async fn query(&self, filter: &AuditFilter) -> Result<AuditQueryResult, AuditError>;

    /// The Salesforce-scoped view: `method in CRM_METHODS` OR
    /// (`action == "CRON_JOB"` AND `method in CRON_METHODS`), spec §4.6.
    async fn query_salesforce_scoped(&self, filter: &AuditFilter) -> Result<AuditQueryResult, AuditError>;

    async fn status_class_histogram(&self, filter: &AuditFilter) -> Result<StatusClassHistogram, AuditError>;
    async fn top_actions(&self, n: usize) -> Result<Vec<TopBucket>, AuditError>;
    async fn top_methods(&self, n: usize) -> Result<Vec<TopBucket>, AuditError>;
    async fn hourly_histogram(&self) -> Result<Vec<HourlyBucket>, AuditError>;

    /// Earliest-first page of undelivered `CRON_JOB` entries produced by the
    /// system (spec §4.8 "Fetch"): `{action: CRON_JOB, is_delivered: false,
    /// ip_address: "system", type: <filter>?}`, capped at `max <= 10_000`.
    async fn fetch_undelivered(&self, type_filter: Option<&str>, max: u32) -> Result<Vec<AuditEntry>, AuditError>;

    /// Conditionally flip `is_delivered: false -> true` for up to 1 000 ids
    /// (spec §4.8 "Mark-delivered"); returns the number actually updated.
    /// Safe under concurrent/duplicate calls: P2 at-most-once delivery.
    async fn mark_delivered(&self, ids: &[Ulid]) -> Result<u64, AuditError>;

    /// Paged export cursor: yields rows in `batch_size`-row chunks without
    /// materialising the whole result set (spec §4.6 "Export").
    async fn export_page(&self, filter: &AuditFilter, offset: u64, batch_size: u64) -> Result<Vec<AuditEntry>, AuditError>;
}

/// In-memory [`AuditStore`], mirroring the teacher's in-process test-double
/// pattern for store traits.
#[derive(Default)]
pub struct InMemoryAuditStore {
    rows: Mutex<HashMap<Ulid, AuditEntry>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_search(entry: &AuditEntry, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    SEARCH_COLUMNS
        .iter()
        .filter_map(|field| column_value_as_str(entry, field))
        .any(|haystack| haystack.to_lowercase().contains(&needle))
}

fn column_value_as_str(entry: &AuditEntry, field: &str) -> Option<String> {
    Some(match field {
        "action" => entry.action.to_string(),
        "method" => entry.method.clone(),
        "endpoint" => entry.endpoint.clone(),
        "type" => entry.job_type.clone(),
        "reference_id" => entry.reference_id.clone()?,
        "external_id" => entry.external_id.clone()?,
        "status_message" => entry.status_message.clone()?,
        "ip_address" => entry.ip_address.clone()?,
        "user_agent" => entry.user_agent.clone()?,
        _ => return None,
    })
}

fn column_value_as_i64(entry: &AuditEntry, field: &str) -> Option<i64> {
    match field {
        "status_code" => Some(entry.status_code as i64),
        "duration_ms" => entry.duration_ms,
        _ => None,
    }
}

fn matches_column_filter(entry: &AuditEntry, filter: &ColumnFilter) -> bool {
    match filter.operator {
        ColumnOperator::Equals => match column_value_as_str(entry, &filter.field) {
            Some(v) => filter.value.as_str().map(|want| v == want).unwrap_or(false),
            None => false,
        },
        ColumnOperator::Contains => match column_value_as_str(entry, &filter.field) {
            Some(v) => filter.value.as_str().map(|want| v.to_lowercase().contains(&want.to_lowercase())).unwrap_or(false),
            None => false,
        },
        ColumnOperator::StartsWith => match column_value_as_str(entry, &filter.field) {
            Some(v) => filter.value.as_str().map(|want| v.starts_with(want)).unwrap_or(false),
            None => false,
        },
        ColumnOperator::EndsWith => match column_value_as_str(entry, &filter.field) {
            Some(v) => filter.value.as_str().map(|want| v.ends_with(want)).unwrap_or(false),
            None => false,
        },
        ColumnOperator::In => match column_value_as_str(entry, &filter.field) {
            Some(v) => filter.value.as_array().map(|arr| arr.iter().any(|x| x.as_str() == Some(v.as_str()))).unwrap_or(false),
            None => false,
        },
        ColumnOperator::NotIn => match column_value_as_str(entry, &filter.field) {
            Some(v) => filter.value.as_array().map(|arr| !arr.iter().any(|x| x.as_str() == Some(v.as_str()))).unwrap_or(true),
            None => true,
        },
        ColumnOperator::Range => {
            let Some(v) = column_value_as_i64(entry, &filter.field) else { return false };
            let Some(arr) = filter.value.as_array() else { return false };
            let lo = arr.first().and_then(|x| x.as_i64());
            let hi = arr.get(1).and_then(|x| x.as_i64());
            lo.map(|lo| v >= lo).unwrap_or(true) && hi.map(|hi| v <= hi).unwrap_or(true)
        }
        ColumnOperator::Gt => column_value_as_i64(entry, &filter.field).zip(filter.value.as_i64()).map(|(v, want)| v > want).unwrap_or(false),
        ColumnOperator::Gte => column_value_as_i64(entry, &filter.field).zip(filter.value.as_i64()).map(|(v, want)| v >= want).unwrap_or(false),
        ColumnOperator::Lt => column_value_as_i64(entry, &filter.field).zip(filter.value.as_i64()).map(|(v, want)| v < want).unwrap_or(false),
        ColumnOperator::Lte => column_value_as_i64(entry, &filter.field).zip(filter.value.as_i64()).map(|(v, want)| v <= want).unwrap_or(false),
    }
}

/// Column filters on the same field OR together; different fields AND
/// together (spec §4.6).
fn matches_column_filters(entry: &AuditEntry, filters: &[ColumnFilter]) -> bool {
    let mut by_field: HashMap<&str, Vec<&ColumnFilter>> = HashMap::new();
    for f in filters {
        by_field.entry(f.field.as_str()).or_default().push(f);
    }
    by_field.values().all(|group| group.iter().any(|f| matches_column_filter(entry, f)))
}

fn matches_filter(entry: &AuditEntry, filter: &AuditFilter) -> bool {
    if let Some(user_id) = filter.user_id {
        if entry.user_id != Some(user_id) {
            return false;
        }
    }
    if let Some(api_key_id) = filter.api_key_id {
        if entry.api_key_id != Some(api_key_id) {
            return false;
        }
    }
    if let Some(action) = &filter.action {
        if entry.action.to_string() != *action {
            return false;
        }
    }
    if let Some(method) = &filter.method {
        if &entry.method != method {
            return false;
        }
    }
    if let Some(status_code) = filter.status_code {
        if entry.status_code != status_code {
            return false;
        }
    }
    if let Some(start) = filter.start_date {
        if entry.created_at < start {
            return false;
        }
    }
    if let Some(end) = filter.end_date {
        if entry.created_at > end {
            return false;
        }
    }
    if let Some(is_delivered) = filter.is_delivered {
        if entry.is_delivered != is_delivered {
            return false;
        }
    }
    if let Some(search) = &filter.search {
        if !matches_search(entry, search) {
            return false;
        }
    }
    if !matches_column_filters(entry, &filter.column_filters) {
        return false;
    }
    true
}

fn is_salesforce_scoped(entry: &AuditEntry) -> bool {
    let method_upper = entry.method.to_uppercase();
    CRM_METHODS.contains(&method_upper.as_str())
        || (entry.action == AuditAction::CronJob && CRON_METHODS.contains(&method_upper.as_str()))
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn create(&self, entry: NewAuditEntry) -> Result<AuditEntry, AuditError> {
        let is_delivered = entry.resolved_is_delivered();
        let action = entry.action.unwrap_or(AuditAction::JobStarted);
        let record = AuditEntry {
            id: Ulid::new(),
            user_id: entry.user_id,
            api_key_id: entry.api_key_id,
            action,
            method: entry.method,
            endpoint: entry.endpoint,
            job_type: entry.job_type,
            reference_id: entry.reference_id,
            external_id: entry.external_id,
            status_code: entry.status_code,
            status_message: entry.status_message,
            request_data: entry.request_data,
            response_data: entry.response_data,
            ip_address: entry.ip_address,
            user_agent: entry.user_agent,
            duration_ms: entry.duration_ms,
            is_delivered,
            created_at: Utc::now(),
        };
        self.rows.lock().await.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Ulid) -> Result<Option<AuditEntry>, AuditError> {
        Ok(self.rows.lock().await.get(&id).cloned())
    }

    async fn query(&self, filter: &AuditFilter) -> Result<AuditQueryResult, AuditError> {
        let filter = filter.clone().normalized();
        let rows = self.rows.lock().await;
        let mut matched: Vec<AuditEntry> = rows.values().filter(|e| matches_filter(e, &filter)).cloned().collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matched.len() as u64;
        let offset = filter.offset() as usize;
        let items = matched.into_iter().skip(offset).take(filter.limit as usize).collect();
        Ok(AuditQueryResult { items, total, page: filter.page, limit: filter.limit })
    }

    async fn query_salesforce_scoped(&self, filter: &AuditFilter) -> Result<AuditQueryResult, AuditError> {
        let filter = filter.clone().normalized();
        let rows = self.rows.lock().await;
        let mut matched: Vec<AuditEntry> =
            rows.values().filter(|e| matches_filter(e, &filter) && is_salesforce_scoped(e)).cloned().collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matched.len() as u64;
        let offset = filter.offset() as usize;
        let items = matched.into_iter().skip(offset).take(filter.limit as usize).collect();
        Ok(AuditQueryResult { items, total, page: filter.page, limit: filter.limit })
    }

    async fn status_class_histogram(&self, filter: &AuditFilter) -> Result<StatusClassHistogram, AuditError> {
        let rows = self.rows.lock().await;
        let mut hist = StatusClassHistogram::default();
        for entry in rows.values().filter(|e| matches_filter(e, filter)) {
            if (200..300).contains(&entry.status_code) {
                hist.success += 1;
            } else if entry.status_code >= 400 {
                hist.error += 1;
            }
        }
        Ok(hist)
    }

    async fn top_actions(&self, n: usize) -> Result<Vec<TopBucket>, AuditError> {
        let rows = self.rows.lock().await;
        Ok(top_n_by(rows.values().map(|e| e.action.to_string()), n))
    }

    async fn top_methods(&self, n: usize) -> Result<Vec<TopBucket>, AuditError> {
        let rows = self.rows.lock().await;
        Ok(top_n_by(rows.values().map(|e| e.method.clone()), n))
    }

    async fn hourly_histogram(&self) -> Result<Vec<HourlyBucket>, AuditError> {
        let rows = self.rows.lock().await;
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let mut buckets: HashMap<DateTime<Utc>, u64> = HashMap::new();
        for entry in rows.values().filter(|e| e.created_at >= cutoff) {
            let hour = entry.created_at.date_naive().and_hms_opt(entry.created_at.time().hour(), 0, 0).unwrap().and_utc();
            *buckets.entry(hour).or_insert(0) += 1;
        }
        let mut out: Vec<HourlyBucket> = buckets.into_iter().map(|(hour, count)| HourlyBucket { hour, count }).collect();
        out.sort_by_key(|b| b.hour);
        Ok(out)
    }

    async fn fetch_undelivered(&self, type_filter: Option<&str>, max: u32) -> Result<Vec<AuditEntry>, AuditError> {
        let max = max.min(10_000);
        let rows = self.rows.lock().await;
        let mut matched: Vec<AuditEntry> = rows
            .values()
            .filter(|e| {
                e.action == AuditAction::CronJob
                    && !e.is_delivered
                    && e.ip_address.as_deref() == Some("system")
                    && type_filter.map(|t| e.job_type == t).unwrap_or(true)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        matched.truncate(max as usize);
        Ok(matched)
    }

    async fn mark_delivered(&self, ids: &[Ulid]) -> Result<u64, AuditError> {
        let mut rows = self.rows.lock().await;
        let mut updated = 0u64;
        for id in ids.iter().take(1000) {
            if let Some(entry) = rows.get_mut(id) {
                if !entry.is_delivered {
                    entry.is_delivered = true;
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn export_page(&self, filter: &AuditFilter, offset: u64, batch_size: u64) -> Result<Vec<AuditEntry>, AuditError> {
        let rows = self.rows.lock().await;
        let mut matched: Vec<AuditEntry> = rows.values().filter(|e| matches_filter(e, filter)).cloned().collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched.into_iter().skip(offset as usize).take(batch_size as usize).collect())
    }
}

fn top_n_by(iter: impl Iterator<Item = String>, n: usize) -> Vec<TopBucket> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for key in iter {
        *counts.entry(key).or_insert(0) += 1;
    }
    let mut buckets: Vec<TopBucket> = counts.into_iter().map(|(key, count)| TopBucket { key, count }).collect();
    buckets.sort_by(|a, b| b.count.cmp(&a.count));
    buckets.truncate(n);
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::AuditAction;
    use serde_json::json;

    fn new_entry(action: AuditAction, method: &str, is_delivered: Option<bool>) -> NewAuditEntry {
        NewAuditEntry {
            action: Some(action),
            method: method.to_string(),
            endpoint: "/core/pledge/v2.0/".to_string(),
            job_type: "pledge".to_string(),
            status_code: 200,
            is_delivered,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = InMemoryAuditStore::new();
        let entry = store.create(new_entry(AuditAction::JobStarted, "POST", None)).await.unwrap();
        let fetched = store.get(entry.id).await.unwrap().unwrap();
        assert_eq!(fetched.action, AuditAction::JobStarted);
    }

    #[tokio::test]
    async fn cron_job_entries_default_undelivered_in_store() {
        let store = InMemoryAuditStore::new();
        let entry = store.create(new_entry(AuditAction::CronJob, "CRON", None)).await.unwrap();
        assert!(!entry.is_delivered);
    }

    #[tokio::test]
    async fn query_paginates_and_orders_desc() {
        let store = InMemoryAuditStore::new();
        for _ in 0..5 {
            store.create(new_entry(AuditAction::JobStarted, "POST", Some(true))).await.unwrap();
        }
        let result = store.query(&AuditFilter { page: 1, limit: 2, ..Default::default() }).await.unwrap();
        assert_eq!(result.items.len(), 2);
        assert_eq!(result.total, 5);
    }

    #[tokio::test]
    async fn fetch_undelivered_filters_cron_system_entries() {
        let store = InMemoryAuditStore::new();
        let mut entry = new_entry(AuditAction::CronJob, "CRON", None);
        entry.ip_address = Some("system".to_string());
        store.create(entry).await.unwrap();

        store.create(new_entry(AuditAction::JobStarted, "POST", Some(true))).await.unwrap();

        let undelivered = store.fetch_undelivered(None, 1000).await.unwrap();
        assert_eq!(undelivered.len(), 1);
        assert_eq!(undelivered[0].action, AuditAction::CronJob);
    }

    #[tokio::test]
    async fn mark_delivered_is_at_most_once_under_duplicate_calls() {
        let store = InMemoryAuditStore::new();
        let mut entry = new_entry(AuditAction::CronJob, "CRON", None);
        entry.ip_address = Some("system".to_string());
        let created = store.create(entry).await.unwrap();

        let first = store.mark_delivered(&[created.id]).await.unwrap();
        let second = store.mark_delivered(&[created.id]).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn salesforce_scope_admits_cron_methods_and_crm_methods() {
        let store = InMemoryAuditStore::new();
        store.create(new_entry(AuditAction::CronJob, "CRON", Some(true))).await.unwrap();
        store.create(new_entry(AuditAction::JobStarted, "POST", Some(true))).await.unwrap();
        store.create(new_entry(AuditAction::JobStarted, "GET", Some(true))).await.unwrap();

        let result = store.query_salesforce_scoped(&AuditFilter::default()).await.unwrap();
        assert_eq!(result.total, 2);
    }

    #[tokio::test]
    async fn status_class_histogram_buckets_2xx_and_4xx_plus() {
        let store = InMemoryAuditStore::new();
        let mut ok = new_entry(AuditAction::JobCompleted, "POST", Some(true));
        ok.status_code = 200;
        store.create(ok).await.unwrap();

        let mut failed = new_entry(AuditAction::JobFailed, "POST", Some(true));
        failed.status_code = 500;
        store.create(failed).await.unwrap();

        let hist = store.status_class_histogram(&AuditFilter::default()).await.unwrap();
        assert_eq!(hist.success, 1);
        assert_eq!(hist.error, 1);
    }

    #[tokio::test]
    async fn search_matches_case_insensitive_substring() {
        let store = InMemoryAuditStore::new();
        let mut entry = new_entry(AuditAction::JobCompleted, "POST", Some(true));
        entry.reference_id = Some("ORDER-123".to_string());
        store.create(entry).await.unwrap();

        let result = store
            .query(&AuditFilter { search: Some("order-123".to_string()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(result.total, 1);
    }

    #[tokio::test]
    async fn column_filter_equals_matches_field() {
        let store = InMemoryAuditStore::new();
        store.create(new_entry(AuditAction::JobStarted, "POST", Some(true))).await.unwrap();
        store.create(new_entry(AuditAction::JobStarted, "GET", Some(true))).await.unwrap();

        let result = store
            .query(&AuditFilter {
                column_filters: vec![ColumnFilter { field: "method".into(), operator: ColumnOperator::Equals, value: json!("POST") }],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.total, 1);
    }
}
