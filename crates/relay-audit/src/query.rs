//! Query filters and aggregation result shapes for the Audit/Event Log (C6),
//! spec §4.6.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-field operator set supported by [`ColumnFilter`] (spec §4.6 "column
/// filters").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ColumnOperator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    Range,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// One `{field, operator, value}` column filter. Multiple filters on the same
/// field combine with OR; filters across different fields combine with AND
/// (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnFilter {
    pub field: String,
    pub operator: ColumnOperator,
    pub value: serde_json::Value,
}

/// Query parameters accepted by [`crate::store::AuditStore::query`].
#[derive(Debug, Clone)]
pub struct AuditFilter {
    pub user_id: Option<uuid::Uuid>,
    pub api_key_id: Option<uuid::Uuid>,
    pub action: Option<String>,
    pub method: Option<String>,
    pub status_code: Option<i32>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub is_delivered: Option<bool>,
    /// Case-insensitive substring match across `{action, endpoint,
    /// ip_address, type, reference_id, external_id, status_message}`.
    pub search: Option<String>,
    pub column_filters: Vec<ColumnFilter>,
    pub page: u32,
    pub limit: u32,
}

/// Free-text search columns, spec §4.6.
pub const SEARCH_COLUMNS: [&str; 7] =
    ["action", "endpoint", "ip_address", "type", "reference_id", "external_id", "status_message"];

pub const DEFAULT_LIMIT: u32 = 50;
pub const MAX_LIMIT: u32 = 100;

impl AuditFilter {
    /// Clamp `page`/`limit` to the bounds given in spec §4.6 (`page >= 1`,
    /// `limit in [1, 100]`, default 50).
    pub fn normalized(mut self) -> Self {
        if self.page == 0 {
            self.page = 1;
        }
        self.limit = self.limit.clamp(1, MAX_LIMIT);
        if self.limit == 0 {
            self.limit = DEFAULT_LIMIT;
        }
        self
    }

    pub fn offset(&self) -> u32 {
        (self.page.max(1) - 1) * self.limit
    }
}

impl Default for AuditFilter {
    fn default() -> Self {
        Self {
            user_id: None,
            api_key_id: None,
            action: None,
            method: None,
            status_code: None,
            start_date: None,
            end_date: None,
            is_delivered: None,
            search: None,
            column_filters: Vec::new(),
            page: 1,
            limit: DEFAULT_LIMIT,
        }
    }
}

/// Methods admitted by the Salesforce-scoped view even when the entry isn't
/// tagged `action = "CRON_JOB"` (spec §4.6 "For the Salesforce-scoped view").
pub const CRM_METHODS: [&str; 3] = ["POST", "PUT", "PATCH"];
/// Methods admitted alongside `action == "CRON_JOB"` in the Salesforce-scoped
/// view.
pub const CRON_METHODS: [&str; 1] = ["CRON"];

/// Result page from [`crate::store::AuditStore::query`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditQueryResult {
    pub items: Vec<relay_core::AuditEntry>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

/// `2xx` vs `4xx+` status-code class histogram (spec §4.6 aggregations).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StatusClassHistogram {
    pub success: u64,
    pub error: u64,
}

/// One bucket of a top-N histogram (action or method).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopBucket {
    pub key: String,
    pub count: u64,
}

/// One bucket of the hourly histogram over the last 24h.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub hour: DateTime<Utc>,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_clamps_page_and_limit() {
        let filter = AuditFilter { page: 0, limit: 0, ..Default::default() }.normalized();
        assert_eq!(filter.page, 1);
        assert_eq!(filter.limit, DEFAULT_LIMIT);

        let filter = AuditFilter { page: 3, limit: 500, ..Default::default() }.normalized();
        assert_eq!(filter.page, 3);
        assert_eq!(filter.limit, MAX_LIMIT);
    }

    #[test]
    fn offset_is_zero_based() {
        let filter = AuditFilter { page: 1, limit: 50, ..Default::default() };
        assert_eq!(filter.offset(), 0);
        let filter = AuditFilter { page: 3, limit: 50, ..Default::default() };
        assert_eq!(filter.offset(), 100);
    }
}
