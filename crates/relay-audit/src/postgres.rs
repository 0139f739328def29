//! Postgres-backed [`AuditStore`], following the teacher's
//! `sqlx::PgPool` + row-to-domain-type mapping idiom (mirrored from
//! [`relay_store::postgres`]).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{AuditAction, AuditEntry};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use ulid::Ulid;

use crate::query::{
    AuditFilter, AuditQueryResult, ColumnFilter, ColumnOperator, HourlyBucket, StatusClassHistogram, TopBucket,
    CRM_METHODS, CRON_METHODS,
};
use crate::store::{AuditError, AuditStore};

fn action_str(action: AuditAction) -> &'static str {
    match action {
        AuditAction::CronJob => "CRON_JOB",
        AuditAction::JobStarted => "JOB_STARTED",
        AuditAction::JobScheduled => "JOB_SCHEDULED",
        AuditAction::JobCompleted => "JOB_COMPLETED",
        AuditAction::JobFailed => "JOB_FAILED",
    }
}

fn parse_action(s: &str) -> Result<AuditAction, AuditError> {
    Ok(match s {
        "CRON_JOB" => AuditAction::CronJob,
        "JOB_STARTED" => AuditAction::JobStarted,
        "JOB_SCHEDULED" => AuditAction::JobScheduled,
        "JOB_COMPLETED" => AuditAction::JobCompleted,
        "JOB_FAILED" => AuditAction::JobFailed,
        other => return Err(AuditError::Backend(anyhow::anyhow!("unknown audit action in row: {other}"))),
    })
}

fn row_to_entry(row: &PgRow) -> Result<AuditEntry, AuditError> {
    let id_str: String = row.try_get("id").map_err(|e| AuditError::Backend(e.into()))?;
    let action_str: String = row.try_get("action").map_err(|e| AuditError::Backend(e.into()))?;
    Ok(AuditEntry {
        id: Ulid::from_string(&id_str).map_err(|e| AuditError::Backend(e.into()))?,
        user_id: row.try_get("user_id").map_err(|e| AuditError::Backend(e.into()))?,
        api_key_id: row.try_get("api_key_id").map_err(|e| AuditError::Backend(e.into()))?,
        action: parse_action(&action_str)?,
        method: row.try_get("method").map_err(|e| AuditError::Backend(e.into()))?,
        endpoint: row.try_get("endpoint").map_err(|e| AuditError::Backend(e.into()))?,
        job_type: row.try_get("type").map_err(|e| AuditError::Backend(e.into()))?,
        reference_id: row.try_get("reference_id").map_err(|e| AuditError::Backend(e.into()))?,
        external_id: row.try_get("external_id").map_err(|e| AuditError::Backend(e.into()))?,
        status_code: row.try_get("status_code").map_err(|e| AuditError::Backend(e.into()))?,
        status_message: row.try_get("status_message").map_err(|e| AuditError::Backend(e.into()))?,
        request_data: row.try_get("request_data").map_err(|e| AuditError::Backend(e.into()))?,
        response_data: row.try_get("response_data").map_err(|e| AuditError::Backend(e.into()))?,
        ip_address: row.try_get("ip_address").map_err(|e| AuditError::Backend(e.into()))?,
        user_agent: row.try_get("user_agent").map_err(|e| AuditError::Backend(e.into()))?,
        duration_ms: row.try_get("duration_ms").map_err(|e| AuditError::Backend(e.into()))?,
        is_delivered: row.try_get("is_delivered").map_err(|e| AuditError::Backend(e.into()))?,
        created_at: row.try_get("created_at").map_err(|e| AuditError::Backend(e.into()))?,
    })
}

const SELECT_COLUMNS: &str = "id, user_id, api_key_id, action, method, endpoint, type, reference_id, external_id, \
     status_code, status_message, request_data, response_data, ip_address, user_agent, duration_ms, is_delivered, created_at";

/// Per-field operator clause for a single [`ColumnFilter`].
fn push_operator<'a>(builder: &mut QueryBuilder<'a, Postgres>, column: &str, filter: &'a ColumnFilter) {
    match filter.operator {
        ColumnOperator::Equals => {
            builder.push(format!("{column} = "));
            builder.push_bind(filter.value.as_str().unwrap_or_default().to_string());
        }
        ColumnOperator::Contains => {
            builder.push(format!("{column} ILIKE "));
            builder.push_bind(format!("%{}%", filter.value.as_str().unwrap_or_default()));
        }
        ColumnOperator::StartsWith => {
            builder.push(format!("{column} ILIKE "));
            builder.push_bind(format!("{}%", filter.value.as_str().unwrap_or_default()));
        }
        ColumnOperator::EndsWith => {
            builder.push(format!("{column} ILIKE "));
            builder.push_bind(format!("%{}", filter.value.as_str().unwrap_or_default()));
        }
        ColumnOperator::In => {
            let values: Vec<String> = filter.value.as_array().map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()).unwrap_or_default();
            builder.push(format!("{column} = ANY("));
            builder.push_bind(values);
            builder.push(")");
        }
        ColumnOperator::NotIn => {
            let values: Vec<String> = filter.value.as_array().map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()).unwrap_or_default();
            builder.push(format!("NOT ({column} = ANY("));
            builder.push_bind(values);
            builder.push("))");
        }
        ColumnOperator::Range => {
            let arr = filter.value.as_array();
            let lo = arr.and_then(|a| a.first()).and_then(|v| v.as_i64());
            let hi = arr.and_then(|a| a.get(1)).and_then(|v| v.as_i64());
            builder.push("(");
            builder.push(format!("{column} >= "));
            builder.push_bind(lo.unwrap_or(i64::MIN));
            builder.push(format!(" AND {column} <= "));
            builder.push_bind(hi.unwrap_or(i64::MAX));
            builder.push(")");
        }
        ColumnOperator::Gt => {
            builder.push(format!("{column} > "));
            builder.push_bind(filter.value.as_i64().unwrap_or_default());
        }
        ColumnOperator::Gte => {
            builder.push(format!("{column} >= "));
            builder.push_bind(filter.value.as_i64().unwrap_or_default());
        }
        ColumnOperator::Lt => {
            builder.push(format!("{column} < "));
            builder.push_bind(filter.value.as_i64().unwrap_or_default());
        }
        ColumnOperator::Lte => {
            builder.push(format!("{column} <= "));
            builder.push_bind(filter.value.as_i64().unwrap_or_default());
        }
    }
}

/// Column filters on the same field combine with OR; different fields
/// combine with AND (spec §4.6).
fn push_column_filters<'a>(builder: &mut QueryBuilder<'a, Postgres>, filters: &'a [ColumnFilter], mut first: bool) {
    let mut by_field: HashMap<&str, Vec<&ColumnFilter>> = HashMap::new();
    for f in filters {
        by_field.entry(f.field.as_str()).or_default().push(f);
    }
    for (field, group) in by_field {
        let column = sanitize_column(field);
        builder.push(if first { " WHERE (" } else { " AND (" });
        first = false;
        for (i, f) in group.iter().enumerate() {
            if i > 0 {
                builder.push(" OR ");
            }
            push_operator(builder, &column, f);
        }
        builder.push(")");
    }
}

/// Allowlist column names so `field` (caller-supplied) can never be used to
/// inject arbitrary SQL via string formatting.
fn sanitize_column(field: &str) -> String {
    const ALLOWED: &[&str] = &[
        "action", "method", "endpoint", "type", "reference_id", "external_id", "status_message", "status_code",
        "duration_ms", "ip_address", "user_agent",
    ];
    if ALLOWED.contains(&field) {
        field.to_string()
    } else {
        "1".to_string()
    }
}

/// Apply the free-text search clause: OR across the fixed set of searched
/// columns (spec §4.6), parameterised once and reused.
fn push_search<'a>(builder: &mut QueryBuilder<'a, Postgres>, search: &'a str, first: bool) -> bool {
    let pattern = format!("%{search}%");
    builder.push(if first { " WHERE (" } else { " AND (" });
    builder.push("action ILIKE ");
    builder.push_bind(pattern.clone());
    builder.push(" OR endpoint ILIKE ");
    builder.push_bind(pattern.clone());
    builder.push(" OR ip_address ILIKE ");
    builder.push_bind(pattern.clone());
    builder.push(" OR type ILIKE ");
    builder.push_bind(pattern.clone());
    builder.push(" OR reference_id ILIKE ");
    builder.push_bind(pattern.clone());
    builder.push(" OR external_id ILIKE ");
    builder.push_bind(pattern.clone());
    builder.push(" OR status_message ILIKE ");
    builder.push_bind(pattern);
    builder.push(")");
    false
}

fn push_filter_clauses<'a>(builder: &mut QueryBuilder<'a, Postgres>, filter: &'a AuditFilter) {
    let mut first = true;

    macro_rules! clause {
        ($sql:expr, $value:expr) => {{
            builder.push(if first { " WHERE " } else { " AND " });
            first = false;
            builder.push($sql);
            builder.push_bind($value);
        }};
    }

    if let Some(user_id) = filter.user_id {
        clause!("user_id = ", user_id);
    }
    if let Some(api_key_id) = filter.api_key_id {
        clause!("api_key_id = ", api_key_id);
    }
    if let Some(action) = &filter.action {
        clause!("action = ", action.as_str());
    }
    if let Some(method) = &filter.method {
        clause!("method = ", method.as_str());
    }
    if let Some(status_code) = filter.status_code {
        clause!("status_code = ", status_code);
    }
    if let Some(start) = filter.start_date {
        clause!("created_at >= ", start);
    }
    if let Some(end) = filter.end_date {
        clause!("created_at <= ", end);
    }
    if let Some(is_delivered) = filter.is_delivered {
        clause!("is_delivered = ", is_delivered);
    }
    if let Some(search) = &filter.search {
        first = push_search(builder, search, first);
    }
    push_column_filters(builder, &filter.column_filters, first);
}

pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run pending migrations. Called once at daemon startup.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn run_query(&self, filter: &AuditFilter, salesforce_scoped: bool) -> Result<AuditQueryResult, AuditError> {
        let filter = filter.clone().normalized();

        let mut count_builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT count(*) FROM audit_log");
        push_filter_clauses(&mut count_builder, &filter);
        if salesforce_scoped {
            push_salesforce_scope(&mut count_builder, filter.column_filters.is_empty() && filter.search.is_none());
        }
        let total: i64 = count_builder
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AuditError::Backend(e.into()))?
            .try_get(0)
            .map_err(|e| AuditError::Backend(e.into()))?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!("SELECT {SELECT_COLUMNS} FROM audit_log"));
        push_filter_clauses(&mut builder, &filter);
        if salesforce_scoped {
            push_salesforce_scope(&mut builder, filter.column_filters.is_empty() && filter.search.is_none());
        }
        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(filter.limit as i64);
        builder.push(" OFFSET ");
        builder.push_bind(filter.offset() as i64);

        let rows = builder.build().fetch_all(&self.pool).await.map_err(|e| AuditError::Backend(e.into()))?;
        let items = rows.iter().map(row_to_entry).collect::<Result<Vec<_>, _>>()?;

        Ok(AuditQueryResult { items, total: total as u64, page: filter.page, limit: filter.limit })
    }
}

/// `method IN CRM_METHODS OR (action = 'CRON_JOB' AND method IN CRON_METHODS)`.
fn push_salesforce_scope<'a>(builder: &mut QueryBuilder<'a, Postgres>, first: bool) {
    builder.push(if first { " WHERE (" } else { " AND (" });
    builder.push("method = ANY(");
    builder.push_bind(CRM_METHODS.iter().map(|s| s.to_string()).collect::<Vec<_>>());
    builder.push(") OR (action = 'CRON_JOB' AND method = ANY(");
    builder.push_bind(CRON_METHODS.iter().map(|s| s.to_string()).collect::<Vec<_>>());
    builder.push(")))");
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn create(&self, entry: relay_core::NewAuditEntry) -> Result<AuditEntry, AuditError> {
        let is_delivered = entry.resolved_is_delivered();
        let action = entry.action.unwrap_or(AuditAction::JobStarted);
        let id = Ulid::new().to_string();

        let row = sqlx::query(&format!(
            "INSERT INTO audit_log (id, user_id, api_key_id, action, method, endpoint, type, reference_id, \
             external_id, status_code, status_message, request_data, response_data, ip_address, user_agent, \
             duration_ms, is_delivered) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17) \
             RETURNING {SELECT_COLUMNS}"
        ))
        .bind(&id)
        .bind(entry.user_id)
        .bind(entry.api_key_id)
        .bind(action_str(action))
        .bind(&entry.method)
        .bind(&entry.endpoint)
        .bind(&entry.job_type)
        .bind(&entry.reference_id)
        .bind(&entry.external_id)
        .bind(entry.status_code)
        .bind(&entry.status_message)
        .bind(&entry.request_data)
        .bind(&entry.response_data)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(entry.duration_ms)
        .bind(is_delivered)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AuditError::Backend(e.into()))?;

        row_to_entry(&row)
    }

    async fn get(&self, id: Ulid) -> Result<Option<AuditEntry>, AuditError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM audit_log WHERE id = $1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AuditError::Backend(e.into()))?;
        row.as_ref().map(row_to_entry).transpose()
    }

    async fn query(&self, filter: &AuditFilter) -> Result<AuditQueryResult, AuditError> {
        self.run_query(filter, false).await
    }

    async fn query_salesforce_scoped(&self, filter: &AuditFilter) -> Result<AuditQueryResult, AuditError> {
        self.run_query(filter, true).await
    }

    async fn status_class_histogram(&self, filter: &AuditFilter) -> Result<StatusClassHistogram, AuditError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT \
               count(*) FILTER (WHERE status_code >= 200 AND status_code < 300) AS success, \
               count(*) FILTER (WHERE status_code >= 400) AS error \
             FROM audit_log",
        );
        push_filter_clauses(&mut builder, filter);
        let row = builder.build().fetch_one(&self.pool).await.map_err(|e| AuditError::Backend(e.into()))?;
        let success: i64 = row.try_get("success").map_err(|e| AuditError::Backend(e.into()))?;
        let error: i64 = row.try_get("error").map_err(|e| AuditError::Backend(e.into()))?;
        Ok(StatusClassHistogram { success: success as u64, error: error as u64 })
    }

    async fn top_actions(&self, n: usize) -> Result<Vec<TopBucket>, AuditError> {
        top_n(&self.pool, "action", n).await
    }

    async fn top_methods(&self, n: usize) -> Result<Vec<TopBucket>, AuditError> {
        top_n(&self.pool, "method", n).await
    }

    async fn hourly_histogram(&self) -> Result<Vec<HourlyBucket>, AuditError> {
        let rows = sqlx::query(
            "SELECT date_trunc('hour', created_at) AS hour, count(*) AS count \
             FROM audit_log WHERE created_at >= now() - interval '24 hours' \
             GROUP BY hour ORDER BY hour",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AuditError::Backend(e.into()))?;

        rows.iter()
            .map(|row| {
                let hour: DateTime<Utc> = row.try_get("hour").map_err(|e| AuditError::Backend(e.into()))?;
                let count: i64 = row.try_get("count").map_err(|e| AuditError::Backend(e.into()))?;
                Ok(HourlyBucket { hour, count: count as u64 })
            })
            .collect()
    }

    async fn fetch_undelivered(&self, type_filter: Option<&str>, max: u32) -> Result<Vec<AuditEntry>, AuditError> {
        let max = max.min(10_000) as i64;
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM audit_log \
             WHERE action = 'CRON_JOB' AND is_delivered = false AND ip_address = 'system' \
             AND ($1::text IS NULL OR type = $1) \
             ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(type_filter)
        .bind(max)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AuditError::Backend(e.into()))?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn mark_delivered(&self, ids: &[Ulid]) -> Result<u64, AuditError> {
        let ids: Vec<String> = ids.iter().take(1000).map(|id| id.to_string()).collect();
        let result = sqlx::query("UPDATE audit_log SET is_delivered = true WHERE id = ANY($1) AND is_delivered = false")
            .bind(&ids)
            .execute(&self.pool)
            .await
            .map_err(|e| AuditError::Backend(e.into()))?;
        Ok(result.rows_affected())
    }

    async fn export_page(&self, filter: &AuditFilter, offset: u64, batch_size: u64) -> Result<Vec<AuditEntry>, AuditError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!("SELECT {SELECT_COLUMNS} FROM audit_log"));
        push_filter_clauses(&mut builder, filter);
        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(batch_size as i64);
        builder.push(" OFFSET ");
        builder.push_bind(offset as i64);

        let rows = builder.build().fetch_all(&self.pool).await.map_err(|e| AuditError::Backend(e.into()))?;
        rows.iter().map(row_to_entry).collect()
    }
}

async fn top_n(pool: &PgPool, column: &str, n: usize) -> Result<Vec<TopBucket>, AuditError> {
    let rows = sqlx::query(&format!("SELECT {column} AS key, count(*) AS count FROM audit_log GROUP BY {column} ORDER BY count DESC LIMIT $1"))
        .bind(n as i64)
        .fetch_all(pool)
        .await
        .map_err(|e| AuditError::Backend(e.into()))?;

    rows.iter()
        .map(|row| {
            let key: String = row.try_get("key").map_err(|e| AuditError::Backend(e.into()))?;
            let count: i64 = row.try_get("count").map_err(|e| AuditError::Backend(e.into()))?;
            Ok(TopBucket { key, count: count as u64 })
        })
        .collect()
}
