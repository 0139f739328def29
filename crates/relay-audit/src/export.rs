//! Audit/Event Log export (spec §4.6): `csv | json | xlsx`, paging through
//! all matching rows internally in 5 000-row batches rather than exposing
//! pagination to the caller.

use relay_core::collaborators::XlsxFormatter;
use relay_core::AuditEntry;

use crate::query::AuditFilter;
use crate::store::{AuditError, AuditStore};

pub const EXPORT_BATCH_SIZE: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
    Xlsx,
}

/// Stream every row matching `filter` out of `store` in
/// [`EXPORT_BATCH_SIZE`]-row pages.
async fn collect_all_rows(store: &dyn AuditStore, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
    let mut rows = Vec::new();
    let mut offset = 0u64;
    loop {
        let page = store.export_page(filter, offset, EXPORT_BATCH_SIZE).await?;
        let fetched = page.len() as u64;
        rows.extend(page);
        if fetched < EXPORT_BATCH_SIZE {
            break;
        }
        offset += EXPORT_BATCH_SIZE;
    }
    Ok(rows)
}

pub async fn export_json(store: &dyn AuditStore, filter: &AuditFilter) -> Result<Vec<u8>, AuditError> {
    let rows = collect_all_rows(store, filter).await?;
    serde_json::to_vec(&rows).map_err(|e| AuditError::Backend(e.into()))
}

/// Quote a CSV field per RFC-4180 (spec §4.6): only when it contains a
/// comma, quote, CR, or LF; embedded quotes are doubled.
fn csv_quote(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

const CSV_HEADER: [&str; 17] = [
    "id",
    "user_id",
    "api_key_id",
    "action",
    "method",
    "endpoint",
    "type",
    "reference_id",
    "external_id",
    "status_code",
    "status_message",
    "ip_address",
    "user_agent",
    "duration_ms",
    "is_delivered",
    "created_at",
    "response_data",
];

fn csv_row(entry: &AuditEntry) -> String {
    let fields = [
        entry.id.to_string(),
        entry.user_id.map(|v| v.to_string()).unwrap_or_default(),
        entry.api_key_id.map(|v| v.to_string()).unwrap_or_default(),
        entry.action.to_string(),
        entry.method.clone(),
        entry.endpoint.clone(),
        entry.job_type.clone(),
        entry.reference_id.clone().unwrap_or_default(),
        entry.external_id.clone().unwrap_or_default(),
        entry.status_code.to_string(),
        entry.status_message.clone().unwrap_or_default(),
        entry.ip_address.clone().unwrap_or_default(),
        entry.user_agent.clone().unwrap_or_default(),
        entry.duration_ms.map(|v| v.to_string()).unwrap_or_default(),
        entry.is_delivered.to_string(),
        entry.created_at.to_rfc3339(),
        entry.response_data.as_ref().map(|v| v.to_string()).unwrap_or_default(),
    ];
    fields.iter().map(|f| csv_quote(f)).collect::<Vec<_>>().join(",")
}

/// UTF-8 BOM, CRLF line endings, RFC-4180 quoting (spec §4.6).
pub async fn export_csv(store: &dyn AuditStore, filter: &AuditFilter) -> Result<Vec<u8>, AuditError> {
    let rows = collect_all_rows(store, filter).await?;
    let mut out = String::new();
    out.push('\u{feff}');
    out.push_str(&CSV_HEADER.join(","));
    out.push_str("\r\n");
    for entry in &rows {
        out.push_str(&csv_row(entry));
        out.push_str("\r\n");
    }
    Ok(out.into_bytes())
}

/// XLSX formatting is delegated to an external [`XlsxFormatter`]
/// collaborator (spec §4.6/§9): the core never owns a spreadsheet-format
/// dependency, it just hands over the same paged rows CSV/JSON use.
pub async fn export_xlsx(
    store: &dyn AuditStore,
    filter: &AuditFilter,
    formatter: &dyn XlsxFormatter,
) -> Result<Vec<u8>, AuditError> {
    let rows = collect_all_rows(store, filter).await?;
    let values: Vec<serde_json::Value> =
        rows.iter().map(|r| serde_json::to_value(r).expect("AuditEntry always serializes")).collect();
    formatter.format(values).await.map_err(AuditError::Backend)
}

pub async fn export(
    store: &dyn AuditStore,
    filter: &AuditFilter,
    format: ExportFormat,
    formatter: Option<&dyn XlsxFormatter>,
) -> Result<Vec<u8>, AuditError> {
    match format {
        ExportFormat::Csv => export_csv(store, filter).await,
        ExportFormat::Json => export_json(store, filter).await,
        ExportFormat::Xlsx => {
            let formatter = formatter.ok_or_else(|| AuditError::Backend(anyhow::anyhow!("xlsx export requires a formatter")))?;
            export_xlsx(store, filter, formatter).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryAuditStore;
    use async_trait::async_trait;
    use relay_core::{AuditAction, NewAuditEntry};

    fn new_entry(reference_id: &str) -> NewAuditEntry {
        NewAuditEntry {
            action: Some(AuditAction::JobCompleted),
            method: "POST".into(),
            endpoint: "/core/pledge/v2.0/".into(),
            job_type: "pledge".into(),
            reference_id: Some(reference_id.into()),
            status_code: 200,
            is_delivered: Some(true),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn csv_export_has_bom_crlf_and_header() {
        let store = InMemoryAuditStore::new();
        store.create(new_entry("O1")).await.unwrap();

        let bytes = export_csv(&store, &AuditFilter::default()).await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with('\u{feff}'));
        assert!(text.contains("\r\n"));
        assert!(text.lines().next().unwrap().trim_start_matches('\u{feff}').starts_with("id,user_id"));
    }

    #[tokio::test]
    async fn csv_quoting_escapes_commas_and_quotes() {
        assert_eq!(csv_quote("plain"), "plain");
        assert_eq!(csv_quote("a,b"), "\"a,b\"");
        assert_eq!(csv_quote("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_quote("line\nbreak"), "\"line\nbreak\"");
    }

    #[tokio::test]
    async fn json_export_round_trips_rows() {
        let store = InMemoryAuditStore::new();
        store.create(new_entry("O1")).await.unwrap();
        store.create(new_entry("O2")).await.unwrap();

        let bytes = export_json(&store, &AuditFilter::default()).await.unwrap();
        let parsed: Vec<AuditEntry> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    struct FakeXlsxFormatter;

    #[async_trait]
    impl XlsxFormatter for FakeXlsxFormatter {
        async fn format(&self, rows: Vec<serde_json::Value>) -> anyhow::Result<Vec<u8>> {
            Ok(serde_json::to_vec(&rows)?)
        }
    }

    #[tokio::test]
    async fn xlsx_export_delegates_to_formatter() {
        let store = InMemoryAuditStore::new();
        store.create(new_entry("O1")).await.unwrap();

        let formatter = FakeXlsxFormatter;
        let bytes = export(&store, &AuditFilter::default(), ExportFormat::Xlsx, Some(&formatter)).await.unwrap();
        assert!(!bytes.is_empty());
    }

    #[tokio::test]
    async fn xlsx_export_without_formatter_errors() {
        let store = InMemoryAuditStore::new();
        let result = export(&store, &AuditFilter::default(), ExportFormat::Xlsx, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn export_pages_past_a_single_batch() {
        let store = InMemoryAuditStore::new();
        for i in 0..3 {
            store.create(new_entry(&format!("O{i}"))).await.unwrap();
        }
        let rows = collect_all_rows(&store, &AuditFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 3);
    }
}
