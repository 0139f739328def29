//! The `salesforce` handler contract (spec §4.3): start audit → mark
//! processing → call CRM → normalise result → complete/fail.

use std::sync::Arc;
use std::time::Instant;

use relay_audit::writer::{BatchedAuditWriterHandle, JobUpdate};
use relay_audit::AuditStore;
use relay_core::collaborators::{CrmClient, ErrorLog, ErrorLogEntry};
use relay_core::{status_code, AuditAction, ErrorCategory, JobStatus, NewAuditEntry};
use relay_queue::QueuedItem;
use serde_json::json;

use crate::metrics::WorkerMetrics;
use crate::payload::{normalize_crm_results, resolve_reference_id, SalesforceJob};

/// Max job-level retry attempts (spec §4.3.2 "the first failure yields one
/// retry"). Backed by the reserved [`QueuedItem::attempts_made`] the broker
/// already tracks, not a separate counter.
const MAX_JOB_ATTEMPTS: u32 = 2;

pub struct HandlerContext {
    pub crm: Arc<dyn CrmClient>,
    pub audit: Arc<dyn AuditStore>,
    pub writer: BatchedAuditWriterHandle,
    pub error_log: Arc<dyn ErrorLog>,
    pub metrics: Arc<WorkerMetrics>,
}

/// Outcome the worker pool translates into a `broker.complete`/`broker.fail`
/// call.
pub enum HandlerOutcome {
    Completed,
    /// `reason` is passed straight to [`relay_queue::QueueBroker::fail`];
    /// the broker's own attempts/backoff policy decides whether the queue
    /// item itself gets requeued.
    Failed { reason: String },
}

async fn audit_entry(action: AuditAction, job: &SalesforceJob, status_code: i32, status_message: Option<String>) -> NewAuditEntry {
    NewAuditEntry {
        user_id: job.user_id,
        api_key_id: job.api_key_id,
        action: Some(action),
        method: "POST".to_string(),
        endpoint: job.endpoint.clone(),
        job_type: job.job_type.clone(),
        reference_id: None,
        external_id: None,
        status_code,
        status_message,
        request_data: Some(job.payload.clone()),
        response_data: None,
        ip_address: None,
        user_agent: None,
        duration_ms: None,
        is_delivered: None,
    }
}

/// Run the full handler contract for one reserved `salesforce` item (spec
/// §4.3 steps 1-6). `item` is only used for its `attempts_made` counter
/// (the job-level retry decision, see [`MAX_JOB_ATTEMPTS`]).
pub async fn process_salesforce_job(ctx: &HandlerContext, job: SalesforceJob, item: &QueuedItem) -> HandlerOutcome {
    let started = Instant::now();

    if ctx.audit.create(audit_entry(AuditAction::JobStarted, &job, status_code::STARTED, None).await).await.is_err() {
        tracing::warn!(idempotency_key = %job.idempotency_key, "failed to write JOB_STARTED audit entry");
    }

    if let Err(err) = ctx
        .writer
        .push(JobUpdate { idempotency_key: job.idempotency_key.clone(), status: JobStatus::Processing, crm_response: None, error_message: None })
        .await
    {
        tracing::error!(idempotency_key = %job.idempotency_key, error = %err, "batched audit writer channel closed");
    }

    let headers = json!({ "Authorization": format!("Bearer {}", job.token) });
    let response = match ctx.crm.direct_api(&job.endpoint, Some(job.payload.clone()), headers, true).await {
        Ok(response) => response,
        Err(err) => {
            return handle_failure(ctx, &job, item, ErrorCategory::classify(None, None), err.to_string(), started).await;
        }
    };

    if response.error_flag || response.http_code >= 400 {
        let category = ErrorCategory::classify(Some(response.http_code), response.transport_code.as_deref());
        let reason = format!("CRM call failed with http_code={}", response.http_code);
        return handle_failure(ctx, &job, item, category, reason, started).await;
    }

    for result_item in normalize_crm_results(&response.data) {
        let reference_id = resolve_reference_id(&result_item, &job.payload);
        let mut entry = audit_entry(AuditAction::CronJob, &job, status_code::COMPLETED, result_item.message.clone()).await;
        entry.reference_id = reference_id;
        entry.external_id = result_item.id.clone();
        entry.ip_address = Some("system".to_string());
        entry.is_delivered = Some(false);
        if let Err(err) = ctx.audit.create(entry).await {
            tracing::warn!(idempotency_key = %job.idempotency_key, error = %err, "failed to write CRON_JOB audit entry");
        }
    }

    if let Err(err) = ctx
        .writer
        .push(JobUpdate {
            idempotency_key: job.idempotency_key.clone(),
            status: JobStatus::Completed,
            crm_response: Some(response.data.clone()),
            error_message: None,
        })
        .await
    {
        tracing::error!(idempotency_key = %job.idempotency_key, error = %err, "batched audit writer channel closed");
    }

    if ctx
        .audit
        .create(audit_entry(AuditAction::JobCompleted, &job, status_code::COMPLETED, None).await)
        .await
        .is_err()
    {
        tracing::warn!(idempotency_key = %job.idempotency_key, "failed to write JOB_COMPLETED audit entry");
    }

    ctx.metrics.record_completed(started.elapsed().as_millis() as u64);
    HandlerOutcome::Completed
}

async fn handle_failure(
    ctx: &HandlerContext,
    job: &SalesforceJob,
    item: &QueuedItem,
    category: ErrorCategory,
    reason: String,
    started: Instant,
) -> HandlerOutcome {
    let retrying = category.is_retryable() && item.attempts_made + 1 < MAX_JOB_ATTEMPTS;

    if !retrying {
        if let Err(err) = ctx
            .writer
            .push(JobUpdate {
                idempotency_key: job.idempotency_key.clone(),
                status: JobStatus::Failed,
                crm_response: None,
                error_message: Some(reason.clone()),
            })
            .await
        {
            tracing::error!(idempotency_key = %job.idempotency_key, error = %err, "batched audit writer channel closed");
        }

        if ctx
            .audit
            .create(audit_entry(AuditAction::JobFailed, job, status_code::FAILED, Some(reason.clone())).await)
            .await
            .is_err()
        {
            tracing::warn!(idempotency_key = %job.idempotency_key, "failed to write JOB_FAILED audit entry");
        }

        ctx.error_log
            .log_error(ErrorLogEntry {
                message: reason.clone(),
                severity: category.severity().to_string(),
                source: "relay-worker".to_string(),
                environment: "production".to_string(),
                stack: None,
                status_code: Some(status_code::FAILED),
                metadata: Some(json!({ "errorType": category.as_str(), "idempotencyKey": job.idempotency_key })),
            })
            .await;
    }

    ctx.metrics.record_failed(started.elapsed().as_millis() as u64);
    HandlerOutcome::Failed { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_audit::{BatchedAuditWriterHandle, InMemoryAuditStore};
    use relay_core::NewJob;
    use relay_queue::types::ItemState;
    use relay_store::{InMemoryJobStore, JobStore};
    use relay_testkit::{FakeCrmClient, FakeErrorLog};
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn salesforce_job(key: &str) -> SalesforceJob {
        SalesforceJob {
            endpoint: "/core/pledge/v2.0/".to_string(),
            payload: json!({"SourceExternalId": "S1"}),
            token: "T1".to_string(),
            job_type: "pledge".to_string(),
            client_id: "client-1".to_string(),
            idempotency_key: key.to_string(),
            user_id: None,
            api_key_id: None,
        }
    }

    fn queued_item(attempts_made: u32) -> QueuedItem {
        QueuedItem {
            id: "item-1".to_string(),
            name: "pledge".to_string(),
            payload: json!(null),
            attempts_made,
            attempts_allowed: 3,
            backoff: relay_core::BackoffPolicy::Exponential { base_ms: 500 },
            delay_until: None,
            priority: 1,
            state: ItemState::Active,
            enqueued_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
            failed_reason: None,
            stalled_count: 0,
        }
    }

    async fn make_ctx(crm: Arc<relay_testkit::FakeCrmClient>) -> (HandlerContext, Arc<InMemoryJobStore>, Arc<InMemoryAuditStore>) {
        let job_store = Arc::new(InMemoryJobStore::new());
        let audit_store = Arc::new(InMemoryAuditStore::new());
        let shutdown = CancellationToken::new();
        let (writer, _join) = relay_audit::writer::spawn(job_store.clone(), 16, shutdown);
        let ctx = HandlerContext {
            crm,
            audit: audit_store.clone(),
            writer,
            error_log: Arc::new(FakeErrorLog::new()),
            metrics: Arc::new(WorkerMetrics::new()),
        };
        (ctx, job_store, audit_store)
    }

    #[tokio::test]
    async fn successful_call_completes_job_and_emits_audits() {
        let crm = Arc::new(FakeCrmClient::new());
        crm.push_response(relay_core::collaborators::CrmResponse {
            http_code: 200,
            data: json!({"data": [{"Success": true, "OrderId": "O1", "Id": "I1", "Message": "ok"}]}),
            error_flag: false,
            headers: None,
            transport_code: None,
        });
        let (ctx, job_store, audit_store) = make_ctx(crm).await;
        job_store.create(NewJob { idempotency_key: "pledge-1".into(), payload: json!(null) }).await.unwrap();

        let job = salesforce_job("pledge-1");
        let outcome = process_salesforce_job(&ctx, job, &queued_item(0)).await;
        assert!(matches!(outcome, HandlerOutcome::Completed));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let result = audit_store.query(&relay_audit::AuditFilter::default()).await.unwrap();
        assert!(result.items.iter().any(|e| e.action == AuditAction::JobStarted));
        assert!(result.items.iter().any(|e| e.action == AuditAction::JobCompleted));
        assert!(result.items.iter().any(|e| e.action == AuditAction::CronJob && e.reference_id.as_deref() == Some("O1")));
    }

    #[tokio::test]
    async fn server_error_on_final_attempt_marks_job_failed_and_logs_error() {
        let crm = Arc::new(FakeCrmClient::new());
        crm.push_response(relay_core::collaborators::CrmResponse {
            http_code: 503,
            data: json!(null),
            error_flag: true,
            headers: None,
            transport_code: None,
        });
        let (ctx, job_store, audit_store) = make_ctx(crm).await;
        job_store.create(NewJob { idempotency_key: "pledge-1".into(), payload: json!(null) }).await.unwrap();

        let job = salesforce_job("pledge-1");
        // attempts_made=1 means this would be the second (final) attempt.
        let outcome = process_salesforce_job(&ctx, job, &queued_item(1)).await;
        assert!(matches!(outcome, HandlerOutcome::Failed { .. }));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let result = audit_store.query(&relay_audit::AuditFilter::default()).await.unwrap();
        assert!(result.items.iter().any(|e| e.action == AuditAction::JobFailed));
    }

    #[tokio::test]
    async fn retryable_error_on_first_attempt_does_not_mark_job_failed() {
        let crm = Arc::new(FakeCrmClient::new());
        crm.push_response(relay_core::collaborators::CrmResponse {
            http_code: 503,
            data: json!(null),
            error_flag: true,
            headers: None,
            transport_code: None,
        });
        let (ctx, _job_store, audit_store) = make_ctx(crm).await;

        let job = salesforce_job("pledge-1");
        let outcome = process_salesforce_job(&ctx, job, &queued_item(0)).await;
        assert!(matches!(outcome, HandlerOutcome::Failed { .. }));

        let result = audit_store.query(&relay_audit::AuditFilter::default()).await.unwrap();
        assert!(!result.items.iter().any(|e| e.action == AuditAction::JobFailed));
    }

    #[tokio::test]
    async fn auth_error_is_terminal_even_on_first_attempt() {
        let crm = Arc::new(FakeCrmClient::new());
        crm.push_response(relay_core::collaborators::CrmResponse {
            http_code: 401,
            data: json!(null),
            error_flag: true,
            headers: None,
            transport_code: None,
        });
        let (ctx, _job_store, audit_store) = make_ctx(crm).await;

        let job = salesforce_job("pledge-1");
        let outcome = process_salesforce_job(&ctx, job, &queued_item(0)).await;
        assert!(matches!(outcome, HandlerOutcome::Failed { .. }));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let result = audit_store.query(&relay_audit::AuditFilter::default()).await.unwrap();
        assert!(result.items.iter().any(|e| e.action == AuditAction::JobFailed));
    }
}
