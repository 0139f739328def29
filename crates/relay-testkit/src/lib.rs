//! In-memory fakes for the collaborator traits in `relay_core::collaborators`
//! (spec §6), mirroring `seesaw-rs`'s `testing.rs` stand-ins for its
//! Postgres-backed traits.
//!
//! These are test-only doubles: production implementations of `CrmClient`,
//! `TokenProvider`, `SettingsProvider` and `ErrorLog` live outside this
//! repository.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use relay_core::collaborators::{CrmClient, CrmResponse, ErrorLog, ErrorLogEntry, SettingsProvider, TokenProvider, TokenResult};
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

/// A scripted CRM response queue: each call to `direct_api` pops the next
/// queued response (or repeats the last one once the queue is drained).
pub struct FakeCrmClient {
    responses: StdMutex<Vec<anyhow::Result<CrmResponse>>>,
    calls: AtomicUsize,
}

impl Default for FakeCrmClient {
    fn default() -> Self {
        Self { responses: StdMutex::new(Vec::new()), calls: AtomicUsize::new(0) }
    }
}

impl FakeCrmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response to be returned by the next `direct_api` call.
    pub fn push_response(&self, response: CrmResponse) {
        self.responses.lock().unwrap().push(Ok(response));
    }

    /// Queue a transport-level failure (no response ever produced).
    pub fn push_error(&self, err: anyhow::Error) {
        self.responses.lock().unwrap().push(Err(err));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CrmClient for FakeCrmClient {
    async fn direct_api(
        &self,
        _endpoint: &str,
        _payload: Option<serde_json::Value>,
        _headers: serde_json::Value,
        _is_json: bool,
    ) -> anyhow::Result<CrmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.responses.lock().unwrap();
        if queue.is_empty() {
            anyhow::bail!("FakeCrmClient: no scripted response queued");
        }
        if queue.len() == 1 {
            match &queue[0] {
                Ok(resp) => Ok(resp.clone()),
                Err(_) => Err(queue.remove(0).unwrap_err()),
            }
        } else {
            queue.remove(0)
        }
    }
}

/// Always succeeds with a fixed token unless told otherwise.
pub struct FakeTokenProvider {
    result: Mutex<TokenResult>,
}

impl Default for FakeTokenProvider {
    fn default() -> Self {
        Self { result: Mutex::new(TokenResult { success: true, token: Some("test-token".to_string()), error: None }) }
    }
}

impl FakeTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeeding(token: impl Into<String>) -> Self {
        Self { result: Mutex::new(TokenResult { success: true, token: Some(token.into()), error: None }) }
    }

    pub fn failing(error: impl Into<String>) -> Self {
        Self { result: Mutex::new(TokenResult { success: false, token: None, error: Some(error.into()) }) }
    }
}

#[async_trait]
impl TokenProvider for FakeTokenProvider {
    async fn get_token(&self) -> anyhow::Result<TokenResult> {
        Ok(self.result.lock().await.clone())
    }
}

/// A settings flag the test can flip without a real settings service.
pub struct FakeSettingsProvider {
    audit_log_enabled: std::sync::atomic::AtomicBool,
}

impl Default for FakeSettingsProvider {
    fn default() -> Self {
        Self { audit_log_enabled: std::sync::atomic::AtomicBool::new(true) }
    }
}

impl FakeSettingsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_audit_log_enabled(&self, enabled: bool) {
        self.audit_log_enabled.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl SettingsProvider for FakeSettingsProvider {
    async fn audit_log_enabled(&self) -> bool {
        self.audit_log_enabled.load(Ordering::SeqCst)
    }
}

/// Records every entry passed to `log_error` for assertions; never fails.
#[derive(Default)]
pub struct FakeErrorLog {
    entries: Mutex<Vec<ErrorLogEntry>>,
}

impl FakeErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<ErrorLogEntry> {
        self.entries.lock().await.clone()
    }
}

impl Clone for ErrorLogEntry {
    fn clone(&self) -> Self {
        ErrorLogEntry {
            message: self.message.clone(),
            severity: self.severity.clone(),
            source: self.source.clone(),
            environment: self.environment.clone(),
            stack: self.stack.clone(),
            status_code: self.status_code,
            metadata: self.metadata.clone(),
        }
    }
}

#[async_trait]
impl ErrorLog for FakeErrorLog {
    async fn log_error(&self, entry: ErrorLogEntry) {
        self.entries.lock().await.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fake_crm_client_returns_scripted_responses_in_order() {
        let client = FakeCrmClient::new();
        client.push_response(CrmResponse { http_code: 503, data: json!(null), error_flag: true, headers: None, transport_code: None });
        client.push_response(CrmResponse { http_code: 200, data: json!({"ok": true}), error_flag: false, headers: None, transport_code: None });

        let first = client.direct_api("/x", None, json!({}), true).await.unwrap();
        assert_eq!(first.http_code, 503);
        let second = client.direct_api("/x", None, json!({}), true).await.unwrap();
        assert_eq!(second.http_code, 200);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn fake_token_provider_defaults_to_success() {
        let provider = FakeTokenProvider::new();
        let result = provider.get_token().await.unwrap();
        assert!(result.success);
        assert_eq!(result.token.as_deref(), Some("test-token"));
    }

    #[tokio::test]
    async fn fake_settings_provider_toggles() {
        let settings = FakeSettingsProvider::new();
        assert!(settings.audit_log_enabled().await);
        settings.set_audit_log_enabled(false);
        assert!(!settings.audit_log_enabled().await);
    }

    #[tokio::test]
    async fn fake_error_log_records_entries() {
        let log = FakeErrorLog::new();
        log.log_error(ErrorLogEntry {
            message: "boom".into(),
            severity: "critical".into(),
            source: "worker".into(),
            environment: "test".into(),
            stack: None,
            status_code: Some(500),
            metadata: None,
        })
        .await;
        assert_eq!(log.entries().await.len(), 1);
    }
}
