//! Trait contracts for the external collaborators the core consumes (spec §6).
//!
//! These traits are the entire surface the core depends on from
//! out-of-scope systems (the CRM HTTP client, token issuance, settings CRUD,
//! error reporting). Production implementations live outside this
//! repository; `relay-testkit` provides in-memory fakes for tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Response envelope from a single CRM HTTP call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmResponse {
    pub http_code: u16,
    pub data: serde_json::Value,
    pub error_flag: bool,
    pub headers: Option<serde_json::Value>,
    /// Transport-level failure code (e.g. `"ECONNREFUSED"`, `"ETIMEDOUT"`),
    /// set when the call never reached the CRM at all.
    pub transport_code: Option<String>,
}

/// `directApi(url, payload, headers, isJson) -> {http_code, data, error_flag, headers?}`.
///
/// Idempotent per call; all non-2xx responses are surfaced with
/// `error_flag = true`. Implementations are expected to apply their own
/// 30s timeout (spec §6).
#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn direct_api(
        &self,
        endpoint: &str,
        payload: Option<serde_json::Value>,
        headers: serde_json::Value,
        is_json: bool,
    ) -> anyhow::Result<CrmResponse>;
}

/// Outcome of a token fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResult {
    pub success: bool,
    pub token: Option<String>,
    pub error: Option<String>,
}

/// `getToken() -> {success, token?, error?}`.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self) -> anyhow::Result<TokenResult>;
}

/// `get().security.enable_audit_log`. The core short-circuits audit writes
/// when this is false, refreshed on a TTL rather than read per-call (spec §9
/// "Global live settings read on every audit write" redesign flag).
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn audit_log_enabled(&self) -> bool;
}

/// Fields passed to the best-effort Error Log collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub message: String,
    #[serde(rename = "type")]
    pub severity: String,
    pub source: String,
    pub environment: String,
    pub stack: Option<String>,
    pub status_code: Option<i32>,
    pub metadata: Option<serde_json::Value>,
}

/// `logError({message, type, source, environment, stack?, status_code?, metadata?})`.
///
/// Best-effort: a failure here must never be fatal to the worker.
#[async_trait]
pub trait ErrorLog: Send + Sync {
    async fn log_error(&self, entry: ErrorLogEntry);
}

/// XLSX export is out of core scope (spec §4.6/§9): the core calls this
/// collaborator with the same paged row stream it uses for its own CSV/JSON
/// writers rather than owning a spreadsheet-format dependency.
#[async_trait]
pub trait XlsxFormatter: Send + Sync {
    async fn format(&self, rows: Vec<serde_json::Value>) -> anyhow::Result<Vec<u8>>;
}
