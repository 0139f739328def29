//! Minimal concrete collaborators (spec §6 "Collaborator contracts the core
//! consumes"). These are the thinnest possible glue the composition root
//! needs to have *something* to pass to the Scheduler and Worker Pool — the
//! CRM HTTP client and the settings service are explicitly out of core
//! scope (spec §1 Non-goals), so none of this contains CRM payload
//! transformation or business logic, only request plumbing.

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use relay_core::collaborators::{
    CrmClient, CrmResponse, ErrorLog, ErrorLogEntry, SettingsProvider, TokenProvider, TokenResult,
};
use serde_json::Value;

/// Calls a configured CRM base URL with `reqwest`, classifying transport
/// failures into the `ECONNREFUSED`/`ETIMEDOUT` transport codes spec
/// §4.3.1 probes (the teacher's web stack is `reqwest` + `axum`; see
/// `DESIGN.md`).
pub struct HttpCrmClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCrmClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(30)).build().expect("reqwest client builds");
        Self { client, base_url }
    }

    pub fn from_env() -> Self {
        Self::new(env::var("CRM_BASE_URL").unwrap_or_else(|_| "http://localhost:4010".to_string()))
    }
}

#[async_trait]
impl CrmClient for HttpCrmClient {
    async fn direct_api(
        &self,
        endpoint: &str,
        payload: Option<Value>,
        headers: Value,
        is_json: bool,
    ) -> anyhow::Result<CrmResponse> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut request = self.client.post(&url);
        if let Value::Object(map) = &headers {
            for (key, value) in map {
                if let Some(value) = value.as_str() {
                    request = request.header(key, value);
                }
            }
        }
        let request = if is_json { request.json(&payload.unwrap_or(Value::Null)) } else { request };

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                let transport_code = if err.is_timeout() {
                    "ETIMEDOUT"
                } else if err.is_connect() {
                    "ECONNREFUSED"
                } else {
                    "UNKNOWN"
                };
                return Ok(CrmResponse {
                    http_code: 0,
                    data: Value::Null,
                    error_flag: true,
                    headers: None,
                    transport_code: Some(transport_code.to_string()),
                });
            }
        };

        let http_code = response.status().as_u16();
        let error_flag = !response.status().is_success();
        let data = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(CrmResponse { http_code, data, error_flag, headers: None, transport_code: None })
    }
}

/// `getToken()` against a configured token endpoint.
pub struct HttpTokenProvider {
    client: reqwest::Client,
    token_url: String,
}

impl HttpTokenProvider {
    pub fn new(token_url: String) -> Self {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(30)).build().expect("reqwest client builds");
        Self { client, token_url }
    }

    pub fn from_env() -> Self {
        Self::new(env::var("CRM_TOKEN_URL").unwrap_or_else(|_| "http://localhost:4010/oauth/token".to_string()))
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn get_token(&self) -> anyhow::Result<TokenResult> {
        match self.client.post(&self.token_url).send().await {
            Ok(response) if response.status().is_success() => {
                #[derive(serde::Deserialize)]
                struct TokenBody {
                    access_token: String,
                }
                match response.json::<TokenBody>().await {
                    Ok(body) => Ok(TokenResult { success: true, token: Some(body.access_token), error: None }),
                    Err(err) => Ok(TokenResult { success: false, token: None, error: Some(err.to_string()) }),
                }
            }
            Ok(response) => Ok(TokenResult {
                success: false,
                token: None,
                error: Some(format!("token endpoint returned {}", response.status())),
            }),
            Err(err) => Ok(TokenResult { success: false, token: None, error: Some(err.to_string()) }),
        }
    }
}

/// Settings CRUD is out of core scope (spec §1); the daemon reads a single
/// `AUDIT_LOG_ENABLED` env var once at startup and exposes it through the
/// same `SettingsProvider` seam `relay_audit::SettingsSnapshot` expects, so
/// swapping in a real settings service later is a one-file change.
pub struct StaticSettingsProvider {
    enabled: AtomicBool,
}

impl StaticSettingsProvider {
    pub fn from_env() -> Self {
        let enabled = env::var("AUDIT_LOG_ENABLED").map(|v| v != "false" && v != "0").unwrap_or(true);
        Self { enabled: AtomicBool::new(enabled) }
    }
}

#[async_trait]
impl SettingsProvider for StaticSettingsProvider {
    async fn audit_log_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

/// Logs via `tracing` rather than a real log sink; best-effort, never fatal
/// to the worker (spec §6 "Error Log collaborator").
pub struct TracingErrorLog;

#[async_trait]
impl ErrorLog for TracingErrorLog {
    async fn log_error(&self, entry: ErrorLogEntry) {
        tracing::error!(
            source = %entry.source,
            environment = %entry.environment,
            severity = %entry.severity,
            status_code = ?entry.status_code,
            metadata = ?entry.metadata,
            "{}",
            entry.message
        );
    }
}
