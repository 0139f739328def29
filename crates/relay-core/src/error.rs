//! Error taxonomy shared across the execution plane (spec §7).
//!
//! Workers never let an unhandled error escape to the broker; every failure
//! is translated into an [`ErrorCategory`] first, which carries its own
//! retry and severity classification. This mirrors the teacher's rule that
//! no bare `anyhow::Error` crosses a component boundary — the boundary here
//! is the worker-to-broker `fail()` call.

use serde::{Deserialize, Serialize};

/// Classification of a CRM call failure, probed in the fixed order given in
/// spec §4.3.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Auth,
    Authz,
    RateLimit,
    Server,
    Connection,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    /// Classify an HTTP status code / transport error code pair using the
    /// probe order from spec §4.3.1: HTTP code first, then transport code,
    /// falling back to `Unknown`.
    pub fn classify(http_code: Option<u16>, transport_code: Option<&str>) -> Self {
        match http_code {
            Some(401) => return ErrorCategory::Auth,
            Some(403) => return ErrorCategory::Authz,
            Some(429) => return ErrorCategory::RateLimit,
            Some(code) if code >= 500 => return ErrorCategory::Server,
            _ => {}
        }
        match transport_code {
            Some("ECONNREFUSED") => ErrorCategory::Connection,
            Some("ETIMEDOUT") => ErrorCategory::Timeout,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Retryable categories per spec §4.3.2: `SERVER`, `CONNECTION`,
    /// `RATE_LIMIT`, `TIMEOUT`. `AUTH`, `AUTHZ`, `UNKNOWN` are terminal.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Server | ErrorCategory::Connection | ErrorCategory::RateLimit | ErrorCategory::Timeout
        )
    }

    /// Severity for the Error Log collaborator (spec §4.3.2): total mapping,
    /// every category has a severity (P7).
    pub fn severity(self) -> ErrorSeverity {
        match self {
            ErrorCategory::Server | ErrorCategory::Connection => ErrorSeverity::Critical,
            ErrorCategory::Auth | ErrorCategory::Authz => ErrorSeverity::Error,
            ErrorCategory::RateLimit | ErrorCategory::Timeout | ErrorCategory::Unknown => ErrorSeverity::Warning,
        }
    }

    /// The `metadata.errorType` string used in Error Log entries.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Auth => "AUTH",
            ErrorCategory::Authz => "AUTHZ",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::Server => "SERVER",
            ErrorCategory::Connection => "CONNECTION",
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity recorded on the Error Log collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Critical,
    Error,
    Warning,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorSeverity::Critical => "critical",
            ErrorSeverity::Error => "error",
            ErrorSeverity::Warning => "warning",
        };
        write!(f, "{s}")
    }
}

/// Top-level failure taxonomy (spec §7): `Transient` failures are retried by
/// the broker, `Permanent` failures are terminal, `Internal` failures
/// indicate a bug or invariant violation and are always logged at critical
/// severity regardless of the triggering [`ErrorCategory`].
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("transient failure ({category}): {message}")]
    Transient { category: ErrorCategory, message: String },

    #[error("permanent failure ({category}): {message}")]
    Permanent { category: ErrorCategory, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Build a `Transient`/`Permanent` error from a classified CRM failure,
    /// choosing the variant via [`ErrorCategory::is_retryable`].
    pub fn from_category(category: ErrorCategory, message: impl Into<String>) -> Self {
        let message = message.into();
        if category.is_retryable() {
            RelayError::Transient { category, message }
        } else {
            RelayError::Permanent { category, message }
        }
    }

    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            RelayError::Transient { category, .. } | RelayError::Permanent { category, .. } => Some(*category),
            RelayError::Internal(_) => None,
        }
    }

    /// Whether the broker should requeue this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::Transient { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_probes_http_before_transport() {
        assert_eq!(ErrorCategory::classify(Some(401), Some("ETIMEDOUT")), ErrorCategory::Auth);
        assert_eq!(ErrorCategory::classify(Some(403), None), ErrorCategory::Authz);
        assert_eq!(ErrorCategory::classify(Some(429), None), ErrorCategory::RateLimit);
        assert_eq!(ErrorCategory::classify(Some(500), None), ErrorCategory::Server);
        assert_eq!(ErrorCategory::classify(Some(503), None), ErrorCategory::Server);
    }

    #[test]
    fn classify_falls_back_to_transport_code() {
        assert_eq!(ErrorCategory::classify(None, Some("ECONNREFUSED")), ErrorCategory::Connection);
        assert_eq!(ErrorCategory::classify(None, Some("ETIMEDOUT")), ErrorCategory::Timeout);
        assert_eq!(ErrorCategory::classify(None, Some("EOTHER")), ErrorCategory::Unknown);
        assert_eq!(ErrorCategory::classify(None, None), ErrorCategory::Unknown);
    }

    #[test]
    fn classify_non_5xx_http_falls_through_to_transport() {
        assert_eq!(ErrorCategory::classify(Some(200), Some("ETIMEDOUT")), ErrorCategory::Timeout);
    }

    #[test]
    fn retryable_categories_match_spec() {
        assert!(ErrorCategory::Server.is_retryable());
        assert!(ErrorCategory::Connection.is_retryable());
        assert!(ErrorCategory::RateLimit.is_retryable());
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(!ErrorCategory::Auth.is_retryable());
        assert!(!ErrorCategory::Authz.is_retryable());
        assert!(!ErrorCategory::Unknown.is_retryable());
    }

    #[test]
    fn severity_mapping_is_total_and_matches_spec() {
        assert_eq!(ErrorCategory::Server.severity(), ErrorSeverity::Critical);
        assert_eq!(ErrorCategory::Connection.severity(), ErrorSeverity::Critical);
        assert_eq!(ErrorCategory::Auth.severity(), ErrorSeverity::Error);
        assert_eq!(ErrorCategory::Authz.severity(), ErrorSeverity::Error);
        assert_eq!(ErrorCategory::RateLimit.severity(), ErrorSeverity::Warning);
        assert_eq!(ErrorCategory::Timeout.severity(), ErrorSeverity::Warning);
        assert_eq!(ErrorCategory::Unknown.severity(), ErrorSeverity::Warning);
    }

    #[test]
    fn from_category_picks_variant_by_retryability() {
        let transient = RelayError::from_category(ErrorCategory::Server, "boom");
        assert!(transient.is_retryable());

        let permanent = RelayError::from_category(ErrorCategory::Auth, "nope");
        assert!(!permanent.is_retryable());
    }
}
