//! Named queues and their per-queue defaults (spec §4.2).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The three named queues the broker manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Salesforce,
    Email,
    Notifications,
}

impl QueueName {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Salesforce => "salesforce",
            QueueName::Email => "email",
            QueueName::Notifications => "notifications",
        }
    }

    pub const ALL: [QueueName; 3] = [QueueName::Salesforce, QueueName::Email, QueueName::Notifications];
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Exponential or fixed backoff between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffPolicy {
    /// `delay_n = base * 2^n`
    Exponential { base_ms: u64 },
    /// `delay_n = base`
    Fixed { base_ms: u64 },
}

impl BackoffPolicy {
    /// Delay before attempt `n` (0-based: the delay before the *first* retry
    /// is `delay_for_attempt(0)`).
    pub fn delay_for_attempt(self, n: u32) -> Duration {
        match self {
            BackoffPolicy::Exponential { base_ms } => Duration::from_millis(base_ms.saturating_mul(1u64 << n.min(32))),
            BackoffPolicy::Fixed { base_ms } => Duration::from_millis(base_ms),
        }
    }
}

/// Default retry/removal policy for a named queue, per the table in spec §4.2.
#[derive(Debug, Clone, Copy)]
pub struct QueueDefaults {
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    pub remove_on_complete: u32,
    pub remove_on_fail: u32,
}

impl QueueName {
    pub fn defaults(self) -> QueueDefaults {
        match self {
            QueueName::Salesforce => QueueDefaults {
                attempts: 2,
                backoff: BackoffPolicy::Exponential { base_ms: 500 },
                remove_on_complete: 5_000,
                remove_on_fail: 2_000,
            },
            QueueName::Email => QueueDefaults {
                attempts: 2,
                backoff: BackoffPolicy::Fixed { base_ms: 5_000 },
                remove_on_complete: 50,
                remove_on_fail: 25,
            },
            QueueName::Notifications => QueueDefaults {
                attempts: 5,
                backoff: BackoffPolicy::Exponential { base_ms: 1_000 },
                remove_on_complete: 200,
                remove_on_fail: 100,
            },
        }
    }
}

/// Maximum times an `active` item's lease may silently expire and be
/// returned to `waiting` before stall recovery gives up. Spec §4.2/§9: the
/// original code declared this constant but never referenced it; this
/// specification treats it as authoritative.
pub const MAX_STALLED_COUNT: u32 = 1;
