//! Shared domain types and collaborator contracts for the durable job
//! execution plane: the [`job`], [`audit`], [`error`] and [`queue`] data
//! models, plus the [`collaborators`] traits the core consumes from
//! out-of-scope systems.

pub mod audit;
pub mod collaborators;
pub mod error;
pub mod job;
pub mod queue;

pub use audit::{status_code, AuditAction, AuditEntry, NewAuditEntry};
pub use error::{ErrorCategory, ErrorSeverity, RelayError};
pub use job::{Job, JobPatch, JobStatus, NewJob};
pub use queue::{BackoffPolicy, QueueDefaults, QueueName, MAX_STALLED_COUNT};
