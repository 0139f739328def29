//! Batched Audit Writer (C5) and the append-only Audit/Event Log (C6).
//!
//! [`writer`] holds the single actor that coalesces job-status mutations
//! into batched [`relay_store::JobStore`] transactions; [`store`],
//! [`query`] and [`export`] implement the separate, read-heavy Audit/Event
//! Log that records and serves `AuditEntry` rows. The two share a crate
//! because they're both "the audit system" from a caller's perspective, but
//! they touch different stores (Job Store vs. the `audit_log` table) and
//! never call into each other directly.

pub mod export;
pub mod postgres;
pub mod query;
pub mod settings;
pub mod store;
pub mod writer;

pub use postgres::PgAuditStore;
pub use query::{AuditFilter, AuditQueryResult, ColumnFilter, ColumnOperator, HourlyBucket, StatusClassHistogram, TopBucket};
pub use settings::SettingsSnapshot;
pub use store::{AuditError, AuditStore, InMemoryAuditStore};
pub use writer::{spawn, BatchedAuditWriterHandle, JobUpdate, BATCH_SIZE, BATCH_TIMEOUT};
