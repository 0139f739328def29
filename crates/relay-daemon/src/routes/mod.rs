//! HTTP routes for the admin/monitor/cron/handoff surface (spec §6).
//!
//! Routing only, per the teacher's `routes/mod.rs` re-export convention:
//! handlers call straight into the component crates with no auth, CORS, or
//! rate-limit logic of their own (those are `tower` layers a deployment
//! attaches in front of this router).

pub mod cron;
pub mod handoff;
pub mod health;
pub mod monitor;
pub mod queue;

pub use cron::*;
pub use handoff::*;
pub use health::*;
pub use monitor::*;
pub use queue::*;
