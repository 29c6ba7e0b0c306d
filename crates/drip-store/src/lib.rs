//! Persistence for Drip send jobs and schedule configuration.
//!
//! Backed by a single SQLite database:
//!
//! - `JobStore`: async handle over per-operation connections, WAL journaling
//! - Atomic dispatch claims with in-transaction daily-quota checks
//! - All-or-nothing batch inserts guarded by a one-live-job-per-email index
//! - Read-time aggregation for campaign status
//!
//! Timestamps are supplied by callers; nothing in this crate reads the clock.

mod error;
mod store;

pub use error::StoreError;
pub use store::{CampaignSchedule, CampaignStatus, ClaimOutcome, JobStore};
