//! Error types for scheduling and dispatch.

use thiserror::Error;

use drip_engine::EngineError;
use drip_store::StoreError;

use crate::source::SourceError;

/// Errors that can occur in scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Engine error.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Campaign has no schedule on record.
    #[error("campaign not found: {0}")]
    CampaignNotFound(String),

    /// Upstream CRM call failed.
    #[error("CRM error: {0}")]
    Crm(#[from] SourceError),
}
