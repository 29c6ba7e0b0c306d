use thiserror::Error;

use crate::job::JobStatus;

/// Errors raised by config resolution, slot allocation, and transition checks.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid schedule config: {0}")]
    InvalidScheduleConfig(String),

    #[error("no send window available: {0}")]
    NoSendWindowAvailable(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}
