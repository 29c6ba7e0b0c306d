use thiserror::Error;

/// Errors surfaced by the job store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A write collided with the one-live-job-per-email constraint.
    #[error("conflict: {0}")]
    Conflict(String),
}
