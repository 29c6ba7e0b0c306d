//! Outbound mail delivery.

use async_trait::async_trait;
use thiserror::Error;

use drip_engine::SendJob;

/// A failed send attempt, classified for retry handling.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Worth retrying: network trouble, upstream 5xx, 408, 429.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Retrying cannot help: the request itself was rejected.
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Delivers one email for a claimed job.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, job: &SendJob) -> Result<(), TransportError>;
}
