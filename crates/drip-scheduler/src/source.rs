//! Collaborator seams for the CRM backend.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// A failed upstream CRM call.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SourceError(pub String);

/// An email waiting for a send slot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEmail {
    pub email_id: String,
    pub donor_id: String,
}

/// Lists the campaign emails that still need slots.
#[async_trait]
pub trait EmailSource: Send + Sync {
    async fn pending_emails(&self, campaign_id: &str) -> Result<Vec<PendingEmail>, SourceError>;
}

/// Organization settings that live outside the schedule config.
#[async_trait]
pub trait OrgSettings: Send + Sync {
    /// The organization's IANA timezone, consulted when it gets its first
    /// schedule config.
    async fn timezone(&self, organization_id: &str) -> Result<String, SourceError>;
}

/// Fixed settings for deployments without an organization endpoint.
#[derive(Debug, Clone)]
pub struct StaticOrgSettings {
    timezone: String,
}

impl StaticOrgSettings {
    pub fn new(timezone: impl Into<String>) -> Self {
        Self {
            timezone: timezone.into(),
        }
    }
}

#[async_trait]
impl OrgSettings for StaticOrgSettings {
    async fn timezone(&self, _organization_id: &str) -> Result<String, SourceError> {
        Ok(self.timezone.clone())
    }
}
