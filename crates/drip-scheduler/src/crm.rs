//! HTTP client for the donor CRM's internal API.
//!
//! One client covers all three collaborator seams: pending-email listing,
//! organization settings, and the actual send call.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use drip_engine::SendJob;

use crate::source::{EmailSource, OrgSettings, PendingEmail, SourceError};
use crate::transport::{MailTransport, TransportError};

/// Client for the CRM endpoints Drip depends on.
pub struct CrmClient {
    http: Client,
    base_url: String,
}

impl CrmClient {
    /// Create a new client for the given CRM base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl EmailSource for CrmClient {
    async fn pending_emails(&self, campaign_id: &str) -> Result<Vec<PendingEmail>, SourceError> {
        let url = format!(
            "{}/internal/campaigns/{}/emails",
            self.base_url, campaign_id
        );

        let response = self
            .http
            .get(&url)
            .query(&[("status", "pending")])
            .send()
            .await
            .map_err(|e| SourceError(format!("pending email fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SourceError(format!(
                "pending email fetch failed ({})",
                response.status()
            )));
        }

        let emails: Vec<PendingEmail> = response
            .json()
            .await
            .map_err(|e| SourceError(format!("invalid pending email response: {e}")))?;
        debug!(campaign_id, count = emails.len(), "fetched pending emails");
        Ok(emails)
    }
}

#[async_trait]
impl OrgSettings for CrmClient {
    async fn timezone(&self, organization_id: &str) -> Result<String, SourceError> {
        #[derive(Deserialize)]
        struct OrgResponse {
            timezone: String,
        }

        let url = format!(
            "{}/internal/organizations/{}",
            self.base_url, organization_id
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError(format!("organization lookup failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SourceError(format!(
                "organization lookup failed ({})",
                response.status()
            )));
        }

        let org: OrgResponse = response
            .json()
            .await
            .map_err(|e| SourceError(format!("invalid organization response: {e}")))?;
        Ok(org.timezone)
    }
}

#[async_trait]
impl MailTransport for CrmClient {
    async fn send(&self, job: &SendJob) -> Result<(), TransportError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct SendRequest<'a> {
            job_id: Uuid,
            campaign_id: &'a str,
        }

        let url = format!("{}/internal/emails/{}/send", self.base_url, job.email_id);

        let response = self
            .http
            .post(&url)
            .json(&SendRequest {
                job_id: job.id,
                campaign_id: &job.campaign_id,
            })
            .send()
            .await
            .map_err(|e| TransportError::Transient(format!("send request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!(email_id = %job.email_id, "send accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("send rejected ({status}): {body}");
        // 408 and 429 are the only client errors worth another attempt.
        if status.is_client_error()
            && status != StatusCode::REQUEST_TIMEOUT
            && status != StatusCode::TOO_MANY_REQUESTS
        {
            Err(TransportError::Permanent(message))
        } else {
            Err(TransportError::Transient(message))
        }
    }
}
