//! Send job types and the lifecycle rules governing them.
//!
//! A [`SendJob`] is one persisted send, one row per email. Status transitions
//! are constrained by [`JobStatus::can_transition_to`]; the store enforces the
//! same rules transactionally (conditional updates), this module is the single
//! place the legal matrix is written down.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Attempts a job may consume before `Failed` becomes terminal.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lifecycle states of a send job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(JobStatus::Scheduled),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            "paused" => Some(JobStatus::Paused),
            _ => None,
        }
    }

    /// `Completed` and `Cancelled` are never mutated again. `Failed` is only
    /// terminal past the attempt cap, which is a per-job question; see
    /// [`SendJob::is_retry_eligible`].
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// The legal transition matrix.
    ///
    /// `Scheduled -> Running` additionally requires the job to be due and is
    /// claimed atomically by the dispatcher; `Failed -> Scheduled` is the
    /// bounded retry path.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Scheduled, Running)
                | (Scheduled, Paused)
                | (Scheduled, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Scheduled)
                | (Paused, Cancelled)
                | (Failed, Scheduled)
                | (Failed, Cancelled)
        )
    }

    /// Checked variant of [`Self::can_transition_to`].
    pub fn transition_to(self, next: JobStatus) -> Result<JobStatus, EngineError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(EngineError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scheduled send for one email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendJob {
    pub id: Uuid,
    pub email_id: String,
    pub campaign_id: String,
    pub organization_id: String,
    /// UTC instant derived from the organization timezone at allocation time.
    pub scheduled_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_send_time: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Set when the transport classified the last failure as permanent; such
    /// jobs are excluded from retry no matter the attempt count.
    #[serde(default)]
    pub permanent_failure: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SendJob {
    /// A freshly scheduled job for one email.
    pub fn new(
        email_id: impl Into<String>,
        campaign_id: impl Into<String>,
        organization_id: impl Into<String>,
        scheduled_time: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email_id: email_id.into(),
            campaign_id: campaign_id.into(),
            organization_id: organization_id.into(),
            scheduled_time,
            actual_send_time: None,
            status: JobStatus::Scheduled,
            attempt_count: 0,
            last_error: None,
            permanent_failure: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Scheduled && self.scheduled_time <= now
    }

    /// A failed job may return to the queue until it hits the attempt cap,
    /// unless the transport declared the failure permanent.
    pub fn is_retry_eligible(&self, max_attempts: u32) -> bool {
        self.status == JobStatus::Failed
            && !self.permanent_failure
            && self.attempt_count < max_attempts
    }
}
