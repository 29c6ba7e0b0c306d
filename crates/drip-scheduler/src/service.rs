//! Campaign scheduling operations.

use std::cmp;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{info, warn};
use uuid::Uuid;

use drip_engine::{
    DEFAULT_MAX_ATTEMPTS, EffectiveConfig, JobStatus, ScheduleConfig, ScheduleOverride, SendJob,
    SlotAllocator, resolve,
};
use drip_store::{CampaignSchedule, CampaignStatus, JobStore};

use crate::error::SchedulerError;
use crate::source::{EmailSource, OrgSettings};

/// High-level scheduling operations over the job store.
///
/// Every method takes `now` from the caller so behavior is reproducible in
/// tests; only the dispatch loop reads the clock itself.
pub struct CampaignScheduler {
    store: JobStore,
    emails: Arc<dyn EmailSource>,
    settings: Arc<dyn OrgSettings>,
    default_timezone: String,
    max_attempts: u32,
}

impl CampaignScheduler {
    pub fn new(
        store: JobStore,
        emails: Arc<dyn EmailSource>,
        settings: Arc<dyn OrgSettings>,
        default_timezone: impl Into<String>,
    ) -> Self {
        Self {
            store,
            emails,
            settings,
            default_timezone: default_timezone.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Override the attempt cap used for retry eligibility and cancellation.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Allocates a slot for every pending email in the campaign and persists
    /// the jobs in one batch. Emails that already carry a live job are left
    /// alone. Returns the number of jobs created.
    #[tracing::instrument(skip(self, override_config, now))]
    pub async fn schedule_campaign(
        &self,
        campaign_id: &str,
        organization_id: &str,
        override_config: Option<ScheduleOverride>,
        now: DateTime<Utc>,
    ) -> Result<usize, SchedulerError> {
        // An override with nothing set is the same as no override.
        let override_config = override_config.filter(|over| !over.is_empty());
        let effective = self
            .effective_config(organization_id, override_config.as_ref(), now)
            .await?;

        let pending = self.emails.pending_emails(campaign_id).await?;
        let handled = self.store.handled_email_ids(campaign_id).await?;
        let emails: Vec<_> = pending
            .into_iter()
            .filter(|email| !handled.contains(&email.email_id))
            .collect();

        let slots = self
            .allocate_slots(organization_id, effective, emails.len(), now, now)
            .await?;

        let jobs: Vec<SendJob> = emails
            .into_iter()
            .zip(slots)
            .map(|(email, slot)| SendJob::new(email.email_id, campaign_id, organization_id, slot))
            .collect();
        let created = jobs.len();
        if created > 0 {
            self.store.insert_jobs(jobs).await?;
        }
        self.store
            .save_campaign_schedule(campaign_id, organization_id, override_config.as_ref(), now)
            .await?;

        info!(created, "scheduled campaign sends");
        Ok(created)
    }

    /// Parks every queued job in the campaign. Running sends finish.
    pub async fn pause_campaign(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, SchedulerError> {
        self.require_campaign(campaign_id).await?;
        let paused = self.store.pause_campaign(campaign_id, now).await?;
        info!(campaign_id, paused, "paused campaign");
        Ok(paused)
    }

    /// Re-slots every paused job from `now`, preserving their relative order.
    pub async fn resume_campaign(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, SchedulerError> {
        let schedule = self.require_campaign(campaign_id).await?;
        let paused = self
            .store
            .jobs_with_status(campaign_id, JobStatus::Paused)
            .await?;
        if paused.is_empty() {
            return Ok(0);
        }

        let effective = self
            .effective_config(
                &schedule.organization_id,
                schedule.override_config.as_ref(),
                now,
            )
            .await?;
        let slots = self
            .allocate_slots(&schedule.organization_id, effective, paused.len(), now, now)
            .await?;

        let updates: Vec<(Uuid, DateTime<Utc>)> =
            paused.iter().map(|job| job.id).zip(slots).collect();
        let resumed = self
            .store
            .reslot_jobs(updates, JobStatus::Paused, now)
            .await?;
        info!(campaign_id, resumed, "resumed campaign");
        Ok(resumed)
    }

    /// Gives failed jobs under the attempt cap a fresh slot after the current
    /// scheduled tail. Permanent and capped failures stay failed.
    pub async fn retry_failed(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, SchedulerError> {
        let schedule = self.require_campaign(campaign_id).await?;
        let failed = self
            .store
            .jobs_with_status(campaign_id, JobStatus::Failed)
            .await?;
        let eligible: Vec<_> = failed
            .into_iter()
            .filter(|job| job.is_retry_eligible(self.max_attempts))
            .collect();
        if eligible.is_empty() {
            return Ok(0);
        }

        let effective = self
            .effective_config(
                &schedule.organization_id,
                schedule.override_config.as_ref(),
                now,
            )
            .await?;
        // Retries queue behind the newest scheduled slot, never in front.
        let start_from = match self.store.newest_scheduled_time(campaign_id).await? {
            Some(tail) => cmp::max(
                now,
                tail + Duration::minutes(i64::from(effective.min_gap_minutes)),
            ),
            None => now,
        };
        let slots = self
            .allocate_slots(
                &schedule.organization_id,
                effective,
                eligible.len(),
                start_from,
                now,
            )
            .await?;

        let updates: Vec<(Uuid, DateTime<Utc>)> =
            eligible.iter().map(|job| job.id).zip(slots).collect();
        let retried = self
            .store
            .reslot_jobs(updates, JobStatus::Failed, now)
            .await?;
        info!(campaign_id, retried, "re-queued failed sends");
        Ok(retried)
    }

    /// Cancels everything still cancellable in the campaign: queued, paused,
    /// and retry-eligible failed jobs. Running sends finish; completed,
    /// cancelled, and dead-failed rows are untouched.
    pub async fn cancel_remaining(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, SchedulerError> {
        self.require_campaign(campaign_id).await?;
        let cancelled = self
            .store
            .cancel_campaign(campaign_id, self.max_attempts, now)
            .await?;
        info!(campaign_id, cancelled, "cancelled remaining sends");
        Ok(cancelled)
    }

    /// The email-deletion cascade: cancels the email's live job if it still
    /// has one. Returns how many rows changed (0 or 1).
    pub async fn cancel_email(
        &self,
        email_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, SchedulerError> {
        let cancelled = self
            .store
            .cancel_email(email_id, self.max_attempts, now)
            .await?;
        if cancelled > 0 {
            info!(email_id, "cancelled email send");
        }
        Ok(cancelled)
    }

    /// Aggregate campaign status, derived from the job rows at read time.
    pub async fn campaign_status(
        &self,
        campaign_id: &str,
    ) -> Result<CampaignStatus, SchedulerError> {
        self.require_campaign(campaign_id).await?;
        Ok(self
            .store
            .status_counts(campaign_id, self.max_attempts)
            .await?)
    }

    /// The organization's stored schedule config, or defaults when none has
    /// been saved yet. Nothing is persisted.
    pub async fn organization_config(
        &self,
        organization_id: &str,
    ) -> Result<ScheduleConfig, SchedulerError> {
        match self.store.organization_config(organization_id).await? {
            Some(config) => Ok(config),
            None => Ok(self.default_config(organization_id).await),
        }
    }

    /// Validates and saves an organization's schedule config.
    pub async fn update_organization_config(
        &self,
        organization_id: &str,
        config: ScheduleConfig,
        now: DateTime<Utc>,
    ) -> Result<ScheduleConfig, SchedulerError> {
        resolve(&config, None)?;
        self.store
            .save_organization_config(organization_id, &config, now)
            .await?;
        info!(organization_id, "updated organization schedule config");
        Ok(config)
    }

    /// Loads the organization's config, creating and saving one from defaults
    /// on first contact.
    async fn org_config_or_default(
        &self,
        organization_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ScheduleConfig, SchedulerError> {
        if let Some(config) = self.store.organization_config(organization_id).await? {
            return Ok(config);
        }
        let config = self.default_config(organization_id).await;
        self.store
            .save_organization_config(organization_id, &config, now)
            .await?;
        info!(
            organization_id,
            timezone = %config.timezone,
            "created organization schedule config"
        );
        Ok(config)
    }

    /// Default config with the organization's timezone. The CRM lookup
    /// degrades to the configured fallback timezone.
    async fn default_config(&self, organization_id: &str) -> ScheduleConfig {
        let timezone = match self.settings.timezone(organization_id).await {
            Ok(tz) => tz,
            Err(err) => {
                warn!(
                    organization_id,
                    error = %err,
                    "organization timezone lookup failed, using fallback"
                );
                self.default_timezone.clone()
            }
        };
        ScheduleConfig::defaults(timezone)
    }

    async fn effective_config(
        &self,
        organization_id: &str,
        override_config: Option<&ScheduleOverride>,
        now: DateTime<Utc>,
    ) -> Result<EffectiveConfig, SchedulerError> {
        let org = self.org_config_or_default(organization_id, now).await?;
        Ok(resolve(&org, override_config)?)
    }

    /// Allocates `count` slots from `start_from`, seeding the first-day
    /// counter with the claims already made inside today's local bounds.
    async fn allocate_slots(
        &self,
        organization_id: &str,
        effective: EffectiveConfig,
        count: usize,
        start_from: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
        let already = self
            .store
            .claims_in_window(organization_id, effective.day_bounds(now))
            .await?;
        let allocator = SlotAllocator::new(effective);
        let mut rng = StdRng::from_entropy();
        Ok(allocator.allocate(&mut rng, count, start_from, already)?)
    }

    async fn require_campaign(
        &self,
        campaign_id: &str,
    ) -> Result<CampaignSchedule, SchedulerError> {
        self.store
            .campaign_schedule(campaign_id)
            .await?
            .ok_or_else(|| SchedulerError::CampaignNotFound(campaign_id.to_string()))
    }
}
