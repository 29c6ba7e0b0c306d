//! The dispatch loop: polls for due jobs, claims them, and sends.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use drip_engine::{DEFAULT_MAX_ATTEMPTS, ScheduleConfig, SendJob, resolve};
use drip_store::{ClaimOutcome, JobStore};

use crate::error::SchedulerError;
use crate::transport::MailTransport;

/// Tuning for the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Pause between polls for due jobs.
    pub sweep_interval: Duration,
    /// Hard ceiling on a single transport call.
    pub transport_timeout: Duration,
    /// Attempts after which a job stops being retryable.
    pub max_attempts: u32,
    /// Most jobs taken per sweep.
    pub batch_size: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            transport_timeout: Duration::from_secs(30),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            batch_size: 50,
        }
    }
}

/// What a single sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub sent: u32,
    pub failed: u32,
    pub deferred: u32,
}

enum Dispatch {
    Sent,
    Failed,
    Deferred,
    Skipped,
}

/// Polls the store for due jobs and drives the mail transport.
///
/// The claim is a status CAS combined with a daily-quota count in one store
/// transaction, so concurrent dispatchers never double-send and never push an
/// organization past its limit.
pub struct Dispatcher {
    store: JobStore,
    transport: Arc<dyn MailTransport>,
    default_timezone: String,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: JobStore,
        transport: Arc<dyn MailTransport>,
        default_timezone: impl Into<String>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            transport,
            default_timezone: default_timezone.into(),
            config,
        }
    }

    /// Run the dispatch loop until shutdown is signalled. A sweep already in
    /// progress finishes its batch before the loop stops.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            "dispatcher starting"
        );

        loop {
            if *shutdown_rx.borrow() {
                info!("dispatcher shutting down");
                break;
            }

            match self.sweep(Utc::now()).await {
                Ok(stats) if stats != SweepStats::default() => {
                    info!(
                        sent = stats.sent,
                        failed = stats.failed,
                        deferred = stats.deferred,
                        "sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "sweep failed"),
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("dispatcher received shutdown signal");
                    }
                }
                _ = sleep(self.config.sweep_interval) => {}
            }
        }

        info!("dispatcher shut down gracefully");
    }

    /// One pass over due jobs, oldest slot first. An organization that hits
    /// its daily quota is skipped for the rest of the sweep; its jobs stay
    /// queued for a later day.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepStats, SchedulerError> {
        let due = self.store.due_jobs(now, self.config.batch_size).await?;
        let mut stats = SweepStats::default();
        let mut spent_orgs: BTreeSet<String> = BTreeSet::new();

        for job in due {
            if spent_orgs.contains(&job.organization_id) {
                continue;
            }
            match self.dispatch_one(&job, now).await {
                Ok(Dispatch::Sent) => stats.sent += 1,
                Ok(Dispatch::Failed) => stats.failed += 1,
                Ok(Dispatch::Deferred) => {
                    stats.deferred += 1;
                    spent_orgs.insert(job.organization_id.clone());
                }
                Ok(Dispatch::Skipped) => {}
                Err(e) => {
                    // Leave the row as-is for the next sweep.
                    error!(job_id = %job.id, error = %e, "dispatch failed");
                }
            }
        }

        Ok(stats)
    }

    async fn dispatch_one(
        &self,
        job: &SendJob,
        now: DateTime<Utc>,
    ) -> Result<Dispatch, SchedulerError> {
        // Quota checks use the organization config, never a campaign override.
        let org = match self.store.organization_config(&job.organization_id).await? {
            Some(config) => config,
            None => ScheduleConfig::defaults(self.default_timezone.as_str()),
        };
        let effective = resolve(&org, None)?;

        let outcome = self
            .store
            .claim_due(
                job.id,
                &job.organization_id,
                effective.daily_limit,
                effective.day_bounds(now),
                now,
            )
            .await?;
        match outcome {
            ClaimOutcome::NotClaimable => return Ok(Dispatch::Skipped),
            ClaimOutcome::QuotaExhausted { used } => {
                debug!(
                    organization_id = %job.organization_id,
                    used,
                    "daily quota spent, deferring to the next day"
                );
                return Ok(Dispatch::Deferred);
            }
            ClaimOutcome::Claimed => {}
        }

        match tokio::time::timeout(self.config.transport_timeout, self.transport.send(job)).await {
            Ok(Ok(())) => {
                self.store.complete_job(job.id, Utc::now()).await?;
                debug!(job_id = %job.id, email_id = %job.email_id, "email sent");
                Ok(Dispatch::Sent)
            }
            Ok(Err(e)) => {
                let permanent = e.is_permanent();
                self.store
                    .fail_job(job.id, &e.to_string(), permanent, Utc::now())
                    .await?;
                warn!(job_id = %job.id, permanent, error = %e, "send failed");
                Ok(Dispatch::Failed)
            }
            Err(_) => {
                let message = format!(
                    "send timed out after {}s",
                    self.config.transport_timeout.as_secs()
                );
                self.store
                    .fail_job(job.id, &message, false, Utc::now())
                    .await?;
                warn!(job_id = %job.id, "send timed out");
                Ok(Dispatch::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    use drip_engine::JobStatus;
    use crate::transport::TransportError;

    struct ScriptedTransport {
        outcomes: Mutex<VecDeque<Result<(), TransportError>>>,
        sent: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<Result<(), TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MailTransport for ScriptedTransport {
        async fn send(&self, job: &SendJob) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(job.email_id.clone());
            self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    struct SlowTransport {
        delay: Duration,
    }

    #[async_trait]
    impl MailTransport for SlowTransport {
        async fn send(&self, _job: &SendJob) -> Result<(), TransportError> {
            sleep(self.delay).await;
            Ok(())
        }
    }

    async fn dispatcher_with(
        transport: Arc<dyn MailTransport>,
        config: DispatcherConfig,
    ) -> (Dispatcher, JobStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = JobStore::open(file.path()).await.unwrap();
        let dispatcher = Dispatcher::new(store.clone(), transport, "UTC", config);
        (dispatcher, store, file)
    }

    fn due_job(email: &str, now: DateTime<Utc>, minutes_ago: i64) -> SendJob {
        SendJob::new(
            email,
            "campaign-1",
            "org-1",
            now - ChronoDuration::minutes(minutes_ago),
        )
    }

    #[tokio::test]
    async fn sweep_sends_due_jobs_in_slot_order() {
        let transport = ScriptedTransport::new(vec![]);
        let (dispatcher, store, _file) =
            dispatcher_with(transport.clone(), DispatcherConfig::default()).await;
        let now = Utc::now();
        store
            .insert_jobs(vec![due_job("email-late", now, 1), due_job("email-early", now, 10)])
            .await
            .unwrap();

        let stats = dispatcher.sweep(now).await.unwrap();

        assert_eq!(stats.sent, 2);
        assert_eq!(transport.seen(), vec!["email-early", "email-late"]);
        for job in store.campaign_jobs("campaign-1").await.unwrap() {
            assert_eq!(job.status, JobStatus::Completed);
            assert!(job.actual_send_time.is_some());
        }
    }

    #[tokio::test]
    async fn sweep_leaves_future_jobs_alone() {
        let transport = ScriptedTransport::new(vec![]);
        let (dispatcher, store, _file) =
            dispatcher_with(transport.clone(), DispatcherConfig::default()).await;
        let now = Utc::now();
        store
            .insert_jobs(vec![due_job("email-future", now, -60)])
            .await
            .unwrap();

        let stats = dispatcher.sweep(now).await.unwrap();

        assert_eq!(stats, SweepStats::default());
        assert!(transport.seen().is_empty());
        let jobs = store.campaign_jobs("campaign-1").await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Scheduled);
    }

    #[tokio::test]
    async fn a_transient_failure_stays_retryable() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Transient(
            "upstream 503".to_string(),
        ))]);
        let (dispatcher, store, _file) =
            dispatcher_with(transport, DispatcherConfig::default()).await;
        let now = Utc::now();
        store.insert_jobs(vec![due_job("email-1", now, 1)]).await.unwrap();

        let stats = dispatcher.sweep(now).await.unwrap();

        assert_eq!(stats.failed, 1);
        let job = &store.campaign_jobs("campaign-1").await.unwrap()[0];
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 1);
        assert!(!job.permanent_failure);
        assert!(job.is_retry_eligible(DEFAULT_MAX_ATTEMPTS));
        assert!(job.last_error.as_deref().unwrap().contains("upstream 503"));
    }

    #[tokio::test]
    async fn a_permanent_failure_is_dead() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Permanent(
            "recipient opted out".to_string(),
        ))]);
        let (dispatcher, store, _file) =
            dispatcher_with(transport, DispatcherConfig::default()).await;
        let now = Utc::now();
        store.insert_jobs(vec![due_job("email-1", now, 1)]).await.unwrap();

        dispatcher.sweep(now).await.unwrap();

        let job = &store.campaign_jobs("campaign-1").await.unwrap()[0];
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.permanent_failure);
        assert!(!job.is_retry_eligible(DEFAULT_MAX_ATTEMPTS));
    }

    #[tokio::test]
    async fn quota_exhaustion_defers_the_rest_of_the_organization() {
        let transport = ScriptedTransport::new(vec![]);
        let (dispatcher, store, _file) =
            dispatcher_with(transport.clone(), DispatcherConfig::default()).await;
        let now = Utc::now();
        let mut config = ScheduleConfig::defaults("UTC");
        config.daily_limit = 1;
        store
            .save_organization_config("org-1", &config, now)
            .await
            .unwrap();
        store
            .insert_jobs(vec![
                due_job("email-1", now, 3),
                due_job("email-2", now, 2),
                due_job("email-3", now, 1),
            ])
            .await
            .unwrap();

        let stats = dispatcher.sweep(now).await.unwrap();

        assert_eq!(stats.sent, 1);
        assert_eq!(stats.deferred, 1);
        // Only the first job reached the transport; the rest stay queued.
        assert_eq!(transport.seen(), vec!["email-1"]);
        let jobs = store.campaign_jobs("campaign-1").await.unwrap();
        let queued = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Scheduled)
            .count();
        assert_eq!(queued, 2);
    }

    #[tokio::test]
    async fn a_timed_out_send_counts_as_a_transient_failure() {
        let transport = Arc::new(SlowTransport {
            delay: Duration::from_millis(200),
        });
        let config = DispatcherConfig {
            transport_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (dispatcher, store, _file) = dispatcher_with(transport, config).await;
        let now = Utc::now();
        store.insert_jobs(vec![due_job("email-1", now, 1)]).await.unwrap();

        let stats = dispatcher.sweep(now).await.unwrap();

        assert_eq!(stats.failed, 1);
        let job = &store.campaign_jobs("campaign-1").await.unwrap()[0];
        assert_eq!(job.status, JobStatus::Failed);
        assert!(!job.permanent_failure);
        assert!(job.last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn a_missing_org_config_falls_back_to_defaults() {
        let transport = ScriptedTransport::new(vec![]);
        let (dispatcher, store, _file) =
            dispatcher_with(transport.clone(), DispatcherConfig::default()).await;
        let now = Utc::now();
        store.insert_jobs(vec![due_job("email-1", now, 1)]).await.unwrap();

        let stats = dispatcher.sweep(now).await.unwrap();

        assert_eq!(stats.sent, 1);
        assert_eq!(transport.seen(), vec!["email-1"]);
    }

    #[tokio::test]
    async fn run_stops_on_the_shutdown_signal() {
        let transport = ScriptedTransport::new(vec![]);
        let config = DispatcherConfig {
            sweep_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let (dispatcher, store, _file) = dispatcher_with(transport, config).await;
        let now = Utc::now();
        store.insert_jobs(vec![due_job("email-1", now, 1)]).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { dispatcher.run(shutdown_rx).await });

        sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("dispatcher did not stop")
            .unwrap();

        let job = &store.campaign_jobs("campaign-1").await.unwrap()[0];
        assert_eq!(job.status, JobStatus::Completed);
    }
}
