//! SQLite-backed job store.
//!
//! One short-lived connection per operation, opened on the Tokio blocking
//! pool. WAL mode keeps readers and the dispatcher from blocking each other;
//! read-then-write sections (the dispatch claim, bulk inserts, re-slotting)
//! run under `BEGIN IMMEDIATE` so the daily-quota check and the status CAS
//! see a stable row set. All timestamps are fixed-width RFC 3339 UTC text,
//! which keeps lexicographic comparison chronological.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use drip_engine::{JobStatus, ScheduleConfig, ScheduleOverride, SendJob};

use crate::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schedule_configs (
    organization_id  TEXT PRIMARY KEY,
    daily_limit      INTEGER NOT NULL,
    max_daily_limit  INTEGER NOT NULL,
    min_gap_minutes  INTEGER NOT NULL,
    max_gap_minutes  INTEGER NOT NULL,
    timezone         TEXT NOT NULL,
    allowed_days     TEXT NOT NULL,
    window_start     TEXT NOT NULL,
    window_end       TEXT NOT NULL,
    daily_windows    TEXT NOT NULL DEFAULT '{}',
    updated_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS campaign_schedules (
    campaign_id     TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL,
    override_json   TEXT,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS send_jobs (
    id                TEXT PRIMARY KEY,
    email_id          TEXT NOT NULL,
    campaign_id       TEXT NOT NULL,
    organization_id   TEXT NOT NULL,
    scheduled_time    TEXT NOT NULL,
    actual_send_time  TEXT,
    status            TEXT NOT NULL DEFAULT 'scheduled',
    attempt_count     INTEGER NOT NULL DEFAULT 0,
    last_error        TEXT,
    permanent_failure INTEGER NOT NULL DEFAULT 0,
    claimed_at        TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_send_jobs_due
    ON send_jobs (status, scheduled_time);

CREATE INDEX IF NOT EXISTS idx_send_jobs_campaign
    ON send_jobs (campaign_id, scheduled_time);

CREATE INDEX IF NOT EXISTS idx_send_jobs_org_claims
    ON send_jobs (organization_id, status, claimed_at);

-- One live job per email: anything not cancelled blocks a second job.
CREATE UNIQUE INDEX IF NOT EXISTS idx_send_jobs_email_live
    ON send_jobs (email_id) WHERE status != 'cancelled';
";

const JOB_COLUMNS: &str = "id, email_id, campaign_id, organization_id, scheduled_time, \
     actual_send_time, status, attempt_count, last_error, permanent_failure, \
     created_at, updated_at";

/// Outcome of a dispatch claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The job is ours; it is now `Running`.
    Claimed,
    /// The organization's daily quota is spent; the job stays `Scheduled`.
    QuotaExhausted { used: u32 },
    /// Another dispatcher got there first, or a reschedule moved the job
    /// past `now` after it was selected.
    NotClaimable,
}

/// The persisted campaign schedule record: which organization a campaign
/// belongs to plus its inline partial override.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignSchedule {
    pub campaign_id: String,
    pub organization_id: String,
    pub override_config: Option<ScheduleOverride>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counts for a campaign, derived from rows at read time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignStatus {
    pub scheduled: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
    pub paused: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_send_time: Option<DateTime<Utc>>,
    /// True when any failure is past the retry cap or permanent.
    pub needs_attention: bool,
}

/// Handle to the send-job database. Cheap to clone; every operation opens its
/// own connection on the blocking pool.
#[derive(Debug, Clone)]
pub struct JobStore {
    db_path: PathBuf,
}

impl JobStore {
    /// Opens the database, creating and migrating it as needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db_path = path.into();
        let store = Self { db_path };
        let path = store.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            conn.execute_batch(SCHEMA)?;
            debug!(path = %path.display(), "job store schema up to date");
            Ok::<_, StoreError>(())
        })
        .await??;
        info!(path = %store.db_path.display(), "opened job store");
        Ok(store)
    }

    // === Organization configs ===

    pub async fn organization_config(
        &self,
        organization_id: &str,
    ) -> Result<Option<ScheduleConfig>, StoreError> {
        let path = self.db_path.clone();
        let organization_id = organization_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            let row = conn
                .query_row(
                    "SELECT daily_limit, max_daily_limit, min_gap_minutes, max_gap_minutes,
                            timezone, allowed_days, window_start, window_end, daily_windows
                     FROM schedule_configs WHERE organization_id = ?1",
                    params![organization_id],
                    |row| {
                        Ok((
                            row.get::<_, u32>(0)?,
                            row.get::<_, u32>(1)?,
                            row.get::<_, u32>(2)?,
                            row.get::<_, u32>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                            row.get::<_, String>(8)?,
                        ))
                    },
                )
                .optional()?;

            let Some((
                daily_limit,
                max_daily_limit,
                min_gap_minutes,
                max_gap_minutes,
                timezone,
                allowed_days,
                window_start,
                window_end,
                daily_windows,
            )) = row
            else {
                return Ok(None);
            };

            Ok(Some(ScheduleConfig {
                daily_limit,
                max_daily_limit,
                min_gap_minutes,
                max_gap_minutes,
                timezone,
                allowed_days: serde_json::from_str(&allowed_days)?,
                allowed_start_time: window_start,
                allowed_end_time: window_end,
                daily_schedules: serde_json::from_str(&daily_windows)?,
            }))
        })
        .await?
    }

    pub async fn save_organization_config(
        &self,
        organization_id: &str,
        config: &ScheduleConfig,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let path = self.db_path.clone();
        let organization_id = organization_id.to_string();
        let config = config.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            conn.execute(
                "INSERT OR REPLACE INTO schedule_configs
                 (organization_id, daily_limit, max_daily_limit, min_gap_minutes,
                  max_gap_minutes, timezone, allowed_days, window_start, window_end,
                  daily_windows, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    organization_id,
                    config.daily_limit,
                    config.max_daily_limit,
                    config.min_gap_minutes,
                    config.max_gap_minutes,
                    config.timezone,
                    serde_json::to_string(&config.allowed_days)?,
                    config.allowed_start_time,
                    config.allowed_end_time,
                    serde_json::to_string(&config.daily_schedules)?,
                    ts(now),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    // === Campaign schedule records ===

    pub async fn campaign_schedule(
        &self,
        campaign_id: &str,
    ) -> Result<Option<CampaignSchedule>, StoreError> {
        let path = self.db_path.clone();
        let campaign_id = campaign_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            let row = conn
                .query_row(
                    "SELECT organization_id, override_json, created_at
                     FROM campaign_schedules WHERE campaign_id = ?1",
                    params![campaign_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            parse_ts(2, &row.get::<_, String>(2)?)?,
                        ))
                    },
                )
                .optional()?;

            let Some((organization_id, override_json, created_at)) = row else {
                return Ok(None);
            };
            let override_config = override_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?;
            Ok(Some(CampaignSchedule {
                campaign_id,
                organization_id,
                override_config,
                created_at,
            }))
        })
        .await?
    }

    pub async fn save_campaign_schedule(
        &self,
        campaign_id: &str,
        organization_id: &str,
        override_config: Option<&ScheduleOverride>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let path = self.db_path.clone();
        let campaign_id = campaign_id.to_string();
        let organization_id = organization_id.to_string();
        let override_json = override_config
            .map(serde_json::to_string)
            .transpose()
            .map_err(StoreError::Serialization)?;
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            conn.execute(
                "INSERT OR REPLACE INTO campaign_schedules
                 (campaign_id, organization_id, override_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![campaign_id, organization_id, override_json, ts(now)],
            )?;
            Ok(())
        })
        .await?
    }

    // === Job writes ===

    /// Inserts a batch of jobs in one transaction. All-or-nothing: a
    /// constraint collision (an email that already has a live job) rolls the
    /// whole batch back.
    pub async fn insert_jobs(&self, jobs: Vec<SendJob>) -> Result<usize, StoreError> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = (|| {
                for job in &jobs {
                    conn.execute(
                        "INSERT INTO send_jobs
                         (id, email_id, campaign_id, organization_id, scheduled_time,
                          actual_send_time, status, attempt_count, last_error,
                          permanent_failure, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                        params![
                            job.id.to_string(),
                            job.email_id,
                            job.campaign_id,
                            job.organization_id,
                            ts(job.scheduled_time),
                            job.actual_send_time.map(ts),
                            job.status.as_str(),
                            job.attempt_count,
                            job.last_error,
                            job.permanent_failure,
                            ts(job.created_at),
                            ts(job.updated_at),
                        ],
                    )
                    .map_err(constraint_to_conflict)?;
                }
                Ok(jobs.len())
            })();
            finish_tx(&conn, result)
        })
        .await?
    }

    /// The atomic dispatch claim: counts the organization's claims inside the
    /// local day bounds and flips the row to `running` only if quota remains
    /// and the row is still `scheduled` and still due, all in one
    /// `BEGIN IMMEDIATE` transaction. Re-checking due-ness here matters: a
    /// pause/resume can re-slot the job to the future between the sweep's
    /// selection and this claim.
    pub async fn claim_due(
        &self,
        job_id: Uuid,
        organization_id: &str,
        daily_limit: u32,
        day_bounds: (DateTime<Utc>, DateTime<Utc>),
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let path = self.db_path.clone();
        let organization_id = organization_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = (|| {
                let used: u32 = conn.query_row(
                    "SELECT COUNT(*) FROM send_jobs
                     WHERE organization_id = ?1
                       AND status IN ('running', 'completed')
                       AND claimed_at >= ?2 AND claimed_at < ?3",
                    params![organization_id, ts(day_bounds.0), ts(day_bounds.1)],
                    |row| row.get(0),
                )?;
                if used >= daily_limit {
                    return Ok(ClaimOutcome::QuotaExhausted { used });
                }
                let claimed = conn.execute(
                    "UPDATE send_jobs
                     SET status = 'running', claimed_at = ?2, updated_at = ?2
                     WHERE id = ?1 AND status = 'scheduled' AND scheduled_time <= ?2",
                    params![job_id.to_string(), ts(now)],
                )?;
                if claimed == 1 {
                    Ok(ClaimOutcome::Claimed)
                } else {
                    Ok(ClaimOutcome::NotClaimable)
                }
            })();
            finish_tx(&conn, result)
        })
        .await?
    }

    /// `Running -> Completed`. Returns false when the row was not `running`.
    pub async fn complete_job(
        &self,
        job_id: Uuid,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            let changed = conn.execute(
                "UPDATE send_jobs
                 SET status = 'completed', actual_send_time = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'running'",
                params![job_id.to_string(), ts(sent_at)],
            )?;
            Ok(changed == 1)
        })
        .await?
    }

    /// `Running -> Failed`: records the error, bumps the attempt counter, and
    /// marks permanence. Returns false when the row was not `running`.
    pub async fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let path = self.db_path.clone();
        let error = error.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            let changed = conn.execute(
                "UPDATE send_jobs
                 SET status = 'failed', last_error = ?2, permanent_failure = ?3,
                     attempt_count = attempt_count + 1, updated_at = ?4
                 WHERE id = ?1 AND status = 'running'",
                params![job_id.to_string(), error, permanent, ts(now)],
            )?;
            Ok(changed == 1)
        })
        .await?
    }

    /// `Scheduled -> Paused` for a whole campaign. Running jobs are left to
    /// finish.
    pub async fn pause_campaign(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let path = self.db_path.clone();
        let campaign_id = campaign_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            let changed = conn.execute(
                "UPDATE send_jobs SET status = 'paused', updated_at = ?2
                 WHERE campaign_id = ?1 AND status = 'scheduled'",
                params![campaign_id, ts(now)],
            )?;
            Ok(changed)
        })
        .await?
    }

    /// Writes fresh slots back and returns the jobs to `scheduled`, in one
    /// transaction. Each update is guarded on the expected current status so
    /// a dispatcher racing this call cannot be overwritten.
    pub async fn reslot_jobs(
        &self,
        updates: Vec<(Uuid, DateTime<Utc>)>,
        expected_status: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = (|| {
                let mut changed = 0;
                for (job_id, slot) in &updates {
                    changed += conn.execute(
                        "UPDATE send_jobs
                         SET status = 'scheduled', scheduled_time = ?2,
                             claimed_at = NULL, updated_at = ?3
                         WHERE id = ?1 AND status = ?4",
                        params![job_id.to_string(), ts(*slot), ts(now), expected_status.as_str()],
                    )?;
                }
                Ok(changed)
            })();
            finish_tx(&conn, result)
        })
        .await?
    }

    /// Cancels every job in the campaign that is still cancellable: queued,
    /// paused, or failed under the retry cap. Running jobs finish; terminal
    /// rows are untouched.
    pub async fn cancel_campaign(
        &self,
        campaign_id: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let path = self.db_path.clone();
        let campaign_id = campaign_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            let changed = conn.execute(
                "UPDATE send_jobs SET status = 'cancelled', updated_at = ?2
                 WHERE campaign_id = ?1
                   AND (status IN ('scheduled', 'paused')
                        OR (status = 'failed' AND permanent_failure = 0
                            AND attempt_count < ?3))",
                params![campaign_id, ts(now), max_attempts],
            )?;
            Ok(changed)
        })
        .await?
    }

    /// The email-deletion cascade: cancels the email's live job if it is
    /// still cancellable.
    pub async fn cancel_email(
        &self,
        email_id: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let path = self.db_path.clone();
        let email_id = email_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            let changed = conn.execute(
                "UPDATE send_jobs SET status = 'cancelled', updated_at = ?2
                 WHERE email_id = ?1
                   AND (status IN ('scheduled', 'paused')
                        OR (status = 'failed' AND permanent_failure = 0
                            AND attempt_count < ?3))",
                params![email_id, ts(now), max_attempts],
            )?;
            Ok(changed)
        })
        .await?
    }

    // === Job reads ===

    pub async fn job(&self, job_id: Uuid) -> Result<Option<SendJob>, StoreError> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            let job = conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM send_jobs WHERE id = ?1"),
                    params![job_id.to_string()],
                    row_to_job,
                )
                .optional()?;
            Ok(job)
        })
        .await?
    }

    pub async fn campaign_jobs(&self, campaign_id: &str) -> Result<Vec<SendJob>, StoreError> {
        let path = self.db_path.clone();
        let campaign_id = campaign_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM send_jobs
                 WHERE campaign_id = ?1 ORDER BY scheduled_time ASC"
            ))?;
            let rows = stmt.query_map(params![campaign_id], row_to_job)?;
            let mut jobs = Vec::new();
            for job in rows {
                jobs.push(job?);
            }
            Ok(jobs)
        })
        .await?
    }

    /// Jobs in one status for a campaign, in original slot order.
    pub async fn jobs_with_status(
        &self,
        campaign_id: &str,
        status: JobStatus,
    ) -> Result<Vec<SendJob>, StoreError> {
        let path = self.db_path.clone();
        let campaign_id = campaign_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM send_jobs
                 WHERE campaign_id = ?1 AND status = ?2
                 ORDER BY scheduled_time ASC"
            ))?;
            let rows = stmt.query_map(params![campaign_id, status.as_str()], row_to_job)?;
            let mut jobs = Vec::new();
            for job in rows {
                jobs.push(job?);
            }
            Ok(jobs)
        })
        .await?
    }

    /// Emails in the campaign that already carry a non-cancelled job; such
    /// emails never get a second one.
    pub async fn handled_email_ids(
        &self,
        campaign_id: &str,
    ) -> Result<BTreeSet<String>, StoreError> {
        let path = self.db_path.clone();
        let campaign_id = campaign_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            let mut stmt = conn.prepare(
                "SELECT email_id FROM send_jobs
                 WHERE campaign_id = ?1 AND status != 'cancelled'",
            )?;
            let rows = stmt.query_map(params![campaign_id], |row| row.get::<_, String>(0))?;
            let mut ids = BTreeSet::new();
            for id in rows {
                ids.insert(id?);
            }
            Ok(ids)
        })
        .await?
    }

    /// Scheduled jobs whose slot has arrived, oldest first.
    pub async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<SendJob>, StoreError> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM send_jobs
                 WHERE status = 'scheduled' AND scheduled_time <= ?1
                 ORDER BY scheduled_time ASC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![ts(now), limit], row_to_job)?;
            let mut jobs = Vec::new();
            for job in rows {
                jobs.push(job?);
            }
            Ok(jobs)
        })
        .await?
    }

    /// Claims made today (running or completed) inside the given org-local
    /// day bounds; what resume feeds the allocator as `already_sent_today`.
    pub async fn claims_in_window(
        &self,
        organization_id: &str,
        day_bounds: (DateTime<Utc>, DateTime<Utc>),
    ) -> Result<u32, StoreError> {
        let path = self.db_path.clone();
        let organization_id = organization_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            let used = conn.query_row(
                "SELECT COUNT(*) FROM send_jobs
                 WHERE organization_id = ?1
                   AND status IN ('running', 'completed')
                   AND claimed_at >= ?2 AND claimed_at < ?3",
                params![organization_id, ts(day_bounds.0), ts(day_bounds.1)],
                |row| row.get(0),
            )?;
            Ok(used)
        })
        .await?
    }

    /// The newest slot still queued for the campaign; retries are appended
    /// after it.
    pub async fn newest_scheduled_time(
        &self,
        campaign_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let path = self.db_path.clone();
        let campaign_id = campaign_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            let raw: Option<String> = conn.query_row(
                "SELECT MAX(scheduled_time) FROM send_jobs
                 WHERE campaign_id = ?1 AND status = 'scheduled'",
                params![campaign_id],
                |row| row.get(0),
            )?;
            match raw {
                Some(raw) => Ok(Some(parse_ts(0, &raw)?)),
                None => Ok(None),
            }
        })
        .await?
    }

    /// Aggregate counts plus the next pending slot, derived from rows at read
    /// time.
    pub async fn status_counts(
        &self,
        campaign_id: &str,
        max_attempts: u32,
    ) -> Result<CampaignStatus, StoreError> {
        let path = self.db_path.clone();
        let campaign_id = campaign_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            let mut status = CampaignStatus::default();

            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM send_jobs
                 WHERE campaign_id = ?1 GROUP BY status",
            )?;
            let rows = stmt.query_map(params![campaign_id], |row| {
                let name: String = row.get(0)?;
                let kind = JobStatus::parse(&name).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        format!("unknown job status: {name}").into(),
                    )
                })?;
                Ok((kind, row.get::<_, u32>(1)?))
            })?;
            for row in rows {
                let (kind, count) = row?;
                match kind {
                    JobStatus::Scheduled => status.scheduled = count,
                    JobStatus::Running => status.running = count,
                    JobStatus::Completed => status.completed = count,
                    JobStatus::Failed => status.failed = count,
                    JobStatus::Cancelled => status.cancelled = count,
                    JobStatus::Paused => status.paused = count,
                }
            }

            let next: Option<String> = conn.query_row(
                "SELECT MIN(scheduled_time) FROM send_jobs
                 WHERE campaign_id = ?1 AND status = 'scheduled'",
                params![campaign_id],
                |row| row.get(0),
            )?;
            status.next_send_time = match next {
                Some(raw) => Some(parse_ts(0, &raw)?),
                None => None,
            };

            status.needs_attention = conn.query_row(
                "SELECT EXISTS(
                     SELECT 1 FROM send_jobs
                     WHERE campaign_id = ?1 AND status = 'failed'
                       AND (permanent_failure = 1 OR attempt_count >= ?2))",
                params![campaign_id, max_attempts],
                |row| row.get(0),
            )?;

            Ok(status)
        })
        .await?
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

/// Commit on success, best-effort rollback on failure.
fn finish_tx<T>(conn: &Connection, result: Result<T, StoreError>) -> Result<T, StoreError> {
    match result {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(err)
        }
    }
}

fn constraint_to_conflict(err: rusqlite::Error) -> StoreError {
    if err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) {
        StoreError::Conflict("an email in the batch already has a live job".to_string())
    } else {
        StoreError::Database(err)
    }
}

/// Fixed-width RFC 3339 UTC, seconds precision.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<SendJob> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let scheduled_time = parse_ts(4, &row.get::<_, String>(4)?)?;
    let actual_send_time = match row.get::<_, Option<String>>(5)? {
        Some(raw) => Some(parse_ts(5, &raw)?),
        None => None,
    };
    let status_raw: String = row.get(6)?;
    let status = JobStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown job status: {status_raw}").into(),
        )
    })?;
    Ok(SendJob {
        id,
        email_id: row.get(1)?,
        campaign_id: row.get(2)?,
        organization_id: row.get(3)?,
        scheduled_time,
        actual_send_time,
        status,
        attempt_count: row.get(7)?,
        last_error: row.get(8)?,
        permanent_failure: row.get(9)?,
        created_at: parse_ts(10, &row.get::<_, String>(10)?)?,
        updated_at: parse_ts(11, &row.get::<_, String>(11)?)?,
    })
}
