//! The slot allocator: turns a batch of emails into individually timed send
//! slots under one effective configuration.
//!
//! Allocation is a pure function of the config, the batch size, the start
//! instant, the already-sent-today count, and an injected RNG, so a seeded
//! run is fully reproducible while production draws real entropy for gap
//! jitter. All window arithmetic happens on wall-clock times in the
//! organization timezone; only the returned slots are UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use rand::Rng;

use crate::config::{DayWindow, EffectiveConfig};
use crate::error::EngineError;

/// How far past the start instant the window search will look before giving
/// up on a misconfigured calendar.
pub const MAX_LOOKAHEAD_DAYS: i64 = 730;

/// Computes send slots for batches of emails. See [`SlotAllocator::allocate`].
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    config: EffectiveConfig,
}

impl SlotAllocator {
    pub fn new(config: EffectiveConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EffectiveConfig {
        &self.config
    }

    /// Allocates one slot per email, in input order.
    ///
    /// Walks a cursor forward from `start_from`: snap into the next allowed
    /// window, roll to the next allowed day once `daily_limit` slots have
    /// landed on the current organization-local day, assign, then advance by
    /// a uniform random gap in `[min_gap, max_gap]` minutes.
    /// `already_sent_today` counts against the first day only while the
    /// cursor is still on the day the run started.
    ///
    /// Fails with [`EngineError::NoSendWindowAvailable`] when the limit is
    /// zero, no weekday is sendable, or the search would pass
    /// [`MAX_LOOKAHEAD_DAYS`]. Nothing is partially allocated on failure.
    pub fn allocate<R: Rng>(
        &self,
        rng: &mut R,
        count: usize,
        start_from: DateTime<Utc>,
        already_sent_today: u32,
    ) -> Result<Vec<DateTime<Utc>>, EngineError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if self.config.daily_limit == 0 {
            return Err(EngineError::NoSendWindowAvailable(
                "daily limit is zero".to_string(),
            ));
        }
        if !self.config.has_send_days() {
            return Err(EngineError::NoSendWindowAvailable(
                "every weekday is disabled".to_string(),
            ));
        }

        let horizon = start_from + Duration::days(MAX_LOOKAHEAD_DAYS);
        let mut cursor = start_from;
        let mut current_day = self.local_date(start_from);
        let mut sent_on_day = already_sent_today;

        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            cursor = self.advance_to_window(cursor, horizon)?;

            let day = self.local_date(cursor);
            if day != current_day {
                current_day = day;
                sent_on_day = 0;
            }
            if sent_on_day >= self.config.daily_limit {
                cursor = self.next_day_window_start(current_day, horizon)?;
                current_day = self.local_date(cursor);
                sent_on_day = 0;
            }

            slots.push(cursor);
            sent_on_day += 1;

            let gap = rng.gen_range(self.config.min_gap_minutes..=self.config.max_gap_minutes);
            cursor += Duration::minutes(i64::from(gap));
        }

        Ok(slots)
    }

    fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.config.tz).date_naive()
    }

    /// Moves the cursor to the next instant inside an allowed window: the
    /// cursor itself if it already sits in one, today's window start if the
    /// window has not opened yet, otherwise the next allowed day's start.
    fn advance_to_window(
        &self,
        cursor: DateTime<Utc>,
        horizon: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, EngineError> {
        let local = cursor.with_timezone(&self.config.tz);
        let date = local.date_naive();
        if let Some(window) = self.config.window_for(date.weekday()) {
            let time = local.time();
            if time < window.start {
                if let Some(start) = self.day_window_start(date, window)? {
                    return Ok(start);
                }
            } else if time <= window.end {
                // The window end is inclusive.
                return Ok(cursor);
            }
        }
        self.next_day_window_start(date, horizon)
    }

    /// The window start of the first allowed day strictly after `after`.
    fn next_day_window_start(
        &self,
        after: NaiveDate,
        horizon: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, EngineError> {
        let horizon_date = self.local_date(horizon);
        let mut date = after;
        loop {
            date = date.succ_opt().ok_or_else(|| {
                EngineError::NoSendWindowAvailable("calendar overflow".to_string())
            })?;
            if date > horizon_date {
                return Err(EngineError::NoSendWindowAvailable(format!(
                    "no slot within {MAX_LOOKAHEAD_DAYS} days of the start"
                )));
            }
            if let Some(window) = self.config.window_for(date.weekday()) {
                if let Some(start) = self.day_window_start(date, window)? {
                    return Ok(start);
                }
            }
        }
    }

    /// The UTC instant `date`'s window opens, or `None` when a spring-forward
    /// gap swallowed the whole window: the shifted start would land past the
    /// window end, so no wall-clock time inside the window exists that day.
    fn day_window_start(
        &self,
        date: NaiveDate,
        window: DayWindow,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        let start = self.resolve_local(date, window.start)?;
        if start.with_timezone(&self.config.tz).time() > window.end {
            return Ok(None);
        }
        Ok(Some(start))
    }

    /// Maps an organization-local wall-clock moment to UTC. A time erased by
    /// a spring-forward gap shifts one hour later; a repeated fall-back time
    /// takes its first occurrence.
    fn resolve_local(&self, date: NaiveDate, time: NaiveTime) -> Result<DateTime<Utc>, EngineError> {
        let naive = date.and_time(time);
        if let Some(resolved) = self.config.tz.from_local_datetime(&naive).earliest() {
            return Ok(resolved.with_timezone(&Utc));
        }
        let shifted = naive + Duration::hours(1);
        self.config
            .tz
            .from_local_datetime(&shifted)
            .earliest()
            .map(|resolved| resolved.with_timezone(&Utc))
            .ok_or_else(|| {
                EngineError::NoSendWindowAvailable(format!(
                    "local time {naive} does not exist in {}",
                    self.config.tz
                ))
            })
    }
}
