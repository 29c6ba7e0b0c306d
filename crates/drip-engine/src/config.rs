//! Schedule configuration and the resolver that merges organization defaults
//! with campaign overrides.
//!
//! Every organization has one stored [`ScheduleConfig`]; a campaign may carry a
//! partial [`ScheduleOverride`]. [`resolve`] merges the two field-by-field,
//! validates the result, and lowers the per-weekday layering into an
//! [`EffectiveConfig`] ready for allocation.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Default sends per organization-local day for a new organization.
pub const DEFAULT_DAILY_LIMIT: u32 = 150;

/// Ceiling an operator can never raise `daily_limit` beyond.
pub const DEFAULT_MAX_DAILY_LIMIT: u32 = 500;

/// Default minimum minutes between consecutive sends.
pub const DEFAULT_MIN_GAP_MINUTES: u32 = 1;

/// Default maximum minutes between consecutive sends.
pub const DEFAULT_MAX_GAP_MINUTES: u32 = 3;

/// Default daily window bounds, local to the organization timezone.
pub const DEFAULT_WINDOW_START: &str = "09:00";
pub const DEFAULT_WINDOW_END: &str = "17:00";

fn default_daily_limit() -> u32 {
    DEFAULT_DAILY_LIMIT
}

fn default_max_daily_limit() -> u32 {
    DEFAULT_MAX_DAILY_LIMIT
}

fn default_min_gap() -> u32 {
    DEFAULT_MIN_GAP_MINUTES
}

fn default_max_gap() -> u32 {
    DEFAULT_MAX_GAP_MINUTES
}

fn default_window_start() -> String {
    DEFAULT_WINDOW_START.to_string()
}

fn default_window_end() -> String {
    DEFAULT_WINDOW_END.to_string()
}

/// Monday through Friday, in the 0=Sunday..6=Saturday numbering the CRM uses.
fn default_allowed_days() -> BTreeSet<u8> {
    (1..=5).collect()
}

fn default_enabled() -> bool {
    true
}

/// Per-weekday window override. When an entry exists for a weekday it governs
/// that day entirely: `enabled = false` removes the day no matter what
/// `allowed_days` says, and an enabled entry supplies its own window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySchedule {
    pub start_time: String,
    pub end_time: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Organization-level schedule configuration, one per organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default = "default_max_daily_limit")]
    pub max_daily_limit: u32,
    #[serde(default = "default_min_gap")]
    pub min_gap_minutes: u32,
    #[serde(default = "default_max_gap")]
    pub max_gap_minutes: u32,
    /// IANA zone name, e.g. `America/New_York`. Day boundaries and windows are
    /// evaluated in this zone.
    pub timezone: String,
    #[serde(default = "default_allowed_days")]
    pub allowed_days: BTreeSet<u8>,
    #[serde(default = "default_window_start")]
    pub allowed_start_time: String,
    #[serde(default = "default_window_end")]
    pub allowed_end_time: String,
    /// Keyed by weekday number (0=Sunday..6=Saturday).
    #[serde(default)]
    pub daily_schedules: BTreeMap<u8, DaySchedule>,
}

impl ScheduleConfig {
    /// The documented defaults for an organization that has never saved a
    /// config: 150/day under a 500 ceiling, 1..3 minute gaps, Mon-Fri
    /// 09:00-17:00 in the organization's recorded timezone.
    pub fn defaults(timezone: impl Into<String>) -> Self {
        Self {
            daily_limit: DEFAULT_DAILY_LIMIT,
            max_daily_limit: DEFAULT_MAX_DAILY_LIMIT,
            min_gap_minutes: DEFAULT_MIN_GAP_MINUTES,
            max_gap_minutes: DEFAULT_MAX_GAP_MINUTES,
            timezone: timezone.into(),
            allowed_days: default_allowed_days(),
            allowed_start_time: default_window_start(),
            allowed_end_time: default_window_end(),
            daily_schedules: BTreeMap::new(),
        }
    }
}

/// Campaign-level partial override. Only overridden fields are present; the
/// organization's `max_daily_limit` is deliberately absent, the ceiling always
/// comes from the organization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_gap_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_gap_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_days: Option<BTreeSet<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_schedules: Option<BTreeMap<u8, DaySchedule>>,
}

impl ScheduleOverride {
    pub fn is_empty(&self) -> bool {
        self.daily_limit.is_none()
            && self.min_gap_minutes.is_none()
            && self.max_gap_minutes.is_none()
            && self.timezone.is_none()
            && self.allowed_days.is_none()
            && self.allowed_start_time.is_none()
            && self.allowed_end_time.is_none()
            && self.daily_schedules.is_none()
    }
}

/// One weekday's validated sending window, end inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// A merged, validated configuration ready for allocation. Windows are lowered
/// to a per-weekday lookup once here rather than re-derived per email.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub daily_limit: u32,
    pub min_gap_minutes: u32,
    pub max_gap_minutes: u32,
    pub tz: Tz,
    windows: [Option<DayWindow>; 7],
}

impl EffectiveConfig {
    /// The sending window for a weekday, or `None` when sending is disabled
    /// that day.
    pub fn window_for(&self, weekday: Weekday) -> Option<DayWindow> {
        self.windows[weekday.num_days_from_sunday() as usize]
    }

    pub fn has_send_days(&self) -> bool {
        self.windows.iter().any(Option::is_some)
    }

    /// UTC bounds `[start, end)` of the organization-local calendar day
    /// containing `at`. Daily quota counts run against these bounds.
    pub fn day_bounds(&self, at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let date = at.with_timezone(&self.tz).date_naive();
        (
            day_start(&self.tz, date),
            day_start(&self.tz, date + chrono::Duration::days(1)),
        )
    }
}

/// Local midnight of `date` in UTC, or the first instant after it when a DST
/// transition erases midnight itself.
fn day_start(tz: &Tz, date: chrono::NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    for shift in 0..4 {
        let candidate = midnight + chrono::Duration::hours(shift);
        if let Some(resolved) = tz.from_local_datetime(&candidate).earliest() {
            return resolved.with_timezone(&Utc);
        }
    }
    // No zone skips four hours at midnight.
    Utc.from_utc_datetime(&midnight)
}

/// Merges the organization config with an optional campaign override and
/// validates the result.
///
/// The merge is field-by-field: every overridden field replaces the
/// organization value wholesale, unset fields fall through. Validation rejects
/// a daily limit above the organization ceiling, inverted gap bounds, an
/// unknown timezone, weekday numbers outside 0..=6, malformed `HH:MM` strings,
/// and any enabled day whose window start is not strictly before its end.
pub fn resolve(
    org: &ScheduleConfig,
    campaign: Option<&ScheduleOverride>,
) -> Result<EffectiveConfig, EngineError> {
    let mut merged = org.clone();
    if let Some(over) = campaign {
        if let Some(v) = over.daily_limit {
            merged.daily_limit = v;
        }
        if let Some(v) = over.min_gap_minutes {
            merged.min_gap_minutes = v;
        }
        if let Some(v) = over.max_gap_minutes {
            merged.max_gap_minutes = v;
        }
        if let Some(v) = &over.timezone {
            merged.timezone = v.clone();
        }
        if let Some(v) = &over.allowed_days {
            merged.allowed_days = v.clone();
        }
        if let Some(v) = &over.allowed_start_time {
            merged.allowed_start_time = v.clone();
        }
        if let Some(v) = &over.allowed_end_time {
            merged.allowed_end_time = v.clone();
        }
        if let Some(v) = &over.daily_schedules {
            merged.daily_schedules = v.clone();
        }
    }

    // The ceiling is the organization's even when the limit was overridden.
    if merged.daily_limit > org.max_daily_limit {
        return Err(EngineError::InvalidScheduleConfig(format!(
            "daily limit {} exceeds the organization ceiling {}",
            merged.daily_limit, org.max_daily_limit
        )));
    }
    if merged.min_gap_minutes > merged.max_gap_minutes {
        return Err(EngineError::InvalidScheduleConfig(format!(
            "minimum gap {} exceeds maximum gap {}",
            merged.min_gap_minutes, merged.max_gap_minutes
        )));
    }

    let tz: Tz = merged.timezone.parse().map_err(|_| {
        EngineError::InvalidScheduleConfig(format!("unknown timezone: {}", merged.timezone))
    })?;

    for &day in &merged.allowed_days {
        if day > 6 {
            return Err(EngineError::InvalidScheduleConfig(format!(
                "weekday {day} is outside 0..=6"
            )));
        }
    }
    for &day in merged.daily_schedules.keys() {
        if day > 6 {
            return Err(EngineError::InvalidScheduleConfig(format!(
                "weekday {day} is outside 0..=6"
            )));
        }
    }

    let default_window = DayWindow {
        start: parse_hhmm(&merged.allowed_start_time)?,
        end: parse_hhmm(&merged.allowed_end_time)?,
    };

    let mut windows: [Option<DayWindow>; 7] = [None; 7];
    for (day, slot) in windows.iter_mut().enumerate() {
        let day = day as u8;
        let window = match merged.daily_schedules.get(&day) {
            Some(sched) if !sched.enabled => None,
            Some(sched) => Some(DayWindow {
                start: parse_hhmm(&sched.start_time)?,
                end: parse_hhmm(&sched.end_time)?,
            }),
            None if merged.allowed_days.contains(&day) => Some(default_window),
            None => None,
        };
        if let Some(w) = window {
            if w.start >= w.end {
                return Err(EngineError::InvalidScheduleConfig(format!(
                    "window start {} is not before end {} on weekday {day}",
                    w.start.format("%H:%M"),
                    w.end.format("%H:%M"),
                )));
            }
        }
        *slot = window;
    }

    Ok(EffectiveConfig {
        daily_limit: merged.daily_limit,
        min_gap_minutes: merged.min_gap_minutes,
        max_gap_minutes: merged.max_gap_minutes,
        tz,
        windows,
    })
}

fn parse_hhmm(s: &str) -> Result<NaiveTime, EngineError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| EngineError::InvalidScheduleConfig(format!("invalid HH:MM time: {s:?}")))
}
