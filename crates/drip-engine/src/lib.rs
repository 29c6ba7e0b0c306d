//! Scheduling engine for Drip.
//!
//! This crate holds the pure core of the send scheduler:
//! - Schedule config resolution (organization defaults merged with campaign
//!   overrides, validated, lowered to per-weekday windows)
//! - The slot allocator (quota, gap jitter, and window constraints)
//! - Send job types and the lifecycle transition rules
//!
//! Nothing here performs IO; persistence and dispatch live in `drip-store`
//! and `drip-scheduler`.

mod allocator;
mod config;
mod error;
mod job;

pub use allocator::{MAX_LOOKAHEAD_DAYS, SlotAllocator};
pub use config::{
    DEFAULT_DAILY_LIMIT, DEFAULT_MAX_DAILY_LIMIT, DEFAULT_MAX_GAP_MINUTES,
    DEFAULT_MIN_GAP_MINUTES, DEFAULT_WINDOW_END, DEFAULT_WINDOW_START, DaySchedule, DayWindow,
    EffectiveConfig, ScheduleConfig, ScheduleOverride, resolve,
};
pub use error::EngineError;
pub use job::{DEFAULT_MAX_ATTEMPTS, JobStatus, SendJob};
