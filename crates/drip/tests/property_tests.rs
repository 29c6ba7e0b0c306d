//! Property-based tests over the public scheduling types: the wire formats
//! shared with the CRM and the config-merge rules.

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

use drip_engine::{DaySchedule, JobStatus, ScheduleConfig, ScheduleOverride, SendJob, resolve};

// Strategy for kebab-case identifiers the CRM uses for emails and campaigns.
fn identifier() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,20}".prop_map(|s| s.to_string())
}

// Strategy for any job status.
fn any_status() -> impl Strategy<Value = JobStatus> {
    prop_oneof![
        Just(JobStatus::Scheduled),
        Just(JobStatus::Running),
        Just(JobStatus::Completed),
        Just(JobStatus::Failed),
        Just(JobStatus::Cancelled),
        Just(JobStatus::Paused),
    ]
}

// Strategy for a known-good IANA zone.
fn timezone() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("UTC".to_string()),
        Just("America/New_York".to_string()),
        Just("America/Chicago".to_string()),
        Just("Europe/Berlin".to_string()),
        Just("Asia/Tokyo".to_string()),
    ]
}

// Strategy for an on-the-hour window with start strictly before end.
fn window() -> impl Strategy<Value = (String, String)> {
    (0u32..=22, 1u32..=23).prop_map(|(start, span)| {
        let end = (start + span).min(23);
        (format!("{start:02}:00"), format!("{end:02}:00"))
    })
}

// Strategy for a valid per-weekday override entry.
fn day_schedule() -> impl Strategy<Value = DaySchedule> {
    (window(), proptest::bool::ANY).prop_map(|((start_time, end_time), enabled)| DaySchedule {
        start_time,
        end_time,
        enabled,
    })
}

// Strategy for a valid organization config. Limits stay under the ceiling and
// windows are well-formed, so `resolve` always accepts the result.
fn schedule_config() -> impl Strategy<Value = ScheduleConfig> {
    (
        1u32..=150,
        150u32..=500,
        (0u32..=10, 0u32..=10),
        timezone(),
        prop::collection::btree_set(0u8..=6, 0..=7),
        window(),
        prop::collection::btree_map(0u8..=6, day_schedule(), 0..3),
    )
        .prop_map(
            |(
                daily_limit,
                max_daily_limit,
                (min_gap, extra_gap),
                timezone,
                allowed_days,
                (allowed_start_time, allowed_end_time),
                daily_schedules,
            )| ScheduleConfig {
                daily_limit,
                max_daily_limit,
                min_gap_minutes: min_gap,
                max_gap_minutes: min_gap + extra_gap,
                timezone,
                allowed_days,
                allowed_start_time,
                allowed_end_time,
                daily_schedules,
            },
        )
}

proptest! {
    // The stored config format round-trips through JSON unchanged.
    #[test]
    fn schedule_config_roundtrip(config in schedule_config()) {
        let json = serde_json::to_string(&config).unwrap();
        let decoded: ScheduleConfig = serde_json::from_str(&json).unwrap();

        prop_assert_eq!(decoded, config);
    }

    #[test]
    fn send_job_roundtrip(
        email_id in identifier(),
        campaign_id in identifier(),
        organization_id in identifier(),
        status in any_status(),
        attempt_count in 0u32..10,
        minutes in 0i64..527_040,
        last_error in proptest::option::of(".{1,60}"),
        permanent_failure in proptest::bool::ANY,
    ) {
        let scheduled = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + Duration::minutes(minutes);
        let mut job = SendJob::new(
            email_id.clone(),
            campaign_id.clone(),
            organization_id.clone(),
            scheduled,
        );
        job.status = status;
        job.attempt_count = attempt_count;
        job.last_error = last_error.clone();
        job.permanent_failure = permanent_failure;

        let json = serde_json::to_string(&job).unwrap();
        let decoded: SendJob = serde_json::from_str(&json).unwrap();

        prop_assert_eq!(decoded.id, job.id);
        prop_assert_eq!(decoded.email_id, email_id);
        prop_assert_eq!(decoded.campaign_id, campaign_id);
        prop_assert_eq!(decoded.organization_id, organization_id);
        prop_assert_eq!(decoded.scheduled_time, scheduled);
        prop_assert_eq!(decoded.status, status);
        prop_assert_eq!(decoded.attempt_count, attempt_count);
        prop_assert_eq!(decoded.last_error, last_error);
        prop_assert_eq!(decoded.permanent_failure, permanent_failure);
    }

    // The status strings on the wire are the same ones the store persists.
    #[test]
    fn job_status_json_matches_the_storage_string(status in any_status()) {
        let mut job = SendJob::new("email-1", "campaign-1", "org-1", Utc::now());
        job.status = status;

        let json = serde_json::to_value(&job).unwrap();

        prop_assert_eq!(json["status"].as_str().unwrap(), status.as_str());
    }

    // Every overridden field wins the merge; every other field falls through
    // to the organization config.
    #[test]
    fn override_merge_is_field_by_field(
        org in schedule_config(),
        donor in schedule_config(),
        set_limit in proptest::bool::ANY,
        set_gaps in proptest::bool::ANY,
        set_timezone in proptest::bool::ANY,
        set_days in proptest::bool::ANY,
    ) {
        // Gap bounds are overridden as a pair so the merged pair stays ordered.
        let over = ScheduleOverride {
            daily_limit: set_limit.then_some(donor.daily_limit),
            min_gap_minutes: set_gaps.then_some(donor.min_gap_minutes),
            max_gap_minutes: set_gaps.then_some(donor.max_gap_minutes),
            timezone: set_timezone.then(|| donor.timezone.clone()),
            allowed_days: set_days.then(|| donor.allowed_days.clone()),
            allowed_start_time: None,
            allowed_end_time: None,
            daily_schedules: None,
        };

        let effective = resolve(&org, Some(&over)).unwrap();

        let want_limit = if set_limit { donor.daily_limit } else { org.daily_limit };
        let want_min = if set_gaps { donor.min_gap_minutes } else { org.min_gap_minutes };
        let want_max = if set_gaps { donor.max_gap_minutes } else { org.max_gap_minutes };
        let want_tz = if set_timezone { &donor.timezone } else { &org.timezone };

        prop_assert_eq!(effective.daily_limit, want_limit);
        prop_assert_eq!(effective.min_gap_minutes, want_min);
        prop_assert_eq!(effective.max_gap_minutes, want_max);
        prop_assert_eq!(effective.tz.name(), want_tz.as_str());
    }

    // An empty override is indistinguishable from no override.
    #[test]
    fn empty_override_changes_nothing(org in schedule_config()) {
        let plain = resolve(&org, None).unwrap();
        let overridden = resolve(&org, Some(&ScheduleOverride::default())).unwrap();

        prop_assert_eq!(plain, overridden);
    }
}
