// Property-based tests for schedule validation and next-execution calculation

use chrono::{Duration, TimeZone, Utc};
use common::models::ScheduleSpec;
use common::schedule::{
    calculate_cron_next_execution, default_timezone, normalize_cron_expression, validate_spec,
    ScheduleTrigger,
};
use proptest::prelude::*;

#[test]
fn rejects_cron_and_at_together() {
    let spec = ScheduleSpec {
        cron: Some("0 * * * *".to_string()),
        at: Some(Utc::now() + Duration::hours(1)),
        ..Default::default()
    };
    assert!(validate_spec(&spec, default_timezone(), Utc::now()).is_err());
}

// Any `at` not strictly after now is rejected; any later one is accepted.
#[test]
fn property_at_must_be_in_the_future() {
    proptest!(|(offset_seconds in -86_400i64..86_400)| {
        let now = Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap();
        let spec = ScheduleSpec {
            at: Some(now + Duration::seconds(offset_seconds)),
            ..Default::default()
        };
        let result = validate_spec(&spec, default_timezone(), now);
        prop_assert_eq!(result.is_ok(), offset_seconds > 0);
    });
}

// Every-n-minutes cron yields a strictly later time on an n-minute boundary.
#[test]
fn property_cron_next_is_after_reference() {
    proptest!(|(
        step in prop::sample::select(vec![1u32, 2, 5, 10, 15, 30]),
        minutes_after_epoch in 0i64..5_000_000,
    )| {
        let expression = normalize_cron_expression(&format!("*/{} * * * *", step));
        let after = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
            + Duration::minutes(minutes_after_epoch)
            + Duration::seconds(17);

        let next = calculate_cron_next_execution(&expression, default_timezone(), None, after)
            .unwrap()
            .unwrap();
        prop_assert!(next > after);
        prop_assert!(next - after <= Duration::minutes(step as i64));
        prop_assert_eq!(next.timestamp() % 60, 0);
        prop_assert_eq!((next.timestamp() / 60) % 60 % step as i64, 0);
    });
}

// With a limit, no next execution exists once the count reaches it.
#[test]
fn property_limit_stops_schedule() {
    proptest!(|(limit in 1u64..20, count in 0u64..40)| {
        let spec = ScheduleSpec {
            cron: Some("0 * * * *".to_string()),
            limit: Some(limit),
            ..Default::default()
        };
        let now = Utc::now();
        let next = spec.next_execution_time(now, count, default_timezone()).unwrap();
        prop_assert_eq!(next.is_none(), count >= limit);
        prop_assert_eq!(spec.is_complete(count, now), count >= limit);
    });
}

#[test]
fn end_date_bounds_cron() {
    let after = Utc.with_ymd_and_hms(2030, 1, 1, 10, 30, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2030, 1, 1, 10, 45, 0).unwrap();
    let next = calculate_cron_next_execution(
        &normalize_cron_expression("0 * * * *"),
        default_timezone(),
        Some(end),
        after,
    )
    .unwrap();
    assert!(next.is_none());
}
