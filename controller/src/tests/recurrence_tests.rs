//! Tests for the recurrence rule parser and next-fire computation

use crate::recurrence::{run_schedule, Rule, RuleError};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Monday 2025-03-10, 09:30 UTC.
fn anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 9, 30, 0).unwrap()
}

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

#[test]
fn test_parse_rejects_missing_freq() {
    assert_eq!(
        Rule::parse("INTERVAL=2", anchor()).unwrap_err(),
        RuleError::MissingFreq
    );
    assert_eq!(Rule::parse("", anchor()).unwrap_err(), RuleError::MissingFreq);
}

#[test]
fn test_parse_rejects_bad_values() {
    assert!(matches!(
        Rule::parse("FREQ=MONTHLY", anchor()).unwrap_err(),
        RuleError::InvalidValue { .. }
    ));
    assert!(matches!(
        Rule::parse("FREQ=DAILY;BYHOUR=24", anchor()).unwrap_err(),
        RuleError::InvalidValue { .. }
    ));
    assert!(matches!(
        Rule::parse("FREQ=DAILY;BYMINUTE=61", anchor()).unwrap_err(),
        RuleError::InvalidValue { .. }
    ));
    assert!(matches!(
        Rule::parse("FREQ=HOURLY;INTERVAL=0", anchor()).unwrap_err(),
        RuleError::InvalidValue { .. }
    ));
}

#[test]
fn test_parse_rejects_unknown_keys_and_malformed_parts() {
    assert!(matches!(
        Rule::parse("FREQ=DAILY;BYMONTH=2", anchor()).unwrap_err(),
        RuleError::UnknownKey(_)
    ));
    assert!(matches!(
        Rule::parse("FREQ", anchor()).unwrap_err(),
        RuleError::Malformed(_)
    ));
}

#[test]
fn test_parse_is_case_insensitive_and_trims() {
    let a = Rule::parse("freq=daily; byhour=8 ;byminute=15", anchor()).unwrap();
    let b = Rule::parse("FREQ=DAILY;BYHOUR=8;BYMINUTE=15", anchor()).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_hourly_follows_anchor_minute() {
    let rule = Rule::parse("FREQ=HOURLY", anchor()).unwrap();
    assert_eq!(rule.next_after(anchor()), Some(at(2025, 3, 10, 10, 30)));
    assert_eq!(
        rule.next_after(at(2025, 3, 10, 10, 30)),
        Some(at(2025, 3, 10, 11, 30))
    );
}

#[test]
fn test_hourly_interval_with_byminute() {
    let rule = Rule::parse("FREQ=HOURLY;INTERVAL=2;BYMINUTE=0,15", anchor()).unwrap();
    // The 09:xx candidates precede the anchor, so the first fire is at 11:00.
    assert_eq!(rule.next_after(anchor()), Some(at(2025, 3, 10, 11, 0)));
    assert_eq!(
        rule.next_after(at(2025, 3, 10, 11, 0)),
        Some(at(2025, 3, 10, 11, 15))
    );
    assert_eq!(
        rule.next_after(at(2025, 3, 10, 11, 15)),
        Some(at(2025, 3, 10, 13, 0))
    );
}

#[test]
fn test_hourly_byhour_restricts_hours() {
    let rule = Rule::parse("FREQ=HOURLY;BYHOUR=8,20;BYMINUTE=0", anchor()).unwrap();
    // Anchored at 09:30: nothing fires until 20:00 the same day.
    assert_eq!(rule.next_after(anchor()), Some(at(2025, 3, 10, 20, 0)));
    assert_eq!(
        rule.next_after(at(2025, 3, 10, 20, 0)),
        Some(at(2025, 3, 11, 8, 0))
    );
}

#[test]
fn test_daily_expands_byhour_and_byminute() {
    let rule = Rule::parse("FREQ=DAILY;BYHOUR=8,20;BYMINUTE=30", anchor()).unwrap();
    assert_eq!(rule.next_after(anchor()), Some(at(2025, 3, 10, 20, 30)));
    assert_eq!(
        rule.next_after(at(2025, 3, 10, 20, 30)),
        Some(at(2025, 3, 11, 8, 30))
    );
}

#[test]
fn test_daily_interval_skips_days() {
    let rule = Rule::parse("FREQ=DAILY;INTERVAL=3;BYHOUR=6;BYMINUTE=0", anchor()).unwrap();
    // Day 0 fires at 06:00 which precedes the anchor; day 3 is next.
    assert_eq!(rule.next_after(anchor()), Some(at(2025, 3, 13, 6, 0)));
    assert_eq!(
        rule.next_after(at(2025, 3, 13, 6, 0)),
        Some(at(2025, 3, 16, 6, 0))
    );
}

#[test]
fn test_daily_defaults_to_anchor_time() {
    let rule = Rule::parse("FREQ=DAILY", anchor()).unwrap();
    assert_eq!(rule.next_after(anchor()), Some(at(2025, 3, 11, 9, 30)));
}

#[test]
fn test_weekly_keeps_anchor_weekday() {
    let rule = Rule::parse("FREQ=WEEKLY", anchor()).unwrap();
    assert_eq!(rule.next_after(anchor()), Some(at(2025, 3, 17, 9, 30)));

    let biweekly = Rule::parse("FREQ=WEEKLY;INTERVAL=2", anchor()).unwrap();
    assert_eq!(biweekly.next_after(anchor()), Some(at(2025, 3, 24, 9, 30)));
}

#[test]
fn test_next_is_strictly_after() {
    let rule = Rule::parse("FREQ=DAILY;BYHOUR=9;BYMINUTE=30", anchor()).unwrap();
    let fire = rule.next_after(anchor()).unwrap();
    assert!(fire > anchor());
    // Asking again from the fire instant never returns it twice.
    assert!(rule.next_after(fire).unwrap() > fire);
}

#[test]
fn test_missed_fires_are_not_replayed() {
    let rule = Rule::parse("FREQ=HOURLY;BYMINUTE=0", anchor()).unwrap();
    // A wake three days late asks from "now", not from the last fire.
    let late = at(2025, 3, 13, 14, 20);
    assert_eq!(rule.next_after(late), Some(at(2025, 3, 13, 15, 0)));
}

#[test]
fn test_anchor_seconds_are_truncated() {
    let odd_anchor = Utc.with_ymd_and_hms(2025, 3, 10, 9, 30, 47).unwrap();
    let rule = Rule::parse("FREQ=HOURLY", odd_anchor).unwrap();
    assert_eq!(rule.next_after(odd_anchor), Some(at(2025, 3, 10, 10, 30)));
}

#[tokio::test]
async fn test_cancelled_schedule_stops_promptly() {
    // The next fire is far in the future, so the loop sits in its sleep.
    let rule = Rule::parse("FREQ=WEEKLY", Utc::now()).unwrap();
    let token = CancellationToken::new();
    let fires = Arc::new(AtomicUsize::new(0));

    let loop_fires = Arc::clone(&fires);
    let handle = tokio::spawn(run_schedule(rule, token.clone(), move || {
        let fires = Arc::clone(&loop_fires);
        async move {
            fires.fetch_add(1, Ordering::SeqCst);
        }
    }));

    token.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("schedule loop did not stop after cancel")
        .unwrap();
    assert_eq!(fires.load(Ordering::SeqCst), 0);
}
