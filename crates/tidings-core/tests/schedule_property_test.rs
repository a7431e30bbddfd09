//! Property-based tests for occurrence-resolution invariants.
//!
//! Uses randomly generated birth dates, zones, and clock instants to
//! verify the resolver's guarantees hold regardless of input.

use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use tidings_core::{is_same_local_date, next_occurrence};

/// Creates property test configuration based on environment.
fn proptest_config() -> ProptestConfig {
    let cases = std::env::var("PROPTEST_CASES").ok().and_then(|s| s.parse().ok()).unwrap_or(64);
    ProptestConfig::with_cases(cases)
}

/// A spread of real zones across offsets, including UTC+14 and UTC-11.
fn zone_strategy() -> impl Strategy<Value = Tz> {
    prop::sample::select(vec![
        "UTC",
        "America/New_York",
        "America/Los_Angeles",
        "Europe/Berlin",
        "Asia/Tokyo",
        "Asia/Kolkata",
        "Australia/Sydney",
        "Pacific/Kiritimati",
        "Pacific/Pago_Pago",
    ])
    .prop_map(|name| name.parse().expect("known zone"))
}

fn birth_date_strategy() -> impl Strategy<Value = NaiveDate> {
    (1950i32..=2010, 1u32..=366).prop_map(|(year, ordinal)| {
        NaiveDate::from_yo_opt(year, ordinal)
            .unwrap_or_else(|| NaiveDate::from_yo_opt(year, 1).expect("day one exists"))
    })
}

fn instant_strategy() -> impl Strategy<Value = chrono::DateTime<Utc>> {
    // 2020-01-01 .. 2030-01-01, minute granularity.
    (0i64..=(10 * 365 * 24 * 60)).prop_map(|minutes| {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::minutes(minutes)
    })
}

proptest! {
    #![proptest_config(proptest_config())]

    /// The resolved occurrence is never before today in the zone and
    /// never more than a year out.
    #[test]
    fn occurrence_is_within_the_coming_year(
        birth_date in birth_date_strategy(),
        tz in zone_strategy(),
        now in instant_strategy(),
    ) {
        let occurrence = next_occurrence(birth_date, tz, 9, now).expect("resolvable");
        let today = now.with_timezone(&tz).date_naive();

        prop_assert!(occurrence.local_date >= today);
        prop_assert!(occurrence.local_date <= today + chrono::Duration::days(366));
    }

    /// The occurrence lands on the birth (month, day), except Feb-29
    /// births observing Feb-28.
    #[test]
    fn occurrence_matches_birth_month_and_day(
        birth_date in birth_date_strategy(),
        tz in zone_strategy(),
        now in instant_strategy(),
    ) {
        let occurrence = next_occurrence(birth_date, tz, 9, now).expect("resolvable");

        let leap_promotion = birth_date.month() == 2
            && birth_date.day() == 29
            && occurrence.local_date.month() == 2
            && occurrence.local_date.day() == 28;
        let exact = occurrence.local_date.month() == birth_date.month()
            && occurrence.local_date.day() == birth_date.day();

        prop_assert!(exact || leap_promotion);
    }

    /// The UTC instant projects back onto the occurrence's local date.
    #[test]
    fn utc_instant_falls_on_the_local_date(
        birth_date in birth_date_strategy(),
        tz in zone_strategy(),
        now in instant_strategy(),
    ) {
        let occurrence = next_occurrence(birth_date, tz, 9, now).expect("resolvable");

        prop_assert!(is_same_local_date(occurrence.utc_instant, tz, occurrence.local_date));
    }

    /// Resolution is deterministic: same inputs, same output.
    #[test]
    fn occurrence_is_deterministic(
        birth_date in birth_date_strategy(),
        tz in zone_strategy(),
        now in instant_strategy(),
    ) {
        let first = next_occurrence(birth_date, tz, 9, now).expect("resolvable");
        let second = next_occurrence(birth_date, tz, 9, now).expect("resolvable");

        prop_assert_eq!(first, second);
    }
}
