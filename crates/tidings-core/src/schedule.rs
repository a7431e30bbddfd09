//! Birthday occurrence resolution across IANA timezones.
//!
//! Pure, deterministic functions that turn a recipient's birth date and
//! zone into the next UTC instant at which their local clock reads the
//! configured send hour. All timezone arithmetic in the engine funnels
//! through this module so DST and leap-day behaviour stay in one place.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{CoreError, Result};

/// Widest DST gap to probe across when a wall-clock time does not exist.
/// Offset jumps are one hour almost everywhere; two hours covers the
/// historical outliers.
const MAX_GAP_MINUTES: i64 = 120;

/// A resolved occurrence of a recurring event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    /// Local calendar date of the occurrence in the recipient's zone.
    pub local_date: NaiveDate,
    /// UTC instant of the send hour on `local_date`.
    pub utc_instant: DateTime<Utc>,
}

/// Computes the next occurrence of a birth date at or after now.
///
/// Returns the soonest calendar date ≥ today-in-`tz` whose (month, day)
/// matches the birth date, with the send hour on that date projected to
/// UTC. Feb-29 births observe Feb-28 in non-leap years. Today counts even
/// when the send hour has already passed; callers that care distinguish
/// via the returned instant.
pub fn next_occurrence(
    birth_date: NaiveDate,
    tz: Tz,
    send_hour: u32,
    now_utc: DateTime<Utc>,
) -> Result<Occurrence> {
    validate_send_hour(send_hour)?;

    let today = now_utc.with_timezone(&tz).date_naive();
    let mut local_date = anniversary_in_year(birth_date, today.year());
    if local_date < today {
        local_date = anniversary_in_year(birth_date, today.year() + 1);
    }

    let utc_instant = local_send_instant(local_date, tz, send_hour)?;
    Ok(Occurrence { local_date, utc_instant })
}

/// Projects the send hour on a local calendar date to UTC.
///
/// DST gaps resolve to the first valid wall-clock instant at or after the
/// send hour; fall-back ambiguities resolve to the earlier instant.
pub fn local_send_instant(date: NaiveDate, tz: Tz, send_hour: u32) -> Result<DateTime<Utc>> {
    validate_send_hour(send_hour)?;

    let mut naive = date.and_hms_opt(send_hour, 0, 0).ok_or_else(|| {
        CoreError::validation(format!("invalid wall-clock time {send_hour}:00 on {date}"))
    })?;

    for _ in 0..=MAX_GAP_MINUTES {
        match tz.from_local_datetime(&naive) {
            chrono::LocalResult::Single(local) => return Ok(local.with_timezone(&Utc)),
            chrono::LocalResult::Ambiguous(earlier, _later) => {
                return Ok(earlier.with_timezone(&Utc))
            },
            chrono::LocalResult::None => naive += ChronoDuration::minutes(1),
        }
    }

    Err(CoreError::validation(format!(
        "no valid wall-clock instant near {send_hour}:00 on {date} in {tz}"
    )))
}

/// Whether a UTC instant falls on the given local calendar date in `tz`.
pub fn is_same_local_date(utc_instant: DateTime<Utc>, tz: Tz, date: NaiveDate) -> bool {
    utc_instant.with_timezone(&tz).date_naive() == date
}

/// Whether today in `tz` is the recipient's birthday.
///
/// Feb-29 promotion applies: in non-leap years a Feb-29 birth matches
/// Feb-28.
pub fn matches_local_birthday(birth_date: NaiveDate, tz: Tz, now_utc: DateTime<Utc>) -> bool {
    let today = now_utc.with_timezone(&tz).date_naive();
    anniversary_in_year(birth_date, today.year()) == today
}

/// Time remaining until the next top-of-hour after `now`.
pub fn duration_until_next_hour(now: DateTime<Utc>) -> std::time::Duration {
    let seconds_past = i64::from(now.minute()) * 60 + i64::from(now.second());
    let remaining = 3600 - seconds_past;
    // Land just past minute 0 rather than racing the boundary.
    std::time::Duration::from_secs(remaining.max(1).unsigned_abs())
}

fn validate_send_hour(send_hour: u32) -> Result<()> {
    if send_hour > 23 {
        return Err(CoreError::validation(format!("send hour out of range: {send_hour}")));
    }
    Ok(())
}

fn anniversary_in_year(birth_date: NaiveDate, year: i32) -> NaiveDate {
    match NaiveDate::from_ymd_opt(year, birth_date.month(), birth_date.day()) {
        Some(date) => date,
        // Only Feb 29 fails to materialise; observe Feb 28 instead.
        None => NaiveDate::from_ymd_opt(year, 2, 28).unwrap_or(birth_date),
    }
}

#[cfg(test)]
mod tests {
    use chrono_tz::Tz;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn new_york() -> Tz {
        "America/New_York".parse().unwrap()
    }

    #[test]
    fn new_york_birthday_projects_to_utc() {
        // 2024-01-15 09:00 in New York is EST (UTC-5), i.e. 14:00Z.
        let occurrence =
            next_occurrence(date(1990, 1, 15), new_york(), 9, utc(2024, 1, 15, 13, 0)).unwrap();

        assert_eq!(occurrence.local_date, date(2024, 1, 15));
        assert_eq!(occurrence.utc_instant, utc(2024, 1, 15, 14, 0));
    }

    #[test]
    fn dst_forward_day_uses_edt_offset() {
        // 2024-03-10 is the spring-forward date; 09:00 exists and is EDT
        // (UTC-4), so the projection is 13:00Z.
        let occurrence =
            next_occurrence(date(1990, 3, 10), new_york(), 9, utc(2024, 3, 10, 1, 0)).unwrap();

        assert_eq!(occurrence.local_date, date(2024, 3, 10));
        assert_eq!(occurrence.utc_instant, utc(2024, 3, 10, 13, 0));
    }

    #[test]
    fn leap_day_birth_observes_feb_28_in_non_leap_year() {
        let tz: Tz = "UTC".parse().unwrap();
        let occurrence =
            next_occurrence(date(2000, 2, 29), tz, 9, utc(2025, 1, 1, 0, 0)).unwrap();

        assert_eq!(occurrence.local_date, date(2025, 2, 28));
        assert_eq!(occurrence.utc_instant, utc(2025, 2, 28, 9, 0));
    }

    #[test]
    fn leap_day_birth_keeps_feb_29_in_leap_year() {
        let tz: Tz = "UTC".parse().unwrap();
        let occurrence =
            next_occurrence(date(2000, 2, 29), tz, 9, utc(2024, 1, 1, 0, 0)).unwrap();

        assert_eq!(occurrence.local_date, date(2024, 2, 29));
    }

    #[test]
    fn passed_birthday_rolls_to_next_year() {
        let occurrence =
            next_occurrence(date(1990, 1, 15), new_york(), 9, utc(2024, 6, 1, 12, 0)).unwrap();

        assert_eq!(occurrence.local_date, date(2025, 1, 15));
    }

    #[test]
    fn todays_birthday_counts_even_after_send_hour() {
        // 20:00Z on Jan 15 is 15:00 in New York, past the send hour; the
        // occurrence is still today so the late-registration path can
        // label it.
        let now = utc(2024, 1, 15, 20, 0);
        let occurrence = next_occurrence(date(1990, 1, 15), new_york(), 9, now).unwrap();

        assert_eq!(occurrence.local_date, date(2024, 1, 15));
        assert!(occurrence.utc_instant < now);
    }

    #[test]
    fn local_date_boundary_respects_zone_not_utc() {
        // 03:00Z on Jan 16 is still 22:00 Jan 15 in New York.
        let now = utc(2024, 1, 16, 3, 0);
        let occurrence = next_occurrence(date(1990, 1, 15), new_york(), 9, now).unwrap();

        assert_eq!(occurrence.local_date, date(2024, 1, 15));
    }

    #[test]
    fn dst_gap_resolves_to_first_valid_instant() {
        // 02:00-03:00 does not exist in New York on 2024-03-10. With the
        // send hour configured to 2, the first valid wall clock is 03:00
        // EDT, i.e. 07:00Z.
        let instant = local_send_instant(date(2024, 3, 10), new_york(), 2).unwrap();
        assert_eq!(instant, utc(2024, 3, 10, 7, 0));
    }

    #[test]
    fn dst_ambiguity_resolves_to_earlier_instant() {
        // 01:00 occurs twice in New York on 2024-11-03 (fall back). The
        // earlier instant is EDT (UTC-4), i.e. 05:00Z.
        let instant = local_send_instant(date(2024, 11, 3), new_york(), 1).unwrap();
        assert_eq!(instant, utc(2024, 11, 3, 5, 0));
    }

    #[test]
    fn send_hour_out_of_range_rejected() {
        let err = local_send_instant(date(2024, 1, 1), new_york(), 24);
        assert!(err.is_err());
    }

    #[test]
    fn same_local_date_checks_zone() {
        let tz = new_york();
        // 02:00Z on Jan 16 is the evening of Jan 15 in New York.
        assert!(is_same_local_date(utc(2024, 1, 16, 2, 0), tz, date(2024, 1, 15)));
        assert!(!is_same_local_date(utc(2024, 1, 16, 14, 0), tz, date(2024, 1, 15)));
    }

    #[test]
    fn birthday_match_honours_feb_29_promotion() {
        let tz: Tz = "UTC".parse().unwrap();
        assert!(matches_local_birthday(date(2000, 2, 29), tz, utc(2025, 2, 28, 0, 0)));
        assert!(!matches_local_birthday(date(2000, 2, 29), tz, utc(2024, 2, 28, 0, 0)));
        assert!(matches_local_birthday(date(2000, 2, 29), tz, utc(2024, 2, 29, 0, 0)));
    }

    #[test]
    fn next_hour_duration_counts_down_to_minute_zero() {
        let now = utc(2024, 1, 15, 13, 0) + ChronoDuration::seconds(90);
        let wait = duration_until_next_hour(now);
        assert_eq!(wait, std::time::Duration::from_secs(3600 - 90));

        let at_boundary = utc(2024, 1, 15, 13, 0);
        assert_eq!(duration_until_next_hour(at_boundary), std::time::Duration::from_secs(3600));
    }
}
