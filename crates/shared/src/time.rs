//! Billing calendar helpers
//!
//! All billing periods, usage months and cron triggers use Korea Standard Time.
//! KST has no daylight saving, so a fixed offset is exact.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, TimeZone, Utc};

pub const BILLING_UTC_OFFSET_HOURS: i32 = 9;

/// The fixed billing timezone (UTC+9)
pub fn billing_tz() -> FixedOffset {
    // 9 * 3600 is always within the valid +-86_400 range
    FixedOffset::east_opt(BILLING_UTC_OFFSET_HOURS * 3600).unwrap_or_else(|| Utc.fix())
}

/// Start (inclusive) and end (exclusive) of the billing-timezone calendar month containing `at`
pub fn month_bounds(at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let tz = billing_tz();
    let local = at.with_timezone(&tz);

    let first = NaiveDate::from_ymd_opt(local.year(), local.month(), 1).unwrap_or(local.date_naive());
    let next = if local.month() == 12 {
        NaiveDate::from_ymd_opt(local.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(local.year(), local.month() + 1, 1)
    }
    .unwrap_or(first);

    let to_utc = |d: NaiveDate| {
        d.and_hms_opt(0, 0, 0)
            .and_then(|ndt| tz.from_local_datetime(&ndt).single())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(at)
    };

    (to_utc(first), to_utc(next))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_bounds_uses_kst_calendar() {
        // 2026-01-31 20:00 UTC is already February 1st in Seoul
        let at = Utc.with_ymd_and_hms(2026, 1, 31, 20, 0, 0).unwrap();
        let (start, end) = month_bounds(at);

        assert_eq!(start, Utc.with_ymd_and_hms(2026, 1, 31, 15, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 2, 28, 15, 0, 0).unwrap());
    }

    #[test]
    fn test_month_bounds_december_rolls_year() {
        let at = Utc.with_ymd_and_hms(2026, 12, 10, 0, 0, 0).unwrap();
        let (start, end) = month_bounds(at);

        assert_eq!(start, Utc.with_ymd_and_hms(2026, 11, 30, 15, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 12, 31, 15, 0, 0).unwrap());
    }
}
