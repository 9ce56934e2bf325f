//! Pure date-to-period math. Everything here is side-effect free so the
//! instance engine and streak walk can be tested without a database.

use chrono::{Datelike, Duration, NaiveDate};

use crate::models::TimeMode;

/// The time window a tracker instance covers. `tracking_date` is the
/// period's anchor: the date itself for daily trackers, the configured
/// start-of-week for weekly, the first of the month for monthly. Instances
/// are unique per (tracker, `tracking_date`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub tracking_date: NaiveDate,
}

/// Compute the period containing `date` for the given time mode.
/// `week_start` is the anchor weekday for weekly mode, 0 = Monday.
#[must_use]
pub fn period_for(date: NaiveDate, mode: TimeMode, week_start: i64) -> Period {
    match mode {
        TimeMode::Daily => Period {
            start: date,
            end: date,
            tracking_date: date,
        },
        TimeMode::Weekly => {
            let anchor = week_anchor(date, week_start);
            Period {
                start: anchor,
                end: anchor + Duration::days(6),
                tracking_date: anchor,
            }
        }
        TimeMode::Monthly => {
            let first = month_start(date);
            Period {
                start: first,
                end: month_end(date),
                tracking_date: first,
            }
        }
    }
}

/// Anchor of the period immediately before the one containing `date`.
/// The streak walk steps backward through history with this.
#[must_use]
pub fn previous_tracking_date(date: NaiveDate, mode: TimeMode, week_start: i64) -> NaiveDate {
    let current = period_for(date, mode, week_start);
    period_for(current.start - Duration::days(1), mode, week_start).tracking_date
}

/// All distinct periods intersecting `[start, end]`, ascending. The first
/// period may begin before `start` when `start` falls mid-period.
#[must_use]
pub fn periods_between(
    start: NaiveDate,
    end: NaiveDate,
    mode: TimeMode,
    week_start: i64,
) -> Vec<Period> {
    let mut periods = Vec::new();
    let mut current = period_for(start, mode, week_start);
    while current.start <= end {
        periods.push(current);
        current = period_for(current.end + Duration::days(1), mode, week_start);
    }
    periods
}

/// Most recent date on or before `date` whose weekday is `week_start` (0 = Monday).
fn week_anchor(date: NaiveDate, week_start: i64) -> NaiveDate {
    let dow = i64::from(date.weekday().num_days_from_monday());
    let back = (dow - week_start).rem_euclid(7);
    date - Duration::days(back)
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.day0()))
}

fn month_end(date: NaiveDate) -> NaiveDate {
    let next_month_first = if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    };
    // The first of a month always exists; map_or keeps this infallible.
    next_month_first.map_or(date, |d| d - Duration::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_daily_period_is_the_date_itself() {
        let p = period_for(d(2025, 3, 14), TimeMode::Daily, 0);
        assert_eq!(p.start, d(2025, 3, 14));
        assert_eq!(p.end, d(2025, 3, 14));
        assert_eq!(p.tracking_date, d(2025, 3, 14));
    }

    #[test]
    fn test_weekly_period_monday_start() {
        // 2025-03-14 is a Friday; week starts Monday 2025-03-10
        let p = period_for(d(2025, 3, 14), TimeMode::Weekly, 0);
        assert_eq!(p.start, d(2025, 3, 10));
        assert_eq!(p.end, d(2025, 3, 16));
        assert_eq!(p.tracking_date, d(2025, 3, 10));
    }

    #[test]
    fn test_weekly_period_sunday_start() {
        // week_start 6 = Sunday; for Friday 2025-03-14 the anchor is Sunday 2025-03-09
        let p = period_for(d(2025, 3, 14), TimeMode::Weekly, 6);
        assert_eq!(p.start, d(2025, 3, 9));
        assert_eq!(p.end, d(2025, 3, 15));
    }

    #[test]
    fn test_weekly_anchor_on_the_anchor_day_itself() {
        // Monday with Monday start: the anchor is the date itself
        let p = period_for(d(2025, 3, 10), TimeMode::Weekly, 0);
        assert_eq!(p.tracking_date, d(2025, 3, 10));
        // Sunday with Sunday start
        let p = period_for(d(2025, 3, 9), TimeMode::Weekly, 6);
        assert_eq!(p.tracking_date, d(2025, 3, 9));
    }

    #[test]
    fn test_weekly_period_crosses_month_boundary() {
        // 2025-04-02 is a Wednesday; Monday-start week began 2025-03-31
        let p = period_for(d(2025, 4, 2), TimeMode::Weekly, 0);
        assert_eq!(p.start, d(2025, 3, 31));
        assert_eq!(p.end, d(2025, 4, 6));
    }

    #[test]
    fn test_weekly_period_crosses_year_boundary() {
        // 2025-01-02 is a Thursday; Monday-start week began 2024-12-30
        let p = period_for(d(2025, 1, 2), TimeMode::Weekly, 0);
        assert_eq!(p.start, d(2024, 12, 30));
        assert_eq!(p.end, d(2025, 1, 5));
    }

    #[test]
    fn test_monthly_period() {
        let p = period_for(d(2025, 3, 14), TimeMode::Monthly, 0);
        assert_eq!(p.start, d(2025, 3, 1));
        assert_eq!(p.end, d(2025, 3, 31));
        assert_eq!(p.tracking_date, d(2025, 3, 1));
    }

    #[test]
    fn test_monthly_period_leap_february() {
        let p = period_for(d(2024, 2, 10), TimeMode::Monthly, 0);
        assert_eq!(p.end, d(2024, 2, 29));
        let p = period_for(d(2025, 2, 10), TimeMode::Monthly, 0);
        assert_eq!(p.end, d(2025, 2, 28));
    }

    #[test]
    fn test_monthly_period_december() {
        let p = period_for(d(2025, 12, 25), TimeMode::Monthly, 0);
        assert_eq!(p.start, d(2025, 12, 1));
        assert_eq!(p.end, d(2025, 12, 31));
    }

    #[test]
    fn test_previous_tracking_date_daily() {
        assert_eq!(
            previous_tracking_date(d(2025, 3, 1), TimeMode::Daily, 0),
            d(2025, 2, 28)
        );
    }

    #[test]
    fn test_previous_tracking_date_weekly() {
        assert_eq!(
            previous_tracking_date(d(2025, 3, 10), TimeMode::Weekly, 0),
            d(2025, 3, 3)
        );
        // From mid-week, the previous anchor is still one week before this week's anchor
        assert_eq!(
            previous_tracking_date(d(2025, 3, 14), TimeMode::Weekly, 0),
            d(2025, 3, 3)
        );
    }

    #[test]
    fn test_previous_tracking_date_monthly() {
        assert_eq!(
            previous_tracking_date(d(2025, 3, 14), TimeMode::Monthly, 0),
            d(2025, 2, 1)
        );
        assert_eq!(
            previous_tracking_date(d(2025, 1, 1), TimeMode::Monthly, 0),
            d(2024, 12, 1)
        );
    }

    #[test]
    fn test_periods_between_daily() {
        let periods = periods_between(d(2025, 1, 1), d(2025, 1, 5), TimeMode::Daily, 0);
        assert_eq!(periods.len(), 5);
        assert_eq!(periods[0].tracking_date, d(2025, 1, 1));
        assert_eq!(periods[4].tracking_date, d(2025, 1, 5));
    }

    #[test]
    fn test_periods_between_weekly() {
        // Jan 1 2025 is a Wednesday; three Monday-start weeks cover Jan 1–15
        let periods = periods_between(d(2025, 1, 1), d(2025, 1, 15), TimeMode::Weekly, 0);
        assert_eq!(periods.len(), 3);
        assert_eq!(periods[0].tracking_date, d(2024, 12, 30));
        assert_eq!(periods[1].tracking_date, d(2025, 1, 6));
        assert_eq!(periods[2].tracking_date, d(2025, 1, 13));
    }

    #[test]
    fn test_periods_between_monthly() {
        let periods = periods_between(d(2025, 1, 15), d(2025, 3, 2), TimeMode::Monthly, 0);
        assert_eq!(periods.len(), 3);
        assert_eq!(periods[0].tracking_date, d(2025, 1, 1));
        assert_eq!(periods[2].tracking_date, d(2025, 3, 1));
    }

    #[test]
    fn test_periods_between_single_day() {
        let periods = periods_between(d(2025, 1, 1), d(2025, 1, 1), TimeMode::Daily, 0);
        assert_eq!(periods.len(), 1);
    }

    #[test]
    fn test_week_anchor_every_offset() {
        // For Wednesday 2025-03-12, check the anchor for every week_start
        let date = d(2025, 3, 12);
        let expected = [
            d(2025, 3, 10), // Monday
            d(2025, 3, 11), // Tuesday
            d(2025, 3, 12), // Wednesday (same day)
            d(2025, 3, 6),  // Thursday of previous week
            d(2025, 3, 7),  // Friday
            d(2025, 3, 8),  // Saturday
            d(2025, 3, 9),  // Sunday
        ];
        for (ws, want) in expected.iter().enumerate() {
            let p = period_for(date, TimeMode::Weekly, ws as i64);
            assert_eq!(p.tracking_date, *want, "week_start {ws}");
            assert_eq!(p.end - p.start, Duration::days(6));
        }
    }
}
