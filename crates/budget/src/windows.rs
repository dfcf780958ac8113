use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Timelike, Utc};

use sitekb_common::BudgetWindow;

/// Start of the window containing `now`. `BudgetWindow::None` (the storage
/// gauge) never rolls over and reports `now` itself.
pub fn window_start(now: DateTime<Utc>, window: BudgetWindow) -> DateTime<Utc> {
    match window {
        BudgetWindow::Hour => Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), 0, 0)
            .single()
            .unwrap_or(now),
        BudgetWindow::Day => Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
            .single()
            .unwrap_or(now),
        BudgetWindow::Month => NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .unwrap_or(now),
        BudgetWindow::None => now,
    }
}

/// First instant of the window after the one starting at `start`.
pub fn next_reset(start: DateTime<Utc>, window: BudgetWindow) -> DateTime<Utc> {
    match window {
        BudgetWindow::Hour => start + Duration::hours(1),
        BudgetWindow::Day => start + Duration::days(1),
        BudgetWindow::Month => start
            .checked_add_months(Months::new(1))
            .unwrap_or(start + Duration::days(31)),
        BudgetWindow::None => start,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn hour_window_truncates_minutes() {
        assert_eq!(
            window_start(at(2025, 6, 15, 14, 37), BudgetWindow::Hour),
            at(2025, 6, 15, 14, 0)
        );
    }

    #[test]
    fn day_window_truncates_time() {
        assert_eq!(
            window_start(at(2025, 6, 15, 14, 37), BudgetWindow::Day),
            at(2025, 6, 15, 0, 0)
        );
    }

    #[test]
    fn month_window_truncates_to_first() {
        assert_eq!(
            window_start(at(2025, 6, 15, 14, 37), BudgetWindow::Month),
            at(2025, 6, 1, 0, 0)
        );
    }

    #[test]
    fn next_reset_advances_one_window() {
        assert_eq!(
            next_reset(at(2025, 6, 1, 0, 0), BudgetWindow::Month),
            at(2025, 7, 1, 0, 0)
        );
        assert_eq!(
            next_reset(at(2025, 12, 1, 0, 0), BudgetWindow::Month),
            at(2026, 1, 1, 0, 0)
        );
        assert_eq!(
            next_reset(at(2025, 6, 15, 23, 0), BudgetWindow::Hour),
            at(2025, 6, 16, 0, 0)
        );
    }
}
