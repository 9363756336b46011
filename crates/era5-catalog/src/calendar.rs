//! Calendar helpers for building date ranges in requests and filenames.

use chrono::NaiveDate;

/// Number of days in a month, leap-year aware.
pub fn days_in_month(year: i32, month: u32) -> u32 {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .unwrap_or_else(|| panic!("invalid year/month: {year}-{month}"));
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap()
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap()
    };
    next.signed_duration_since(first).num_days() as u32
}

/// Zero-padded day strings "01".."<last day of month>".
pub fn day_list(year: i32, month: u32) -> Vec<String> {
    (1..=days_in_month(year, month))
        .map(|d| format!("{d:02}"))
        .collect()
}

/// Zero-padded day strings "01".."31", for requests spanning every month.
pub fn all_days() -> Vec<String> {
    (1..=31).map(|d| format!("{d:02}")).collect()
}

/// Zero-padded month strings "01".."12".
pub fn month_list() -> Vec<String> {
    (1..=12).map(|m| format!("{m:02}")).collect()
}

/// The fixed 24-slot hourly time list "00:00".."23:00".
pub fn hour_list() -> Vec<String> {
    (0..24).map(|h| format!("{h:02}:00")).collect()
}
