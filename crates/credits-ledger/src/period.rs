// Calendar helpers for monthly periods and upgrade proration (UTC dates)
use chrono::{Datelike, NaiveDate};

pub fn first_day_of_next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}

pub fn days_in_month(date: NaiveDate) -> u32 {
    let first = date.with_day(1).unwrap_or(date);
    (first_day_of_next_month(date) - first).num_days() as u32
}

/// Days left in the month, counting `date` itself.
pub fn remaining_days_in_month(date: NaiveDate) -> u32 {
    days_in_month(date) - date.day() + 1
}

/// Share of a full monthly allowance granted when upgrading on `date`,
/// rounded half away from zero.
pub fn prorated_credits(full_allowance: u32, date: NaiveDate) -> u32 {
    let total = days_in_month(date) as u64;
    let remaining = remaining_days_in_month(date) as u64;
    let numerator = full_allowance as u64 * remaining;
    ((numerator * 2 + total) / (total * 2)) as u32
}

pub(crate) fn same_month(a: NaiveDate, b: NaiveDate) -> bool {
    a.year() == b.year() && a.month() == b.month()
}
