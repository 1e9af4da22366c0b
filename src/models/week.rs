//! Week partition key math.
//!
//! Every schedule entry belongs to exactly one week, identified by the
//! Monday-anchored ISO week that contains its date. The week id is the
//! Monday's date formatted `YYYY-MM-DD`.

use chrono::{Datelike, Duration, NaiveDate, Utc};

/// Compute the week id for a date: the Monday of that date's ISO week.
pub fn week_id_of(date: NaiveDate) -> String {
    let monday = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
    monday.format("%Y-%m-%d").to_string()
}

/// Week id for today (UTC).
pub fn current_week_id() -> String {
    week_id_of(Utc::now().date_naive())
}

/// Zero-based weekday index within the week (Monday = 0, Sunday = 6).
/// Used for ordering entries within a week.
pub fn weekday_index(date: NaiveDate) -> u32 {
    date.weekday().num_days_from_monday()
}
