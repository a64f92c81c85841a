//! Daily epoch boundaries.
//!
//! An epoch ends at midnight of a fixed reference timezone, not the user's
//! local time and not 24h after their last message.

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Utc};

/// Start of the calendar day after `now`, in the reference `offset`.
pub fn next_epoch_boundary(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local_date = now.with_timezone(&offset).date_naive();
    local_date
        .succ_opt()
        .map(|next| next.and_time(NaiveTime::MIN))
        .and_then(|midnight| offset.from_local_datetime(&midnight).single())
        .map(|dt| dt.with_timezone(&Utc))
        // Only reachable at the end of chrono's calendar.
        .unwrap_or_else(|| now + Duration::days(1))
}

/// Whether the epoch that ends at `reset_at` is over.
pub fn reset_due(now: DateTime<Utc>, reset_at: DateTime<Utc>) -> bool {
    now >= reset_at
}
