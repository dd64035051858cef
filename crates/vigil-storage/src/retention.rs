//! Time-to-live pruning of alarm history.
//!
//! History older than `now - ttl` is eligible. Each call deletes at most
//! `max_count` records, oldest first, with ties on `timestamp` broken by
//! ascending `event_id`, so repeated calls drain the backlog in a stable
//! order without holding a lock over the whole table.

use chrono::{DateTime, TimeDelta, Utc};
use vigil_common::types::AlarmChange;

/// Earliest timestamp that survives a prune with the given TTL.
pub fn cutoff(now: DateTime<Utc>, ttl_secs: u64) -> DateTime<Utc> {
    i64::try_from(ttl_secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|ttl| now.checked_sub_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Identities of the records one prune call deletes, in deletion order.
///
/// `max_count` of `None` means no cap.
pub fn select_expired<'a>(
    history: impl IntoIterator<Item = &'a AlarmChange>,
    cutoff: DateTime<Utc>,
    max_count: Option<u64>,
) -> Vec<String> {
    let mut expired: Vec<&AlarmChange> = history.into_iter().filter(|c| c.timestamp < cutoff).collect();
    expired.sort_by(|a, b| (a.timestamp, &a.event_id).cmp(&(b.timestamp, &b.event_id)));
    let cap = max_count.map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX));
    expired.into_iter().take(cap).map(|c| c.event_id.clone()).collect()
}

/// `LIMIT` operand for SQL backends; SQLite treats a negative limit as none.
pub fn sql_limit(max_count: Option<u64>) -> i64 {
    max_count.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX))
}
