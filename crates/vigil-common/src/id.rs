//! Snowflake identities for alarms and history events.
//!
//! Ids are 64-bit Snowflake values rendered in decimal, so they sort by
//! creation time within one worker.

use snowflake::SnowflakeIdBucket;
use std::sync::{Mutex, MutexGuard};

const DEFAULT_WORKER: (i32, i32) = (1, 1);

static BUCKET: Mutex<Option<SnowflakeIdBucket>> = Mutex::new(None);

fn bucket() -> MutexGuard<'static, Option<SnowflakeIdBucket>> {
    BUCKET.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pins the worker identity. Both parts must be in `0..32`; without a call
/// the worker defaults to `(1, 1)`.
pub fn init(machine_id: i32, node_id: i32) {
    *bucket() = Some(SnowflakeIdBucket::new(machine_id, node_id));
}

/// Returns a fresh id.
pub fn next_id() -> String {
    let mut guard = bucket();
    let ids = guard.get_or_insert_with(|| SnowflakeIdBucket::new(DEFAULT_WORKER.0, DEFAULT_WORKER.1));
    ids.get_id().to_string()
}
