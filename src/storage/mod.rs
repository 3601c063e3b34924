//! Storage layer for shelfsync.
//!
//! `SQLite` persistence for the local entity cache, pull cursors, and the
//! pending operation queue.

mod database;
mod migrations;

pub use database::Database;

/// Current time as unix milliseconds, the timestamp unit used in every table.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Convert a stored millisecond timestamp back to a `DateTime`.
#[must_use]
pub fn millis_to_datetime(ms: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::TimeZone::timestamp_millis_opt(&chrono::Utc, ms)
        .single()
        .unwrap_or_default()
}
