//! Output formatting for shelfsync.
//!
//! Each formatter dispatches on [`OutputFormat`]: colored text for people,
//! pretty-printed JSON for scripts.

mod json;
mod pretty;

use crate::api::ChangeCursor;
use crate::cache::EntityKind;
use crate::cli::args::OutputFormat;
use crate::error::SyncError;
use crate::sync::realtime::ApplyStats;
use crate::sync::{PendingOperation, QueueStats};

pub use json::*;
pub use pretty::*;

/// Format queue status and per-kind unsynced counts.
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_status(
    stats: &QueueStats,
    unsynced: &[(EntityKind, usize)],
    format: OutputFormat,
) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_status_pretty(stats, unsynced)),
        OutputFormat::Json => format_status_json(stats, unsynced),
    }
}

/// Format a list of queued operations.
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_operations(
    operations: &[PendingOperation],
    format: OutputFormat,
) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_operations_pretty(operations)),
        OutputFormat::Json => format_operations_json(operations),
    }
}

/// Format pull cursors.
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_cursors(cursors: &[(EntityKind, ChangeCursor)], format: OutputFormat) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_cursors_pretty(cursors)),
        OutputFormat::Json => format_cursors_json(cursors),
    }
}

/// Format the result of replaying an event file.
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_replay(stats: &ApplyStats, errors: &[String], format: OutputFormat) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_replay_pretty(stats, errors)),
        OutputFormat::Json => format_replay_json(stats, errors),
    }
}
