//! JSON output formatting for shelfsync.

use serde::Serialize;
use serde_json::json;

use crate::api::ChangeCursor;
use crate::cache::EntityKind;
use crate::error::SyncError;
use crate::sync::realtime::ApplyStats;
use crate::sync::{PendingOperation, QueueStats};

/// Format queue status as JSON
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_status_json(
    stats: &QueueStats,
    unsynced: &[(EntityKind, usize)],
) -> Result<String, SyncError> {
    let unsynced: serde_json::Map<String, serde_json::Value> = unsynced
        .iter()
        .map(|(kind, count)| (kind.to_string(), json!(count)))
        .collect();
    let output = json!({
        "pending": stats.pending,
        "in_progress": stats.in_progress,
        "failed": stats.failed,
        "oldest_pending": stats.oldest_pending.map(|t| t.to_rfc3339()),
        "unsynced": unsynced,
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Format queued operations as JSON
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_operations_json(operations: &[PendingOperation]) -> Result<String, SyncError> {
    let output = json!({
        "count": operations.len(),
        "items": operations
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Format pull cursors as JSON
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_cursors_json(cursors: &[(EntityKind, ChangeCursor)]) -> Result<String, SyncError> {
    let items: Vec<_> = cursors
        .iter()
        .map(|(kind, cursor)| {
            json!({
                "kind": kind,
                "updated_after": cursor.updated_at,
                "after_id": cursor.id,
            })
        })
        .collect();
    let output = json!({
        "count": items.len(),
        "items": items
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Format replay results as JSON
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_replay_json(stats: &ApplyStats, errors: &[String]) -> Result<String, SyncError> {
    let output = json!({
        "applied": stats.applied,
        "ignored": stats.ignored,
        "failed": stats.failed,
        "errors": errors,
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Serialize any value as pretty JSON
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn to_json<T: Serialize>(value: &T) -> Result<String, SyncError> {
    Ok(serde_json::to_string_pretty(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::sync::{OperationStatus, OperationType};

    fn sample_operation() -> PendingOperation {
        let now = Utc::now();
        PendingOperation {
            id: "op-1".into(),
            operation_type: OperationType::UpdateBook,
            entity_type: Some(EntityKind::Book),
            entity_id: Some("b1".into()),
            payload: r#"{"fields":{"title":"Dune"}}"#.into(),
            batch_key: None,
            status: OperationStatus::Failed,
            created_at: now,
            updated_at: now,
            attempt_count: 2,
            last_error: Some("rejected".into()),
        }
    }

    #[test]
    fn test_format_operations_json() {
        let json = format_operations_json(&[sample_operation()]).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["count"], 1);
        assert_eq!(parsed["items"][0]["id"], "op-1");
        assert_eq!(parsed["items"][0]["operation_type"], "update_book");
        assert_eq!(parsed["items"][0]["status"], "failed");
    }

    #[test]
    fn test_format_status_json() {
        let stats = QueueStats {
            pending: 3,
            failed: 1,
            ..QueueStats::default()
        };
        let json = format_status_json(&stats, &[(EntityKind::Book, 2)]).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["pending"], 3);
        assert_eq!(parsed["failed"], 1);
        assert_eq!(parsed["oldest_pending"], serde_json::Value::Null);
        assert_eq!(parsed["unsynced"]["book"], 2);
    }

    #[test]
    fn test_format_cursors_json() {
        let json = format_cursors_json(&[(EntityKind::Series, ChangeCursor::new(42, "s7"))]).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["items"][0]["kind"], "series");
        assert_eq!(parsed["items"][0]["updated_after"], 42);
        assert_eq!(parsed["items"][0]["after_id"], "s7");
    }
}
