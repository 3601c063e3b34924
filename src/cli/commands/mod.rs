//! Command implementations for shelfsync.
//!
//! Every command works directly on the local database; none of them talk to
//! the server.

mod replay;

pub use replay::replay;

use clap::CommandFactory;
use colored::Colorize;
use serde_json::json;

use crate::cache::store as cache_store;
use crate::cli::args::{Cli, OutputFormat, StatusFilter};
use crate::error::SyncError;
use crate::output::{format_cursors, format_operations, format_status, to_json};
use crate::storage::Database;
use crate::sync::pull::{self, PULLED_KINDS};
use crate::sync::OperationStore;

/// Execute status command
///
/// # Errors
///
/// Returns an error if the database query or output formatting fails.
pub fn status(db: &Database, format: OutputFormat) -> Result<String, SyncError> {
    let store = OperationStore::new(db.clone())?;
    let stats = store.stats()?;

    let unsynced = {
        let conn = db.connection();
        PULLED_KINDS
            .into_iter()
            .map(|kind| Ok((kind, cache_store::unsynced_ids(&conn, kind)?.len())))
            .collect::<Result<Vec<_>, SyncError>>()?
    };

    format_status(&stats, &unsynced, format)
}

/// Execute list command
///
/// # Errors
///
/// Returns an error if the database query or output formatting fails.
pub fn list(
    db: &Database,
    status: Option<StatusFilter>,
    limit: usize,
    format: OutputFormat,
) -> Result<String, SyncError> {
    let store = OperationStore::new(db.clone())?;
    let operations = store.list(status.map(Into::into), limit)?;
    format_operations(&operations, format)
}

/// Execute retry command
///
/// # Errors
///
/// Returns `NotFound` for an unknown id, `InvalidState` for a row that has
/// not failed, or an error if the update fails.
pub fn retry(
    db: &Database,
    id: Option<&str>,
    all_failed: bool,
    format: OutputFormat,
) -> Result<String, SyncError> {
    let store = OperationStore::new(db.clone())?;

    let retried = match id {
        Some(id) if !all_failed => {
            store.retry(id)?;
            1
        }
        _ => store.retry_all_failed()?,
    };

    match format {
        OutputFormat::Json => to_json(&json!({ "retried": retried })),
        OutputFormat::Pretty => Ok(if retried == 0 {
            "No failed operations to retry.".to_string()
        } else {
            format!(
                "{} {} operation(s) queued for retry",
                "✓".green(),
                retried
            )
        }),
    }
}

/// Execute dismiss command
///
/// # Errors
///
/// Returns `NotFound` for an unknown id, `InvalidState` for a row being
/// pushed, or an error if the delete fails.
pub fn dismiss(db: &Database, id: &str, format: OutputFormat) -> Result<String, SyncError> {
    let store = OperationStore::new(db.clone())?;
    let dismissed = store.dismiss(id)?;

    match format {
        OutputFormat::Json => to_json(&json!({
            "dismissed": dismissed.id,
            "operation_type": dismissed.operation_type,
            "target": dismissed.target(),
        })),
        OutputFormat::Pretty => Ok(format!(
            "{} Dismissed {} on {}\n{}",
            "✓".green(),
            dismissed.operation_type.to_string().bold(),
            dismissed.target(),
            "The server copy will be restored on the next pull".dimmed()
        )),
    }
}

/// Execute recover command
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn recover(db: &Database, format: OutputFormat) -> Result<String, SyncError> {
    let store = OperationStore::new(db.clone())?;
    let recovered = store.reset_stuck_operations()?;

    match format {
        OutputFormat::Json => to_json(&json!({ "recovered": recovered })),
        OutputFormat::Pretty => Ok(if recovered == 0 {
            "No stuck operations.".to_string()
        } else {
            format!(
                "{} {} operation(s) returned to the queue",
                "✓".green(),
                recovered
            )
        }),
    }
}

/// Execute cursors command
///
/// # Errors
///
/// Returns an error if the query, delete, or output formatting fails.
pub fn cursors(db: &Database, reset: bool, format: OutputFormat) -> Result<String, SyncError> {
    if reset {
        let removed = pull::reset_cursors(&db.connection())?;
        return match format {
            OutputFormat::Json => to_json(&json!({ "reset": removed })),
            OutputFormat::Pretty => Ok(format!("{} Reset {} cursor(s)", "✓".green(), removed)),
        };
    }

    let cursors = pull::list_cursors(&db.connection())?;
    format_cursors(&cursors, format)
}

/// Generate a shell completion script.
///
/// # Errors
///
/// Returns an error if the generated script is not valid UTF-8.
pub fn completions(shell: clap_complete::Shell) -> Result<String, SyncError> {
    let mut cmd = Cli::command();
    let mut buf = Vec::new();
    clap_complete::generate(shell, &mut cmd, "shelfsync", &mut buf);
    String::from_utf8(buf).map_err(|e| SyncError::Payload(format!("UTF-8 error: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::api::{ChangeCursor, MemoryServer, ServerApi};
    use crate::cache::{EntityKind, LocalCache};
    use crate::sync::handlers::{FieldPatch, Handlers};
    use crate::sync::{OperationStatus, PendingOperation};

    fn queue_title(db: &Database, book_id: &str) -> String {
        let api: Arc<dyn ServerApi> = Arc::new(MemoryServer::new());
        let handlers = Handlers::new(&api);
        let store = OperationStore::new(db.clone()).unwrap();
        let mut fields = serde_json::Map::new();
        fields.insert("title".into(), json!("Dune"));
        LocalCache::new(db.clone())
            .apply_local_edit(EntityKind::Book, book_id, &fields)
            .unwrap();
        store
            .queue(
                &handlers.update_book,
                Some(EntityKind::Book),
                Some(book_id),
                &FieldPatch(fields),
            )
            .unwrap()
            .id()
            .to_string()
    }

    fn only_op(db: &Database) -> PendingOperation {
        let store = OperationStore::new(db.clone()).unwrap();
        store.list(None, 10).unwrap().remove(0)
    }

    #[test]
    fn test_status_counts_unsynced() {
        let db = Database::open_in_memory().unwrap();
        queue_title(&db, "b1");

        let output = status(&db, OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["pending"], 1);
        assert_eq!(parsed["unsynced"]["book"], 1);
    }

    #[test]
    fn test_retry_all_failed() {
        let db = Database::open_in_memory().unwrap();
        let id = queue_title(&db, "b1");
        let store = OperationStore::new(db.clone()).unwrap();
        store.mark_failed(&id, "rejected").unwrap();

        let output = retry(&db, None, true, OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["retried"], 1);
        assert_eq!(only_op(&db).status, OperationStatus::Pending);
        assert_eq!(only_op(&db).attempt_count, 0);
    }

    #[test]
    fn test_retry_unknown_id() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            retry(&db, Some("nope"), false, OutputFormat::Pretty),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn test_retry_pending_row_is_refused() {
        let db = Database::open_in_memory().unwrap();
        let id = queue_title(&db, "b1");

        assert!(matches!(
            retry(&db, Some(&id), false, OutputFormat::Pretty),
            Err(SyncError::InvalidState(_))
        ));
        assert_eq!(only_op(&db).status, OperationStatus::Pending);
    }

    #[test]
    fn test_dismiss_removes_row() {
        let db = Database::open_in_memory().unwrap();
        let id = queue_title(&db, "b1");

        let output = dismiss(&db, &id, OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["dismissed"], id.as_str());
        assert_eq!(parsed["target"], "book b1");

        let store = OperationStore::new(db).unwrap();
        assert!(store.list(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_recover_resets_in_progress() {
        let db = Database::open_in_memory().unwrap();
        let id = queue_title(&db, "b1");
        let claimed = OperationStore::new(db.clone())
            .unwrap()
            .claim_next_batch(10)
            .unwrap();
        assert_eq!(claimed[0].id, id);

        let output = recover(&db, OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["recovered"], 1);
        assert_eq!(only_op(&db).status, OperationStatus::Pending);
    }

    #[test]
    fn test_cursors_reset() {
        let db = Database::open_in_memory().unwrap();
        pull::set_cursor(&db.connection(), EntityKind::Book, &ChangeCursor::new(100, "b1")).unwrap();
        pull::set_cursor(&db.connection(), EntityKind::Tag, &ChangeCursor::new(200, "t1")).unwrap();

        let listed = cursors(&db, false, OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&listed).unwrap();
        assert_eq!(parsed["count"], 2);

        let reset = cursors(&db, true, OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&reset).unwrap();
        assert_eq!(parsed["reset"], 2);
        assert!(pull::list_cursors(&db.connection()).unwrap().is_empty());
    }

    #[test]
    fn test_completions_mention_binary() {
        let script = completions(clap_complete::Shell::Bash).unwrap();
        assert!(script.contains("shelfsync"));
    }
}
