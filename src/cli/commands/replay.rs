//! Replay recorded realtime events against the local cache.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::cli::args::OutputFormat;
use crate::error::SyncError;
use crate::output::format_replay;
use crate::storage::Database;
use crate::sync::realtime::ApplyStats;
use crate::sync::{FrameOutcome, NoMediaUsage, OperationStore, RealtimeApplier, SyncCoordinator, TransportFrame};

/// Apply every line of `file` as a realtime event.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the runtime cannot start.
/// Individual bad lines are reported, not returned.
pub fn replay(db: &Database, file: &Path, format: OutputFormat) -> Result<String, SyncError> {
    let contents = std::fs::read_to_string(file)?;
    let store = OperationStore::new(db.clone())?;
    let (notices, _) = broadcast::channel(16);
    let applier = RealtimeApplier::new(
        store,
        SyncCoordinator::new(),
        Arc::new(NoMediaUsage),
        notices,
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (stats, errors) = runtime.block_on(replay_lines(&applier, &contents));

    info!(
        file = %file.display(),
        applied = stats.applied,
        failed = stats.failed,
        "Replayed realtime events"
    );
    format_replay(&stats, &errors, format)
}

async fn replay_lines(applier: &RealtimeApplier, contents: &str) -> (ApplyStats, Vec<String>) {
    let mut stats = ApplyStats::default();
    let mut errors = Vec::new();

    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let outcome = applier.apply_frame(TransportFrame::Event(line.to_string())).await;
        if let FrameOutcome::Failed(reason) = &outcome {
            errors.push(format!("line {}: {reason}", index + 1));
        }
        stats.count(&outcome);
    }

    (stats, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{EntityKind, LocalCache};
    use tempfile::TempDir;

    #[test]
    fn test_replay_skips_bad_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("events.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"type":"book_created","book":{"id":"b1","updated_at":100,"data":{"title":"Dune"}}}"#,
                "\n\n",
                "not json\n",
                r#"{"type":"tag_created","tag":{"id":"t1","updated_at":100,"data":{"name":"scifi"}}}"#,
                "\n",
            ),
        )
        .unwrap();

        let db = Database::open_in_memory().unwrap();
        let output = replay(&db, &path, OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();

        assert_eq!(parsed["applied"], 2);
        assert_eq!(parsed["failed"], 1);
        assert!(parsed["errors"][0].as_str().unwrap().starts_with("line 3:"));

        let cache = LocalCache::new(db);
        assert!(cache.get(EntityKind::Book, "b1").unwrap().is_some());
        assert!(cache.get(EntityKind::Tag, "t1").unwrap().is_some());
    }

    #[test]
    fn test_replay_missing_file() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            replay(&db, Path::new("/nonexistent/events.jsonl"), OutputFormat::Pretty),
            Err(SyncError::Io(_))
        ));
    }
}
