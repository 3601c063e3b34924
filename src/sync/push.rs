//! Draining the operation queue to the server.

use colored::Colorize;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::coordinator::{Disposition, LockHolder, RetryPolicy, SyncCoordinator};
use super::executor::OperationExecutor;
use super::operation::{OperationType, PendingOperation};
use super::queue::{self, OperationStore};
use crate::cache::{store as cache_store, EntityKind, SyncState, SINGLETON_ID};
use crate::error::{OperationError, SyncError};
use crate::network::NetworkMonitor;

/// Why a drain pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStop {
    /// No pending rows remain.
    Drained,
    /// The network went away.
    Offline,
    /// A transient failure; the rest waits for backoff.
    RetryLater,
}

/// Result of pushing one operation.
#[derive(Debug, Clone, Serialize)]
pub struct PushResult {
    pub id: String,
    pub operation_type: OperationType,
    pub target: String,
    pub error: Option<String>,
    pub surfaced: bool,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Serialize)]
pub struct PushReport {
    pub succeeded: usize,
    /// Rows now FAILED and waiting on the user.
    pub failed: usize,
    /// Rows left pending after a transient failure.
    pub deferred: usize,
    pub batches: usize,
    pub stop: PushStop,
    pub results: Vec<PushResult>,
}

impl PushReport {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            succeeded: 0,
            failed: 0,
            deferred: 0,
            batches: 0,
            stop: PushStop::Drained,
            results: Vec::new(),
        }
    }

    fn add(&mut self, op: &PendingOperation, outcome: Option<(&OperationError, Disposition)>) {
        let (error, surfaced) = match outcome {
            None => {
                self.succeeded += 1;
                (None, false)
            }
            Some((err, Disposition::RetryLater)) => {
                self.deferred += 1;
                (Some(err.to_string()), false)
            }
            Some((err, Disposition::Surface)) => {
                self.failed += 1;
                (Some(err.to_string()), true)
            }
        };
        self.results.push(PushResult {
            id: op.id.clone(),
            operation_type: op.operation_type,
            target: op.target(),
            error,
            surfaced,
        });
    }

    #[must_use]
    pub const fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.deferred == 0
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.succeeded + self.failed + self.deferred
    }
}

/// Sequential drain of the queue under the sync lock.
#[derive(Debug, Clone)]
pub struct PushOrchestrator {
    store: OperationStore,
    executor: OperationExecutor,
    coordinator: SyncCoordinator,
    network: NetworkMonitor,
    policy: RetryPolicy,
    batch_limit: usize,
}

impl PushOrchestrator {
    #[must_use]
    pub const fn new(
        store: OperationStore,
        executor: OperationExecutor,
        coordinator: SyncCoordinator,
        network: NetworkMonitor,
        policy: RetryPolicy,
        batch_limit: usize,
    ) -> Self {
        Self {
            store,
            executor,
            coordinator,
            network,
            policy,
            batch_limit,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Push pending rows until the queue is empty, the network drops, or a
    /// transient failure asks for backoff.
    ///
    /// # Errors
    ///
    /// Returns an error only for local storage failures. Server failures are
    /// recorded on the rows and reported.
    #[tracing::instrument(skip(self))]
    pub async fn flush(&self) -> Result<PushReport, SyncError> {
        let _guard = self.coordinator.acquire(LockHolder::Push).await;
        let report = self.drain().await?;

        if report.total() > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                deferred = report.deferred,
                batches = report.batches,
                stop = ?report.stop,
                "Push finished"
            );
        }
        Ok(report)
    }

    async fn drain(&self) -> Result<PushReport, SyncError> {
        let mut report = PushReport::empty();

        loop {
            if !self.network.is_online() {
                debug!("Offline, leaving queue for later");
                report.stop = PushStop::Offline;
                break;
            }

            let batch = self.store.claim_next_batch(self.batch_limit)?;
            if batch.is_empty() {
                report.stop = PushStop::Drained;
                break;
            }

            report.batches += 1;
            debug!(size = batch.len(), head = %batch[0].target(), "Pushing batch");

            let mut results = self.executor.execute(batch.clone()).await;

            let mut completed = Vec::new();
            let mut retry_later = false;
            for op in &batch {
                let outcome = results.remove(&op.id).unwrap_or_else(|| {
                    Err(OperationError::Server("no result for operation".to_string()))
                });

                match outcome {
                    Ok(()) => {
                        report.add(op, None);
                        completed.push(op);
                    }
                    Err(err) => {
                        let disposition = self.policy.disposition(&err, op.attempt_count);
                        let message = err.to_string();
                        match disposition {
                            Disposition::RetryLater => {
                                debug!(id = %op.id, error = %message, "Push deferred");
                                self.store.mark_retryable(&op.id, &message)?;
                                retry_later = true;
                            }
                            Disposition::Surface => {
                                warn!(
                                    id = %op.id,
                                    target = %op.target(),
                                    error = %message,
                                    "Operation failed"
                                );
                                self.store.mark_failed(&op.id, &message)?;
                            }
                        }
                        report.add(op, Some((&err, disposition)));
                    }
                }
            }

            self.complete(&completed)?;

            if retry_later {
                report.stop = PushStop::RetryLater;
                break;
            }
        }

        Ok(report)
    }

    /// Delete acknowledged rows and mark their entities synced once nothing
    /// else is queued for them.
    fn complete(&self, ops: &[&PendingOperation]) -> Result<(), SyncError> {
        if ops.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = ops.iter().map(|op| op.id.clone()).collect();
        self.store.mark_completed(&ids)?;

        self.store.database().transaction(|tx| {
            for op in ops {
                let kind = op
                    .entity_type
                    .unwrap_or_else(|| op.operation_type.entity_kind());
                if kind == EntityKind::ListeningEvent {
                    continue;
                }
                let id = op.entity_id.as_deref().unwrap_or(SINGLETON_ID);
                if !queue::has_operations_for(tx, kind, id)? {
                    cache_store::set_sync_state(tx, kind, id, SyncState::Synced)?;
                }
            }
            Ok(())
        })
    }
}

/// Format a push report for display.
#[must_use]
pub fn format_push_report(report: &PushReport) -> String {
    let mut lines = Vec::new();

    lines.push(format!("Push completed: {} operations", report.total()));
    lines.push("─".repeat(40));

    if report.succeeded > 0 {
        lines.push(format!(
            "  {} {}",
            "✓".green(),
            format!("{} succeeded", report.succeeded).green()
        ));
    }
    if report.deferred > 0 {
        lines.push(format!(
            "  {} {}",
            "○".yellow(),
            format!("{} will retry", report.deferred).yellow()
        ));
    }
    if report.failed > 0 {
        lines.push(format!(
            "  {} {}",
            "✗".red(),
            format!("{} failed", report.failed).red()
        ));
    }

    match report.stop {
        PushStop::Drained => {}
        PushStop::Offline => lines.push("Stopped: offline".dimmed().to_string()),
        PushStop::RetryLater => lines.push("Stopped: waiting to retry".dimmed().to_string()),
    }

    let errors: Vec<_> = report
        .results
        .iter()
        .filter(|r| r.error.is_some())
        .take(3)
        .collect();
    if !errors.is_empty() {
        lines.push(String::new());
        lines.push("Errors:".to_string());
        for result in errors {
            lines.push(format!(
                "  - {} {}: {}",
                result.operation_type,
                result.target,
                result.error.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::api::{ApiCall, ApiError, ListeningEvent, MemoryServer, PositionUpdate, ServerApi};
    use crate::cache::LocalCache;
    use crate::storage::Database;
    use crate::sync::handlers::{FieldPatch, Handlers, RelationshipSet};
    use crate::sync::operation::OperationStatus;

    struct Harness {
        push: PushOrchestrator,
        store: OperationStore,
        cache: LocalCache,
        server: Arc<MemoryServer>,
        handlers: Handlers,
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }

    fn harness_with(db: Database, server: Arc<MemoryServer>, online: bool) -> Harness {
        let api: Arc<dyn ServerApi> = server.clone();
        let handlers = Handlers::new(&api);
        let store = OperationStore::new(db.clone()).unwrap();
        let push = PushOrchestrator::new(
            store.clone(),
            OperationExecutor::new(handlers.registry()),
            SyncCoordinator::new(),
            NetworkMonitor::fixed(online),
            policy(),
            50,
        );
        Harness {
            push,
            store,
            cache: LocalCache::new(db),
            server,
            handlers,
        }
    }

    fn harness() -> Harness {
        harness_with(
            Database::open_in_memory().unwrap(),
            Arc::new(MemoryServer::new()),
            true,
        )
    }

    fn patch(value: serde_json::Value) -> FieldPatch {
        FieldPatch(value.as_object().unwrap().clone())
    }

    fn title_edit(h: &Harness, id: &str, title: &str) {
        h.store
            .queue(
                &h.handlers.update_book,
                Some(EntityKind::Book),
                Some(id),
                &patch(json!({ "title": title })),
            )
            .unwrap();
        h.cache
            .apply_local_edit(
                EntityKind::Book,
                id,
                json!({ "title": title }).as_object().unwrap(),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_successive_edits_reach_server_once() {
        let h = harness();
        h.server
            .put_record(EntityKind::Book, "b1", json!({"title": "A"}), 1);
        title_edit(&h, "b1", "B");
        title_edit(&h, "b1", "C");

        let report = h.push.flush().await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.stop, PushStop::Drained);
        assert_eq!(
            h.server.mutation_calls(),
            vec![ApiCall::UpdateMetadata {
                kind: EntityKind::Book,
                id: "b1".into(),
                fields: json!({"title": "C"}).as_object().unwrap().clone(),
            }]
        );
        assert_eq!(
            h.server.record(EntityKind::Book, "b1").unwrap().data["title"],
            "C"
        );
        assert_eq!(h.store.stats().unwrap().pending, 0);
        let local = h.cache.get(EntityKind::Book, "b1").unwrap().unwrap();
        assert_eq!(local.sync_state, SyncState::Synced);
    }

    #[tokio::test]
    async fn test_preferences_coalesce_into_one_call() {
        let h = harness();
        for theme in ["dark", "light", "sepia"] {
            h.store
                .queue(
                    &h.handlers.update_preferences,
                    Some(EntityKind::Preferences),
                    None,
                    &patch(json!({ "theme": theme })),
                )
                .unwrap();
        }
        h.store
            .queue(
                &h.handlers.update_preferences,
                Some(EntityKind::Preferences),
                None,
                &patch(json!({ "skip_seconds": 30 })),
            )
            .unwrap();

        h.push.flush().await.unwrap();

        assert_eq!(
            h.server.mutation_calls(),
            vec![ApiCall::UpdatePreferences(
                json!({"theme": "sepia", "skip_seconds": 30})
                    .as_object()
                    .unwrap()
                    .clone()
            )]
        );
    }

    #[tokio::test]
    async fn test_listening_events_go_in_one_batch() {
        let h = harness();
        for start in [0, 60_000, 120_000] {
            h.store
                .queue(
                    &h.handlers.record_listening_event,
                    Some(EntityKind::ListeningEvent),
                    Some("b1"),
                    &ListeningEvent {
                        book_id: "b1".into(),
                        started_at: start,
                        ended_at: start + 60_000,
                        start_position_ms: start,
                        end_position_ms: start + 60_000,
                    },
                )
                .unwrap();
        }

        let report = h.push.flush().await.unwrap();

        assert_eq!(report.batches, 1);
        assert_eq!(report.succeeded, 3);
        assert_eq!(h.server.mutation_calls().len(), 1);
        assert_eq!(h.server.listening_events().len(), 3);
    }

    #[tokio::test]
    async fn test_offline_leaves_queue_untouched() {
        let h = harness_with(
            Database::open_in_memory().unwrap(),
            Arc::new(MemoryServer::new()),
            false,
        );
        title_edit(&h, "b1", "B");

        let report = h.push.flush().await.unwrap();

        assert_eq!(report.stop, PushStop::Offline);
        assert_eq!(report.batches, 0);
        assert!(h.server.calls().is_empty());
        assert_eq!(h.store.stats().unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_defers_and_stops_pass() {
        let h = harness();
        h.server.put_record(EntityKind::Book, "b1", json!({}), 1);
        h.server.put_record(EntityKind::Book, "b2", json!({}), 1);
        title_edit(&h, "b1", "B");
        title_edit(&h, "b2", "C");
        h.server.fail_next(ApiError::Server {
            status: 503,
            message: "busy".into(),
        });

        let report = h.push.flush().await.unwrap();

        assert_eq!(report.stop, PushStop::RetryLater);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.succeeded, 0);
        let rows = h.store.list(None, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, OperationStatus::Pending);
        assert_eq!(rows[0].attempt_count, 1);

        let report = h.push.flush().await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(h.store.stats().unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_surfaces_after_max_attempts() {
        let h = harness();
        h.server.put_record(EntityKind::Book, "b1", json!({}), 1);
        title_edit(&h, "b1", "B");

        for _ in 0..3 {
            h.server.fail_next(ApiError::Network("reset".into()));
            h.push.flush().await.unwrap();
        }

        let rows = h.store.list(Some(OperationStatus::Failed), 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].attempt_count, 3);
        assert_eq!(*h.store.subscribe_failed().borrow(), rows);
    }

    #[tokio::test]
    async fn test_rejection_surfaces_and_rest_continue() {
        let h = harness();
        // b1 does not exist on the server
        h.server.put_record(EntityKind::Book, "b2", json!({}), 1);
        title_edit(&h, "b1", "B");
        title_edit(&h, "b2", "C");

        let report = h.push.flush().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.stop, PushStop::Drained);
        assert!(report.results[0].surfaced);
        let failed = h.store.list(Some(OperationStatus::Failed), 10).unwrap();
        assert_eq!(failed[0].entity_id.as_deref(), Some("b1"));
        assert_eq!(
            h.cache.get(EntityKind::Book, "b1").unwrap().unwrap().sync_state,
            SyncState::NotSynced
        );
    }

    #[tokio::test]
    async fn test_recovers_rows_interrupted_mid_flush() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shelfsync.db");
        let server = Arc::new(MemoryServer::new());

        {
            let h = harness_with(Database::open_at(&path).unwrap(), server.clone(), true);
            h.store
                .queue(
                    &h.handlers.update_playback_position,
                    Some(EntityKind::PlaybackPosition),
                    Some("b1"),
                    &PositionUpdate {
                        position_ms: 42_000,
                        last_played_at: 7,
                    },
                )
                .unwrap();
            assert_eq!(h.store.claim_next_batch(10).unwrap().len(), 1);
        }

        let h = harness_with(Database::open_at(&path).unwrap(), server, true);
        assert_eq!(h.store.stats().unwrap().in_progress, 1);
        assert_eq!(h.store.reset_stuck_operations().unwrap(), 1);

        let report = h.push.flush().await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert!(matches!(
            h.server.mutation_calls().as_slice(),
            [ApiCall::UpdatePlaybackPosition { book_id, .. }] if book_id == "b1"
        ));
    }

    #[tokio::test]
    async fn test_entity_stays_unsynced_while_other_rows_remain() {
        let h = harness();
        h.server.put_record(EntityKind::Book, "b1", json!({}), 1);
        h.store
            .queue(
                &h.handlers.set_book_tags,
                Some(EntityKind::Book),
                Some("b1"),
                &RelationshipSet {
                    target_ids: vec!["t1".into()],
                },
            )
            .unwrap();
        title_edit(&h, "b1", "B");

        // the tag change is refused, the title goes through
        h.server.fail_next(ApiError::Rejected("unknown tag".into()));
        let report = h.push.flush().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(
            h.cache.get(EntityKind::Book, "b1").unwrap().unwrap().sync_state,
            SyncState::NotSynced
        );

        let failed = h.store.list(Some(OperationStatus::Failed), 1).unwrap();
        assert_eq!(failed[0].operation_type, OperationType::SetBookTags);
        h.store.retry(&failed[0].id).unwrap();
        let report = h.push.flush().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(
            h.cache.get(EntityKind::Book, "b1").unwrap().unwrap().sync_state,
            SyncState::Synced
        );
    }

    #[test]
    fn test_format_push_report() {
        let mut report = PushReport::empty();
        report.succeeded = 2;
        report.failed = 1;
        report.stop = PushStop::Offline;
        let text = format_push_report(&report);
        assert!(text.contains("Push completed: 3 operations"));
        assert!(text.contains("Stopped: offline"));
    }
}
