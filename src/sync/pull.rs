//! Incremental download of server state.
//!
//! One fetcher per entity kind runs concurrently, each paging through
//! `fetch_changes` from its stored cursor. A page's records, tombstones and
//! the cursor advance commit in one transaction, so a failed fetch or commit
//! leaves the cursor where it was. Playback sessions skip delta semantics
//! and are replaced in full every cycle.

use std::sync::Arc;

use colored::Colorize;
use futures::future::join_all;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::conflict::{self, ApplyOutcome};
use super::coordinator::{LockHolder, SyncCoordinator};
use super::queue;
use crate::api::{ChangeCursor, RemoteRecord, ServerApi};
use crate::cache::{store as cache_store, EntityKind, LinkKind, LocalEntity};
use crate::error::SyncError;
use crate::network::NetworkMonitor;
use crate::storage::Database;

/// Kinds fetched by delta on every pull cycle.
pub const PULLED_KINDS: [EntityKind; 9] = [
    EntityKind::Book,
    EntityKind::Series,
    EntityKind::Contributor,
    EntityKind::Tag,
    EntityKind::Collection,
    EntityKind::Shelf,
    EntityKind::Preferences,
    EntityKind::Profile,
    EntityKind::PlaybackPosition,
];

/// Record field listing the targets of a relationship.
const fn link_field(link: LinkKind) -> &'static str {
    match link {
        LinkKind::BookContributor => "contributor_ids",
        LinkKind::BookSeries => "series_ids",
        LinkKind::BookTag => "tag_ids",
        LinkKind::CollectionBook | LinkKind::ShelfBook => "book_ids",
    }
}

/// Stored cursor for `kind`, if it has ever been pulled.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_cursor(conn: &Connection, kind: EntityKind) -> Result<Option<ChangeCursor>, SyncError> {
    conn.query_row(
        "SELECT updated_after, after_id FROM sync_cursors WHERE entity_kind = ?1",
        [kind.as_str()],
        |row| {
            Ok(ChangeCursor {
                updated_at: row.get(0)?,
                id: row.get(1)?,
            })
        },
    )
    .optional()
    .map_err(|e| SyncError::Database(format!("Failed to load cursor: {e}")))
}

/// # Errors
///
/// Returns an error if the write fails.
pub fn set_cursor(conn: &Connection, kind: EntityKind, cursor: &ChangeCursor) -> Result<(), SyncError> {
    conn.execute(
        r"INSERT INTO sync_cursors (entity_kind, updated_after, after_id) VALUES (?1, ?2, ?3)
          ON CONFLICT(entity_kind) DO UPDATE
          SET updated_after = excluded.updated_after, after_id = excluded.after_id",
        params![kind.as_str(), cursor.updated_at, cursor.id],
    )
    .map_err(|e| SyncError::Database(format!("Failed to store cursor: {e}")))?;
    Ok(())
}

/// Every stored cursor, by kind.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_cursors(conn: &Connection) -> Result<Vec<(EntityKind, ChangeCursor)>, SyncError> {
    let mut stmt = conn
        .prepare(
            "SELECT entity_kind, updated_after, after_id FROM sync_cursors ORDER BY entity_kind",
        )
        .map_err(|e| SyncError::Database(format!("Failed to prepare query: {e}")))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                ChangeCursor {
                    updated_at: row.get(1)?,
                    id: row.get(2)?,
                },
            ))
        })
        .map_err(|e| SyncError::Database(format!("Failed to list cursors: {e}")))?;

    let mut cursors = Vec::new();
    for row in rows {
        let (kind, cursor) = row.map_err(|e| SyncError::Database(e.to_string()))?;
        cursors.push((kind.parse()?, cursor));
    }
    Ok(cursors)
}

/// Forget cursors so the next pull starts from scratch. Returns how many
/// were removed.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn reset_cursors(conn: &Connection) -> Result<usize, SyncError> {
    conn.execute("DELETE FROM sync_cursors", [])
        .map_err(|e| SyncError::Database(format!("Failed to reset cursors: {e}")))
}

/// Where a pull cycle is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPhase {
    #[default]
    Idle,
    Fetching,
    Sessions,
    Done,
}

/// Snapshot published on the progress stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullProgress {
    pub phase: PullPhase,
    /// Kinds finished so far.
    pub current: usize,
    pub total: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// What pulling one kind did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindReport {
    pub kind: EntityKind,
    pub pages: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub kept_local: usize,
    pub repaired: usize,
    pub error: Option<String>,
}

impl KindReport {
    const fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            pages: 0,
            added: 0,
            updated: 0,
            removed: 0,
            kept_local: 0,
            repaired: 0,
            error: None,
        }
    }

    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Added => self.added += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::KeptLocal => self.kept_local += 1,
        }
    }
}

/// Summary of one pull cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PullReport {
    pub kinds: Vec<KindReport>,
    /// Live sessions after the replace-all, `None` if that step failed.
    pub sessions: Option<usize>,
    pub offline: bool,
}

impl PullReport {
    #[must_use]
    pub fn added(&self) -> usize {
        self.kinds.iter().map(|k| k.added).sum()
    }

    #[must_use]
    pub fn updated(&self) -> usize {
        self.kinds.iter().map(|k| k.updated).sum()
    }

    #[must_use]
    pub fn removed(&self) -> usize {
        self.kinds.iter().map(|k| k.removed).sum()
    }

    /// Kinds whose fetch failed, with the error.
    #[must_use]
    pub fn errors(&self) -> Vec<(EntityKind, &str)> {
        self.kinds
            .iter()
            .filter_map(|k| k.error.as_deref().map(|e| (k.kind, e)))
            .collect()
    }
}

/// Runs pull cycles under the sync lock.
#[derive(Clone)]
pub struct PullOrchestrator {
    db: Database,
    api: Arc<dyn ServerApi>,
    coordinator: SyncCoordinator,
    network: NetworkMonitor,
    page_size: usize,
    progress: Arc<watch::Sender<PullProgress>>,
}

impl std::fmt::Debug for PullOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullOrchestrator")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl PullOrchestrator {
    #[must_use]
    pub fn new(
        db: Database,
        api: Arc<dyn ServerApi>,
        coordinator: SyncCoordinator,
        network: NetworkMonitor,
        page_size: usize,
    ) -> Self {
        Self {
            db,
            api,
            coordinator,
            network,
            page_size: page_size.max(1),
            progress: Arc::new(watch::channel(PullProgress::default()).0),
        }
    }

    #[must_use]
    pub fn subscribe_progress(&self) -> watch::Receiver<PullProgress> {
        self.progress.subscribe()
    }

    /// Run one full pull cycle. Failures are per kind: they are logged and
    /// recorded in the report, and never stop the other kinds.
    #[tracing::instrument(skip(self))]
    pub async fn pull(&self) -> PullReport {
        if !self.network.is_online() {
            debug!("Offline, skipping pull");
            return PullReport {
                offline: true,
                ..PullReport::default()
            };
        }

        let _guard = self.coordinator.acquire(LockHolder::Pull).await;

        self.progress.send_replace(PullProgress {
            phase: PullPhase::Fetching,
            total: PULLED_KINDS.len(),
            ..PullProgress::default()
        });

        let kinds = join_all(PULLED_KINDS.into_iter().map(|kind| self.pull_kind(kind))).await;

        self.progress.send_modify(|p| p.phase = PullPhase::Sessions);
        let sessions = match self.replace_sessions().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "Failed to refresh playback sessions");
                None
            }
        };

        let report = PullReport {
            kinds,
            sessions,
            offline: false,
        };
        self.progress.send_modify(|p| p.phase = PullPhase::Done);

        info!(
            added = report.added(),
            updated = report.updated(),
            removed = report.removed(),
            failed_kinds = report.errors().len(),
            "Pull finished"
        );
        report
    }

    #[tracing::instrument(skip(self))]
    async fn pull_kind(&self, kind: EntityKind) -> KindReport {
        let mut report = KindReport::new(kind);

        if let Err(e) = self.fetch_pages(kind, &mut report).await {
            warn!(%kind, error = %e, "Pull failed; cursor left in place");
            report.error = Some(e.to_string());
        } else if let Err(e) = self.repair_dismissed(kind, &mut report).await {
            warn!(%kind, error = %e, "Repair of discarded edits failed");
            report.error = Some(e.to_string());
        }

        let (added, updated, removed) = (report.added, report.updated, report.removed);
        self.progress.send_modify(|p| {
            p.current += 1;
            p.added += added;
            p.updated += updated;
            p.removed += removed;
        });
        report
    }

    async fn fetch_pages(&self, kind: EntityKind, report: &mut KindReport) -> Result<(), SyncError> {
        loop {
            let cursor = get_cursor(&self.db.connection(), kind)?;
            let page = self
                .api
                .fetch_changes(kind, cursor.as_ref(), self.page_size)
                .await?;
            report.pages += 1;

            let high_water_mark = page.high_water_mark();
            self.db.transaction(|tx| {
                for record in &page.records {
                    let outcome = conflict::reconcile_record(tx, kind, record)?;
                    if outcome != ApplyOutcome::KeptLocal {
                        apply_links(tx, kind, record)?;
                    }
                    report.record(outcome);
                }
                for tombstone in &page.deleted {
                    if conflict::apply_remote_delete(tx, kind, &tombstone.id)? {
                        report.removed += 1;
                    }
                }
                if let Some(mark) = &high_water_mark {
                    set_cursor(tx, kind, mark)?;
                }
                Ok(())
            })?;

            debug!(
                %kind,
                records = page.records.len(),
                deleted = page.deleted.len(),
                cursor = ?high_water_mark,
                "Committed pull page"
            );

            if !page.has_more || high_water_mark.is_none() {
                return Ok(());
            }
        }
    }

    /// Restore entities whose local change was dismissed. Delta cursors have
    /// already moved past them, so they are fetched one by one.
    async fn repair_dismissed(&self, kind: EntityKind, report: &mut KindReport) -> Result<(), SyncError> {
        let candidates = {
            let conn = self.db.connection();
            let mut ids = Vec::new();
            for id in cache_store::unsynced_ids(&conn, kind)? {
                if !queue::has_operations_for(&conn, kind, &id)? {
                    ids.push(id);
                }
            }
            ids
        };

        for id in candidates {
            let remote = self.api.fetch_entity(kind, &id).await?;
            self.db.transaction(|tx| {
                // a new local edit may have been queued while fetching
                if queue::has_operations_for(tx, kind, &id)? {
                    return Ok(());
                }
                match &remote {
                    Some(record) => restore_record(tx, kind, record)?,
                    None => {
                        if conflict::apply_remote_delete(tx, kind, &id)? {
                            report.removed += 1;
                        }
                    }
                }
                Ok(())
            })?;
            report.repaired += 1;
            debug!(%kind, %id, "Restored server copy of discarded edit");
        }
        Ok(())
    }

    async fn replace_sessions(&self) -> Result<usize, SyncError> {
        let sessions = self.api.fetch_active_sessions().await?;
        let entities: Vec<LocalEntity> = sessions
            .into_iter()
            .map(|r| LocalEntity::synced(EntityKind::Session, r.id, r.data, r.updated_at))
            .collect();
        self.db
            .transaction(|tx| cache_store::replace_all(tx, EntityKind::Session, &entities))?;
        Ok(entities.len())
    }
}

/// Replace relationship edges from the id lists a record carries. Records
/// without the field leave existing edges alone.
fn apply_links(conn: &Connection, kind: EntityKind, record: &RemoteRecord) -> Result<(), SyncError> {
    for link in LinkKind::ALL {
        if link.endpoints().0 != kind {
            continue;
        }
        if let Some(Value::Array(items)) = record.data.get(link_field(link)) {
            let targets: Vec<String> = items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            cache_store::set_links(conn, link, &record.id, &targets)?;
        }
    }
    Ok(())
}

/// Overwrite the local copy with the server's, dropping the discarded edit.
/// Positions keep their device-local speed.
fn restore_record(conn: &Connection, kind: EntityKind, record: &RemoteRecord) -> Result<(), SyncError> {
    if kind == EntityKind::PlaybackPosition {
        conflict::reconcile_record(conn, kind, record)?;
        return Ok(());
    }
    cache_store::put_entity(
        conn,
        &LocalEntity::synced(kind, record.id.clone(), record.data.clone(), record.updated_at),
    )?;
    apply_links(conn, kind, record)
}

/// Format a pull report for display.
#[must_use]
pub fn format_pull_report(report: &PullReport) -> String {
    if report.offline {
        return "Pull skipped: offline".yellow().to_string();
    }

    let mut lines = Vec::new();
    lines.push(format!(
        "Pull completed: {} added, {} updated, {} removed",
        report.added(),
        report.updated(),
        report.removed()
    ));
    lines.push("─".repeat(40));

    for kind in &report.kinds {
        let status = match &kind.error {
            Some(err) => format!("{} {}", "✗".red(), err.red()),
            None => format!(
                "{} +{} ~{} -{}",
                "✓".green(),
                kind.added,
                kind.updated,
                kind.removed
            ),
        };
        lines.push(format!("  {:<18} {status}", kind.kind.to_string()));
    }

    match report.sessions {
        Some(count) => lines.push(format!("  {:<18} {count} live", "session")),
        None => lines.push(format!("  {:<18} {}", "session", "✗ not refreshed".red())),
    }

    lines.join("\n")
}
