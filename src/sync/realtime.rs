//! Applying server-pushed events to the local cache.
//!
//! Frames arrive on an `mpsc` channel from whatever transport owns the
//! socket. Each event maps to one idempotent cache mutation, applied under
//! the sync lock for that event only. A frame that fails to parse or apply is
//! logged and skipped; the stream keeps going.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::conflict;
use super::coordinator::{LockHolder, SyncCoordinator};
use super::queue::OperationStore;
use crate::api::RemoteRecord;
use crate::cache::{store as cache_store, EntityKind, LinkKind, LocalEntity};
use crate::error::SyncError;

/// An event pushed by the server, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    BookCreated { book: RemoteRecord },
    BookUpdated { book: RemoteRecord },
    BookDeleted { book_id: String },
    ContributorCreated { contributor: RemoteRecord },
    ContributorUpdated { contributor: RemoteRecord },
    ContributorDeleted { contributor_id: String },
    SeriesCreated { series: RemoteRecord },
    SeriesUpdated { series: RemoteRecord },
    SeriesDeleted { series_id: String },

    BookContributorAdded { book_id: String, contributor_id: String },
    BookContributorRemoved { book_id: String, contributor_id: String },
    BookSeriesAdded { book_id: String, series_id: String },
    BookSeriesRemoved { book_id: String, series_id: String },

    TagCreated { tag: RemoteRecord },
    TagDeleted { tag_id: String },
    BookTagged { book_id: String, tag_id: String },
    BookUntagged { book_id: String, tag_id: String },

    CollectionCreated { collection: RemoteRecord },
    CollectionUpdated { collection: RemoteRecord },
    CollectionDeleted { collection_id: String },
    CollectionBookAdded { collection_id: String, book_id: String },
    CollectionBookRemoved { collection_id: String, book_id: String },

    ShelfCreated { shelf: RemoteRecord },
    ShelfUpdated { shelf: RemoteRecord },
    ShelfDeleted { shelf_id: String },
    ShelfBookAdded { shelf_id: String, book_id: String },
    ShelfBookRemoved { shelf_id: String, book_id: String },

    /// Progress recorded on another device.
    ProgressUpdated {
        book_id: String,
        position_ms: i64,
        last_played_at: i64,
    },
    ListeningEventRecorded { event: RemoteRecord },

    SessionStarted { session: RemoteRecord },
    SessionEnded { session_id: String },

    ProfileUpdated { profile: RemoteRecord },
    PreferencesUpdated { preferences: RemoteRecord },

    ScanStarted,
    ScanProgress { current: u64, total: u64 },
    ScanCompleted,

    AccessModeChanged { mode: String },
    AccountDeleted,

    #[serde(other)]
    Unknown,
}

/// What the transport hands to the applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    /// One raw event, as JSON.
    Event(String),
    Heartbeat,
    /// The socket reconnected; events may have been missed.
    Reconnected,
}

/// Library scan lifecycle, as surfaced upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Started,
    Running,
    Completed,
}

/// Signals raised for the layers above the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum SyncNotice {
    /// A book in use was deleted; playback and downloads must stop.
    AccessRevoked { book_id: String },
    ScanProgress {
        phase: ScanPhase,
        current: u64,
        total: u64,
    },
    AccessModeChanged { mode: String },
    AccountDeleted,
    /// The transport reconnected; a catch-up pull and flush are due.
    Reconnected,
}

/// Whether a book is currently playing or downloading on this device.
#[cfg_attr(test, mockall::automock)]
pub trait MediaUsage: Send + Sync {
    fn is_in_use(&self, book_id: &str) -> bool;
}

/// `MediaUsage` for headless use: nothing is ever in use.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMediaUsage;

impl MediaUsage for NoMediaUsage {
    fn is_in_use(&self, _book_id: &str) -> bool {
        false
    }
}

/// Result of handling one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Applied,
    /// Understood, but nothing changed locally.
    Ignored,
    Failed(String),
    Heartbeat,
    Reconnected,
}

/// Counts over a run of frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    pub applied: usize,
    pub ignored: usize,
    pub failed: usize,
    pub heartbeats: usize,
    pub reconnects: usize,
}

impl ApplyStats {
    /// Tally one outcome.
    pub fn count(&mut self, outcome: &FrameOutcome) {
        match outcome {
            FrameOutcome::Applied => self.applied += 1,
            FrameOutcome::Ignored => self.ignored += 1,
            FrameOutcome::Failed(_) => self.failed += 1,
            FrameOutcome::Heartbeat => self.heartbeats += 1,
            FrameOutcome::Reconnected => self.reconnects += 1,
        }
    }
}

/// Applies realtime frames to the cache.
#[derive(Clone)]
pub struct RealtimeApplier {
    store: OperationStore,
    coordinator: SyncCoordinator,
    media: Arc<dyn MediaUsage>,
    notices: broadcast::Sender<SyncNotice>,
}

impl std::fmt::Debug for RealtimeApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeApplier").finish_non_exhaustive()
    }
}

enum Effect {
    Changed,
    Unchanged,
    Notice(SyncNotice),
    ChangedWithNotice(SyncNotice),
}

impl RealtimeApplier {
    #[must_use]
    pub const fn new(
        store: OperationStore,
        coordinator: SyncCoordinator,
        media: Arc<dyn MediaUsage>,
        notices: broadcast::Sender<SyncNotice>,
    ) -> Self {
        Self {
            store,
            coordinator,
            media,
            notices,
        }
    }

    #[must_use]
    pub fn subscribe_notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    /// Consume frames until the channel closes.
    pub async fn run(&self, mut frames: mpsc::Receiver<TransportFrame>) -> ApplyStats {
        let mut stats = ApplyStats::default();
        while let Some(frame) = frames.recv().await {
            let outcome = self.apply_frame(frame).await;
            stats.count(&outcome);
        }
        info!(
            applied = stats.applied,
            failed = stats.failed,
            "Realtime stream closed"
        );
        stats
    }

    /// Handle one frame. Never fails: problems are logged and reported in
    /// the outcome.
    pub async fn apply_frame(&self, frame: TransportFrame) -> FrameOutcome {
        let raw = match frame {
            TransportFrame::Heartbeat => return FrameOutcome::Heartbeat,
            TransportFrame::Reconnected => {
                info!("Realtime transport reconnected");
                self.notify(SyncNotice::Reconnected);
                return FrameOutcome::Reconnected;
            }
            TransportFrame::Event(raw) => raw,
        };

        let event = match serde_json::from_str::<RealtimeEvent>(&raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Skipping malformed realtime event");
                return FrameOutcome::Failed(format!("malformed event: {e}"));
            }
        };

        match self.apply_event(&event).await {
            Ok(true) => FrameOutcome::Applied,
            Ok(false) => FrameOutcome::Ignored,
            Err(e) => {
                warn!(?event, error = %e, "Failed to apply realtime event");
                FrameOutcome::Failed(e.to_string())
            }
        }
    }

    /// Apply a parsed event. Returns whether local state changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be updated.
    pub async fn apply_event(&self, event: &RealtimeEvent) -> Result<bool, SyncError> {
        let effect = {
            let _guard = self.coordinator.acquire(LockHolder::Realtime).await;
            self.mutate(event)?
        };

        let changed = match effect {
            Effect::Changed => true,
            Effect::Unchanged => false,
            Effect::Notice(notice) => {
                self.notify(notice);
                false
            }
            Effect::ChangedWithNotice(notice) => {
                self.notify(notice);
                true
            }
        };
        debug!(?event, changed, "Applied realtime event");
        Ok(changed)
    }

    fn notify(&self, notice: SyncNotice) {
        // no subscribers is fine
        let _ = self.notices.send(notice);
    }

    fn mutate(&self, event: &RealtimeEvent) -> Result<Effect, SyncError> {
        use RealtimeEvent as E;

        match event {
            E::BookCreated { book } | E::BookUpdated { book } => self.upsert(EntityKind::Book, book),
            E::ContributorCreated { contributor } | E::ContributorUpdated { contributor } => {
                self.upsert(EntityKind::Contributor, contributor)
            }
            E::SeriesCreated { series } | E::SeriesUpdated { series } => {
                self.upsert(EntityKind::Series, series)
            }
            E::TagCreated { tag } => self.upsert(EntityKind::Tag, tag),
            E::CollectionCreated { collection } | E::CollectionUpdated { collection } => {
                self.upsert(EntityKind::Collection, collection)
            }
            E::ShelfCreated { shelf } | E::ShelfUpdated { shelf } => {
                self.upsert(EntityKind::Shelf, shelf)
            }
            E::ListeningEventRecorded { event } => self.upsert(EntityKind::ListeningEvent, event),
            E::ProfileUpdated { profile } => self.upsert(EntityKind::Profile, profile),
            E::PreferencesUpdated { preferences } => {
                self.upsert(EntityKind::Preferences, preferences)
            }

            E::BookDeleted { book_id } => self.delete_book(book_id),
            E::ContributorDeleted { contributor_id } => {
                self.delete(EntityKind::Contributor, contributor_id)
            }
            E::SeriesDeleted { series_id } => self.delete(EntityKind::Series, series_id),
            E::TagDeleted { tag_id } => self.delete(EntityKind::Tag, tag_id),
            E::CollectionDeleted { collection_id } => {
                self.delete(EntityKind::Collection, collection_id)
            }
            E::ShelfDeleted { shelf_id } => self.delete(EntityKind::Shelf, shelf_id),

            E::BookContributorAdded {
                book_id,
                contributor_id,
            } => self.link(LinkKind::BookContributor, book_id, contributor_id, true),
            E::BookContributorRemoved {
                book_id,
                contributor_id,
            } => self.link(LinkKind::BookContributor, book_id, contributor_id, false),
            E::BookSeriesAdded { book_id, series_id } => {
                self.link(LinkKind::BookSeries, book_id, series_id, true)
            }
            E::BookSeriesRemoved { book_id, series_id } => {
                self.link(LinkKind::BookSeries, book_id, series_id, false)
            }
            E::BookTagged { book_id, tag_id } => self.link(LinkKind::BookTag, book_id, tag_id, true),
            E::BookUntagged { book_id, tag_id } => {
                self.link(LinkKind::BookTag, book_id, tag_id, false)
            }
            E::CollectionBookAdded {
                collection_id,
                book_id,
            } => self.link(LinkKind::CollectionBook, collection_id, book_id, true),
            E::CollectionBookRemoved {
                collection_id,
                book_id,
            } => self.link(LinkKind::CollectionBook, collection_id, book_id, false),
            E::ShelfBookAdded { shelf_id, book_id } => {
                self.link(LinkKind::ShelfBook, shelf_id, book_id, true)
            }
            E::ShelfBookRemoved { shelf_id, book_id } => {
                self.link(LinkKind::ShelfBook, shelf_id, book_id, false)
            }

            E::ProgressUpdated {
                book_id,
                position_ms,
                last_played_at,
            } => {
                let applied = conflict::apply_remote_progress(
                    &self.store.database().connection(),
                    book_id,
                    *position_ms,
                    *last_played_at,
                )?;
                if !applied {
                    debug!(%book_id, last_played_at, "Ignored stale progress");
                }
                Ok(if applied { Effect::Changed } else { Effect::Unchanged })
            }

            E::SessionStarted { session } => {
                cache_store::put_entity(
                    &self.store.database().connection(),
                    &LocalEntity::synced(
                        EntityKind::Session,
                        session.id.clone(),
                        session.data.clone(),
                        session.updated_at,
                    ),
                )?;
                Ok(Effect::Changed)
            }
            E::SessionEnded { session_id } => self.delete(EntityKind::Session, session_id),

            E::ScanStarted => Ok(Effect::Notice(SyncNotice::ScanProgress {
                phase: ScanPhase::Started,
                current: 0,
                total: 0,
            })),
            E::ScanProgress { current, total } => Ok(Effect::Notice(SyncNotice::ScanProgress {
                phase: ScanPhase::Running,
                current: *current,
                total: *total,
            })),
            E::ScanCompleted => Ok(Effect::Notice(SyncNotice::ScanProgress {
                phase: ScanPhase::Completed,
                current: 0,
                total: 0,
            })),
            E::AccessModeChanged { mode } => {
                Ok(Effect::Notice(SyncNotice::AccessModeChanged { mode: mode.clone() }))
            }

            E::AccountDeleted => {
                warn!("Account deleted on server; clearing local data");
                self.store
                    .database()
                    .transaction(|tx| cache_store::clear_all(tx))?;
                self.store.clear()?;
                Ok(Effect::ChangedWithNotice(SyncNotice::AccountDeleted))
            }

            E::Unknown => Ok(Effect::Unchanged),
        }
    }

    fn upsert(&self, kind: EntityKind, record: &RemoteRecord) -> Result<Effect, SyncError> {
        let outcome = self
            .store
            .database()
            .transaction(|tx| conflict::reconcile_record(tx, kind, record))?;
        Ok(match outcome {
            conflict::ApplyOutcome::KeptLocal => Effect::Unchanged,
            conflict::ApplyOutcome::Added | conflict::ApplyOutcome::Updated => Effect::Changed,
        })
    }

    fn delete(&self, kind: EntityKind, id: &str) -> Result<Effect, SyncError> {
        let removed = self
            .store
            .database()
            .transaction(|tx| conflict::apply_remote_delete(tx, kind, id))?;
        Ok(if removed { Effect::Changed } else { Effect::Unchanged })
    }

    fn delete_book(&self, book_id: &str) -> Result<Effect, SyncError> {
        let effect = self.delete(EntityKind::Book, book_id)?;
        if !self.media.is_in_use(book_id) {
            return Ok(effect);
        }

        warn!(%book_id, "Book in use was deleted; revoking access");
        let notice = SyncNotice::AccessRevoked {
            book_id: book_id.to_string(),
        };
        Ok(match effect {
            Effect::Changed => Effect::ChangedWithNotice(notice),
            _ => Effect::Notice(notice),
        })
    }

    fn link(&self, link: LinkKind, from_id: &str, to_id: &str, add: bool) -> Result<Effect, SyncError> {
        let conn = self.store.database().connection();
        if add {
            cache_store::add_link(&conn, link, from_id, to_id)?;
            Ok(Effect::Changed)
        } else {
            let removed = cache_store::remove_link(&conn, link, from_id, to_id)?;
            Ok(if removed { Effect::Changed } else { Effect::Unchanged })
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::api::{MemoryServer, ServerApi};
    use crate::cache::{LocalCache, SyncState};
    use crate::storage::Database;
    use crate::sync::handlers::{FieldPatch, Handlers};

    struct Harness {
        applier: RealtimeApplier,
        store: OperationStore,
        cache: LocalCache,
    }

    fn harness_with(media: Arc<dyn MediaUsage>) -> Harness {
        let db = Database::open_in_memory().unwrap();
        let store = OperationStore::new(db.clone()).unwrap();
        let (notices, _) = broadcast::channel(16);
        Harness {
            applier: RealtimeApplier::new(store.clone(), SyncCoordinator::new(), media, notices),
            store,
            cache: LocalCache::new(db),
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(NoMediaUsage))
    }

    fn frame(value: serde_json::Value) -> TransportFrame {
        TransportFrame::Event(value.to_string())
    }

    fn book_created(id: &str, title: &str) -> TransportFrame {
        frame(json!({
            "type": "book_created",
            "book": {"id": id, "updated_at": 10, "data": {"title": title}}
        }))
    }

    #[tokio::test]
    async fn test_malformed_event_does_not_stop_stream() {
        let h = harness();
        let (tx, rx) = mpsc::channel(8);
        tx.send(book_created("b1", "One")).await.unwrap();
        tx.send(book_created("b2", "Two")).await.unwrap();
        tx.send(TransportFrame::Event("{\"type\": \"book_created\", \"book\": ".into()))
            .await
            .unwrap();
        tx.send(book_created("b4", "Four")).await.unwrap();
        tx.send(book_created("b5", "Five")).await.unwrap();
        drop(tx);

        let stats = h.applier.run(rx).await;

        assert_eq!(stats.applied, 4);
        assert_eq!(stats.failed, 1);
        let ids: Vec<_> = h
            .cache
            .list(EntityKind::Book)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["b1", "b2", "b4", "b5"]);
    }

    #[tokio::test]
    async fn test_progress_applies_only_when_newer() {
        let h = harness();
        let progress = |position_ms: i64, last_played_at: i64| {
            frame(json!({
                "type": "progress_updated",
                "book_id": "b1",
                "position_ms": position_ms,
                "last_played_at": last_played_at,
            }))
        };

        assert_eq!(h.applier.apply_frame(progress(500, 100)).await, FrameOutcome::Applied);
        assert_eq!(h.applier.apply_frame(progress(900, 200)).await, FrameOutcome::Applied);
        assert_eq!(h.applier.apply_frame(progress(100, 50)).await, FrameOutcome::Ignored);

        let position = h.cache.position("b1").unwrap().unwrap();
        assert_eq!(position.position_ms, 900);
        assert_eq!(position.last_played_at, 200);
    }

    #[tokio::test]
    async fn test_deleting_book_in_use_revokes_access() {
        let mut media = MockMediaUsage::new();
        media
            .expect_is_in_use()
            .times(1)
            .returning(|book_id| book_id == "b1");
        let h = harness_with(Arc::new(media));
        let mut notices = h.applier.subscribe_notices();
        h.applier.apply_frame(book_created("b1", "One")).await;

        let outcome = h
            .applier
            .apply_frame(frame(json!({"type": "book_deleted", "book_id": "b1"})))
            .await;

        assert_eq!(outcome, FrameOutcome::Applied);
        assert_eq!(
            notices.try_recv().unwrap(),
            SyncNotice::AccessRevoked {
                book_id: "b1".into()
            }
        );
        assert!(h.cache.get(EntityKind::Book, "b1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deleting_idle_book_raises_nothing() {
        let mut media = MockMediaUsage::new();
        media.expect_is_in_use().times(1).returning(|_| false);
        let h = harness_with(Arc::new(media));
        let mut notices = h.applier.subscribe_notices();

        h.applier
            .apply_frame(frame(json!({"type": "book_deleted", "book_id": "b9"})))
            .await;

        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored() {
        let h = harness();
        let outcome = h
            .applier
            .apply_frame(frame(json!({"type": "transcoding_finished", "book_id": "b1"})))
            .await;
        assert_eq!(outcome, FrameOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_relationship_events() {
        let h = harness();
        h.applier
            .apply_frame(frame(json!({"type": "book_tagged", "book_id": "b1", "tag_id": "t1"})))
            .await;
        h.applier
            .apply_frame(frame(json!({"type": "book_tagged", "book_id": "b1", "tag_id": "t2"})))
            .await;
        let outcome = h
            .applier
            .apply_frame(frame(json!({"type": "book_untagged", "book_id": "b1", "tag_id": "t1"})))
            .await;

        assert_eq!(outcome, FrameOutcome::Applied);
        assert_eq!(h.cache.links_from(LinkKind::BookTag, "b1").unwrap(), vec!["t2"]);
    }

    #[tokio::test]
    async fn test_update_respects_pending_local_edit() {
        let h = harness();
        let server: Arc<dyn ServerApi> = Arc::new(MemoryServer::new());
        let handlers = Handlers::new(&server);
        let edit = json!({"title": "Mine"});
        h.cache
            .apply_local_edit(EntityKind::Book, "b1", edit.as_object().unwrap())
            .unwrap();
        h.store
            .queue(
                &handlers.update_book,
                Some(EntityKind::Book),
                Some("b1"),
                &FieldPatch(edit.as_object().unwrap().clone()),
            )
            .unwrap();

        let outcome = h
            .applier
            .apply_frame(frame(json!({
                "type": "book_updated",
                "book": {"id": "b1", "updated_at": 1, "data": {"title": "Theirs"}}
            })))
            .await;

        assert_eq!(outcome, FrameOutcome::Ignored);
        let local = h.cache.get(EntityKind::Book, "b1").unwrap().unwrap();
        assert_eq!(local.data["title"], "Mine");
        assert_eq!(local.sync_state, SyncState::NotSynced);
    }

    #[tokio::test]
    async fn test_account_deleted_clears_everything() {
        let h = harness();
        let server: Arc<dyn ServerApi> = Arc::new(MemoryServer::new());
        let handlers = Handlers::new(&server);
        h.applier.apply_frame(book_created("b1", "One")).await;
        h.store
            .queue(
                &handlers.update_preferences,
                Some(EntityKind::Preferences),
                None,
                &FieldPatch(json!({"theme": "dark"}).as_object().unwrap().clone()),
            )
            .unwrap();
        let mut notices = h.applier.subscribe_notices();

        h.applier
            .apply_frame(frame(json!({"type": "account_deleted"})))
            .await;

        assert!(h.cache.list(EntityKind::Book).unwrap().is_empty());
        assert_eq!(h.store.stats().unwrap().pending, 0);
        assert_eq!(notices.try_recv().unwrap(), SyncNotice::AccountDeleted);
    }

    #[tokio::test]
    async fn test_transport_signals() {
        let h = harness();
        let mut notices = h.applier.subscribe_notices();

        assert_eq!(
            h.applier.apply_frame(TransportFrame::Heartbeat).await,
            FrameOutcome::Heartbeat
        );
        assert_eq!(
            h.applier.apply_frame(TransportFrame::Reconnected).await,
            FrameOutcome::Reconnected
        );
        assert_eq!(notices.try_recv().unwrap(), SyncNotice::Reconnected);
    }

    #[tokio::test]
    async fn test_scan_events_become_notices() {
        let h = harness();
        let mut notices = h.applier.subscribe_notices();

        let outcome = h
            .applier
            .apply_frame(frame(json!({"type": "scan_progress", "current": 3, "total": 10})))
            .await;

        assert_eq!(outcome, FrameOutcome::Ignored);
        assert_eq!(
            notices.try_recv().unwrap(),
            SyncNotice::ScanProgress {
                phase: ScanPhase::Running,
                current: 3,
                total: 10
            }
        );
    }
}
