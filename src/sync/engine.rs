//! Wiring of the sync components and their background triggers.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use super::coordinator::{RetryPolicy, SyncCoordinator};
use super::executor::OperationExecutor;
use super::handlers::{FieldPatch, Handlers};
use super::operation::PendingOperation;
use super::pull::{PullOrchestrator, PullProgress, PullReport};
use super::push::{PushOrchestrator, PushReport, PushStop};
use super::queue::{OperationStore, QueueOutcome, QueueStats};
use super::realtime::{MediaUsage, RealtimeApplier, SyncNotice, TransportFrame};
use crate::api::{ListeningEvent, PositionUpdate, ServerApi};
use crate::cache::{store as cache_store, EntityKind, LocalCache, SINGLETON_ID};
use crate::config::SyncSettings;
use crate::error::SyncError;
use crate::network::NetworkMonitor;
use crate::storage::Database;

const NOTICE_CAPACITY: usize = 64;

/// The offline-first sync engine.
pub struct SyncEngine {
    cache: LocalCache,
    store: OperationStore,
    handlers: Handlers,
    push: PushOrchestrator,
    pull: PullOrchestrator,
    realtime: RealtimeApplier,
    network: NetworkMonitor,
    settings: SyncSettings,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Build the engine over `db`, recovering any operation a previous
    /// process left mid-flush.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be opened or recovered.
    pub fn new(
        db: Database,
        api: Arc<dyn ServerApi>,
        network: NetworkMonitor,
        media: Arc<dyn MediaUsage>,
        settings: &SyncSettings,
    ) -> Result<Self, SyncError> {
        let store = OperationStore::new(db.clone())?;
        store.reset_stuck_operations()?;

        let coordinator = SyncCoordinator::new();
        let handlers = Handlers::new(&api);
        let push = PushOrchestrator::new(
            store.clone(),
            OperationExecutor::new(handlers.registry()),
            coordinator.clone(),
            network.clone(),
            RetryPolicy::from_settings(settings),
            settings.push_batch_limit,
        );
        let pull = PullOrchestrator::new(
            db.clone(),
            api,
            coordinator.clone(),
            network.clone(),
            settings.pull_page_size,
        );
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let realtime = RealtimeApplier::new(store.clone(), coordinator, media, notices);

        Ok(Self {
            cache: LocalCache::new(db),
            store,
            handlers,
            push,
            pull,
            realtime,
            network,
            settings: settings.clone(),
        })
    }

    #[must_use]
    pub const fn cache(&self) -> &LocalCache {
        &self.cache
    }

    #[must_use]
    pub const fn store(&self) -> &OperationStore {
        &self.store
    }

    #[must_use]
    pub const fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    #[must_use]
    pub const fn realtime(&self) -> &RealtimeApplier {
        &self.realtime
    }

    /// # Errors
    ///
    /// Returns an error for local storage failures.
    pub async fn flush(&self) -> Result<PushReport, SyncError> {
        self.push.flush().await
    }

    pub async fn pull(&self) -> PullReport {
        self.pull.pull().await
    }

    /// # Errors
    ///
    /// Returns `NotFound` if no such operation exists.
    pub fn retry(&self, id: &str) -> Result<(), SyncError> {
        self.store.retry(id)
    }

    /// # Errors
    ///
    /// Returns `NotFound` if no such operation exists.
    pub fn dismiss(&self, id: &str) -> Result<PendingOperation, SyncError> {
        self.store.dismiss(id)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn stats(&self) -> Result<QueueStats, SyncError> {
        self.store.stats()
    }

    /// Edit book metadata locally and queue the change.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache or queue write fails.
    pub fn update_book(
        &self,
        book_id: &str,
        fields: Map<String, Value>,
    ) -> Result<QueueOutcome, SyncError> {
        let patch = FieldPatch(fields);
        self.store.queue_with(
            &self.handlers.update_book,
            Some(EntityKind::Book),
            Some(book_id),
            &patch,
            |tx| cache_store::apply_local_edit(tx, EntityKind::Book, book_id, &patch.0).map(|_| ()),
        )
    }

    /// Record playback progress locally and queue it. The speed stays on
    /// this device.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache or queue write fails.
    pub fn update_playback_position(
        &self,
        book_id: &str,
        position_ms: i64,
        last_played_at: i64,
        playback_speed: Option<f64>,
    ) -> Result<QueueOutcome, SyncError> {
        self.store.queue_with(
            &self.handlers.update_playback_position,
            Some(EntityKind::PlaybackPosition),
            Some(book_id),
            &PositionUpdate {
                position_ms,
                last_played_at,
            },
            |tx| {
                cache_store::apply_local_position(
                    tx,
                    book_id,
                    position_ms,
                    last_played_at,
                    playback_speed,
                )
                .map(|_| ())
            },
        )
    }

    /// Queue a listening interval. Events are history only and never cached
    /// locally.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue write fails.
    pub fn record_listening_event(&self, event: &ListeningEvent) -> Result<QueueOutcome, SyncError> {
        self.store.queue(
            &self.handlers.record_listening_event,
            Some(EntityKind::ListeningEvent),
            Some(&event.book_id),
            event,
        )
    }

    /// # Errors
    ///
    /// Returns an error if the cache or queue write fails.
    pub fn update_preferences(&self, fields: Map<String, Value>) -> Result<QueueOutcome, SyncError> {
        let patch = FieldPatch(fields);
        self.store.queue_with(
            &self.handlers.update_preferences,
            Some(EntityKind::Preferences),
            None,
            &patch,
            |tx| {
                cache_store::apply_local_edit(tx, EntityKind::Preferences, SINGLETON_ID, &patch.0)
                    .map(|_| ())
            },
        )
    }

    #[must_use]
    pub fn subscribe_pending_count(&self) -> watch::Receiver<usize> {
        self.store.subscribe_pending_count()
    }

    #[must_use]
    pub fn subscribe_failed(&self) -> watch::Receiver<Vec<PendingOperation>> {
        self.store.subscribe_failed()
    }

    #[must_use]
    pub fn subscribe_current(&self) -> watch::Receiver<Option<PendingOperation>> {
        self.store.subscribe_current()
    }

    #[must_use]
    pub fn subscribe_pull_progress(&self) -> watch::Receiver<PullProgress> {
        self.pull.subscribe_progress()
    }

    #[must_use]
    pub fn subscribe_notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.realtime.subscribe_notices()
    }

    /// Spawn the background triggers: flush on new work, on reconnect and on
    /// a schedule; pull on a schedule and after a transport reconnect; and,
    /// when `frames` is given, the realtime applier.
    #[must_use]
    pub fn start(self: &Arc<Self>, frames: Option<mpsc::Receiver<TransportFrame>>) -> EngineHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut tasks = vec![
            tokio::spawn(Arc::clone(self).push_loop(shutdown_rx.clone())),
            tokio::spawn(Arc::clone(self).pull_loop(shutdown_rx.clone())),
        ];
        if let Some(frames) = frames {
            tasks.push(tokio::spawn(Arc::clone(self).realtime_loop(frames, shutdown_rx)));
        }

        info!(tasks = tasks.len(), "Sync engine started");
        EngineHandle { shutdown, tasks }
    }

    async fn push_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let policy = *self.push.policy();
        let mut network = self.network.clone();
        let mut network_alive = true;
        let mut ticker = time::interval(self.settings.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures: u32 = 0;

        loop {
            let backoff = policy.backoff(failures);
            tokio::select! {
                _ = shutdown.changed() => break,
                () = self.store.queued(), if failures == 0 => {}
                came_online = network.came_online(), if network_alive => {
                    network_alive = came_online;
                }
                _ = ticker.tick() => {}
                () = time::sleep(backoff), if failures > 0 => {}
            }

            if !self.network.is_online() {
                continue;
            }

            match self.push.flush().await {
                Ok(report) if report.stop == PushStop::RetryLater => {
                    failures = failures.saturating_add(1);
                    debug!(failures, delay = ?policy.backoff(failures), "Backing off");
                }
                Ok(_) => failures = 0,
                Err(e) => {
                    error!(error = %e, "Flush failed");
                    failures = failures.saturating_add(1);
                }
            }
        }
        debug!("Push loop stopped");
    }

    async fn pull_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut notices = self.subscribe_notices();
        let mut ticker = time::interval(self.settings.pull_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reconnected = tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => false,
                notice = notices.recv() => match notice {
                    Ok(SyncNotice::Reconnected) => true,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
            };

            self.pull.pull().await;
            if reconnected {
                if let Err(e) = self.push.flush().await {
                    error!(error = %e, "Flush after reconnect failed");
                }
            }
        }
        debug!("Pull loop stopped");
    }

    async fn realtime_loop(
        self: Arc<Self>,
        frames: mpsc::Receiver<TransportFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tokio::select! {
            _ = shutdown.changed() => {}
            stats = self.realtime.run(frames) => {
                debug!(?stats, "Realtime applier finished");
            }
        }
    }
}

/// Running background tasks. Dropping the handle leaves them running;
/// call [`EngineHandle::shutdown`] to stop them.
#[derive(Debug)]
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Signal every task and wait for it to finish its current step.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Sync task ended abnormally");
            }
        }
        info!("Sync engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::api::{ApiCall, MemoryServer};
    use crate::cache::SyncState;
    use crate::network::network_channel;
    use crate::sync::pull::PullPhase;
    use crate::sync::realtime::NoMediaUsage;

    fn engine(server: &Arc<MemoryServer>, network: NetworkMonitor) -> Arc<SyncEngine> {
        Arc::new(
            SyncEngine::new(
                Database::open_in_memory().unwrap(),
                server.clone(),
                network,
                Arc::new(NoMediaUsage),
                &SyncSettings::default(),
            )
            .unwrap(),
        )
    }

    fn fields(value: serde_json::Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_local_edit_then_flush() {
        let server = Arc::new(MemoryServer::new());
        server.put_record(EntityKind::Book, "b1", json!({"title": "Old"}), 1);
        let engine = engine(&server, NetworkMonitor::fixed(true));

        engine.update_book("b1", fields(json!({"title": "New"}))).unwrap();
        let local = engine.cache().get(EntityKind::Book, "b1").unwrap().unwrap();
        assert_eq!(local.sync_state, SyncState::NotSynced);

        let report = engine.flush().await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(
            server.record(EntityKind::Book, "b1").unwrap().data["title"],
            "New"
        );
        let local = engine.cache().get(EntityKind::Book, "b1").unwrap().unwrap();
        assert_eq!(local.sync_state, SyncState::Synced);
    }

    #[tokio::test]
    async fn test_position_speed_stays_local() {
        let server = Arc::new(MemoryServer::new());
        let engine = engine(&server, NetworkMonitor::fixed(true));

        engine
            .update_playback_position("b1", 60_000, 10, Some(1.5))
            .unwrap();
        engine.flush().await.unwrap();

        assert_eq!(
            server.mutation_calls(),
            vec![ApiCall::UpdatePlaybackPosition {
                book_id: "b1".into(),
                update: PositionUpdate {
                    position_ms: 60_000,
                    last_played_at: 10,
                },
            }]
        );
        let local = engine.cache().position("b1").unwrap().unwrap();
        assert_eq!(local.playback_speed, Some(1.5));
        assert_eq!(local.sync_state, SyncState::Synced);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pulls_racing_local_edits_never_strand_an_edit() {
        let server = Arc::new(MemoryServer::new());
        server.put_record(EntityKind::Book, "b1", json!({"title": "Server"}), 1);
        let engine = engine(&server, NetworkMonitor::fixed(true));
        engine.pull().await;

        let puller = {
            let engine = engine.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    engine.pull().await;
                }
            })
        };
        let editor = {
            let engine = engine.clone();
            tokio::task::spawn_blocking(move || {
                for i in 0..50 {
                    engine
                        .update_book("b1", fields(json!({ "title": format!("Local {i}") })))
                        .unwrap();
                }
            })
        };
        editor.await.unwrap();
        puller.await.unwrap();
        engine.pull().await;

        let cached = engine.cache().get(EntityKind::Book, "b1").unwrap().unwrap();
        assert_eq!(cached.data["title"], "Local 49");
        assert_eq!(cached.sync_state, SyncState::NotSynced);
        assert_eq!(engine.stats().unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_new_recovers_stuck_operations() {
        let server = Arc::new(MemoryServer::new());
        let db = Database::open_in_memory().unwrap();
        {
            let first = SyncEngine::new(
                db.clone(),
                server.clone(),
                NetworkMonitor::fixed(true),
                Arc::new(NoMediaUsage),
                &SyncSettings::default(),
            )
            .unwrap();
            first.update_preferences(fields(json!({"theme": "dark"}))).unwrap();
            assert_eq!(first.store().claim_next_batch(10).unwrap().len(), 1);
        }

        let engine = SyncEngine::new(
            db,
            server,
            NetworkMonitor::fixed(true),
            Arc::new(NoMediaUsage),
            &SyncSettings::default(),
        )
        .unwrap();

        let stats = engine.stats().unwrap();
        assert_eq!(stats.in_progress, 0);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_background_flush_when_network_returns() {
        let server = Arc::new(MemoryServer::new());
        let (switch, monitor) = network_channel(false);
        let engine = engine(&server, monitor);
        let handle = engine.start(None);

        engine.update_preferences(fields(json!({"theme": "dark"}))).unwrap();
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*engine.subscribe_pending_count().borrow(), 1);

        switch.set_online(true);
        let mut pending = engine.subscribe_pending_count();
        time::timeout(Duration::from_secs(5), pending.wait_for(|n| *n == 0))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(server.mutation_calls().len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_frame_triggers_pull() {
        let server = Arc::new(MemoryServer::new());
        let engine = engine(&server, NetworkMonitor::fixed(true));
        let (frames, rx) = mpsc::channel(8);
        let handle = engine.start(Some(rx));

        // let the initial scheduled pull finish first
        let mut progress = engine.subscribe_pull_progress();
        time::timeout(
            Duration::from_secs(5),
            progress.wait_for(|p| p.phase == PullPhase::Done),
        )
        .await
        .unwrap()
        .unwrap();

        server.put_record(EntityKind::Series, "s1", json!({"name": "Dune"}), 5);
        frames.send(TransportFrame::Reconnected).await.unwrap();

        time::timeout(Duration::from_secs(5), async {
            while engine.cache().get(EntityKind::Series, "s1").unwrap().is_none() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        handle.shutdown().await;
    }
}
