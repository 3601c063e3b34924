//! Durable store of pending local mutations.
//!
//! Every local write is recorded here before any network attempt. Repeated
//! edits to the same target are coalesced into one row, so the server only
//! ever sees the net effect, in order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handler::{ErasedHandler, OperationHandler};
use super::operation::{OperationStatus, OperationType, PendingOperation};
use crate::cache::store as cache_store;
use crate::cache::{EntityKind, SyncState, SINGLETON_ID};
use crate::error::SyncError;
use crate::storage::{millis_to_datetime, now_millis, Database};

const SELECT_COLUMNS: &str = r"SELECT id, operation_type, entity_type, entity_id, payload,
       batch_key, status, created_at, updated_at, attempt_count, last_error
  FROM pending_operations";

/// What `queue` did with a new mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    /// A new row was written.
    Inserted(String),
    /// The mutation was folded into an existing row.
    Coalesced(String),
}

impl QueueOutcome {
    /// Id of the row now carrying the mutation.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Inserted(id) | Self::Coalesced(id) => id,
        }
    }
}

/// Row counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_progress: usize,
    pub failed: usize,
    pub oldest_pending: Option<DateTime<Utc>>,
}

struct Signals {
    queued: Notify,
    pending_count: watch::Sender<usize>,
    failed: watch::Sender<Vec<PendingOperation>>,
    current: watch::Sender<Option<PendingOperation>>,
}

/// The operation queue. Clones share the same database and signals.
#[derive(Clone)]
pub struct OperationStore {
    db: Database,
    signals: Arc<Signals>,
}

impl std::fmt::Debug for OperationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationStore").finish_non_exhaustive()
    }
}

fn conversion_err(idx: usize, err: SyncError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn row_to_operation(row: &Row<'_>) -> rusqlite::Result<PendingOperation> {
    let operation_type: String = row.get(1)?;
    let entity_type: Option<String> = row.get(2)?;
    let status: String = row.get(6)?;

    Ok(PendingOperation {
        id: row.get(0)?,
        operation_type: operation_type.parse().map_err(|e| conversion_err(1, e))?,
        entity_type: entity_type
            .map(|s| s.parse::<EntityKind>())
            .transpose()
            .map_err(|e| conversion_err(2, e))?,
        entity_id: row.get(3)?,
        payload: row.get(4)?,
        batch_key: row.get(5)?,
        status: status.parse().map_err(|e| conversion_err(6, e))?,
        created_at: millis_to_datetime(row.get(7)?),
        updated_at: millis_to_datetime(row.get(8)?),
        attempt_count: row.get(9)?,
        last_error: row.get(10)?,
    })
}

fn query_operations(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<PendingOperation>, SyncError> {
    let sql = format!("{SELECT_COLUMNS} {filter}");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| SyncError::Database(format!("Failed to prepare query: {e}")))?;

    let rows = stmt
        .query_map(params, row_to_operation)
        .map_err(|e| SyncError::Database(format!("Failed to query operations: {e}")))?;

    let mut operations = Vec::new();
    for row in rows {
        operations.push(row.map_err(|e| SyncError::Database(e.to_string()))?);
    }
    Ok(operations)
}

/// Existing row a new mutation may be folded into. In-progress rows are
/// never candidates: their payload is already on the wire.
fn find_coalesce_candidate(
    conn: &Connection,
    operation_type: OperationType,
    entity_id: Option<&str>,
) -> Result<Option<PendingOperation>, SyncError> {
    let found = if operation_type.is_global() {
        query_operations(
            conn,
            "WHERE operation_type = ?1 AND status IN ('pending', 'failed') ORDER BY seq LIMIT 1",
            params![operation_type.as_str()],
        )?
    } else if let Some(entity_id) = entity_id {
        query_operations(
            conn,
            r"WHERE operation_type = ?1 AND entity_id = ?2
                AND status IN ('pending', 'failed') ORDER BY seq LIMIT 1",
            params![operation_type.as_str(), entity_id],
        )?
    } else {
        Vec::new()
    };
    Ok(found.into_iter().next())
}

fn find_by_id(conn: &Connection, id: &str) -> Result<PendingOperation, SyncError> {
    query_operations(conn, "WHERE id = ?1", [id])?
        .into_iter()
        .next()
        .ok_or_else(|| SyncError::NotFound(format!("operation {id}")))
}

fn next_batch(conn: &Connection, limit: usize) -> Result<Vec<PendingOperation>, SyncError> {
    let Some(head) = query_operations(conn, "WHERE status = 'pending' ORDER BY seq LIMIT 1", [])?
        .into_iter()
        .next()
    else {
        return Ok(Vec::new());
    };

    match &head.batch_key {
        None => Ok(vec![head]),
        Some(key) => query_operations(
            conn,
            r"WHERE status = 'pending' AND operation_type = ?1 AND batch_key = ?2
              ORDER BY seq LIMIT ?3",
            params![
                head.operation_type.as_str(),
                key,
                i64::try_from(limit.max(1)).unwrap_or(i64::MAX)
            ],
        ),
    }
}

fn set_in_progress(conn: &Connection, ids: &[String], now: i64) -> Result<(), SyncError> {
    for id in ids {
        conn.execute(
            r"UPDATE pending_operations SET status = 'in_progress', updated_at = ?1
              WHERE id = ?2 AND status = 'pending'",
            params![now, id],
        )
        .map_err(|e| SyncError::Database(format!("Failed to update status: {e}")))?;
    }
    Ok(())
}

fn delete_rows(conn: &Connection, ids: &[String]) -> Result<(), SyncError> {
    for id in ids {
        conn.execute("DELETE FROM pending_operations WHERE id = ?1", [id])
            .map_err(|e| SyncError::Database(format!("Failed to delete operation: {e}")))?;
    }
    Ok(())
}

impl OperationStore {
    /// Open the store over `db`.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial counts cannot be read.
    pub fn new(db: Database) -> Result<Self, SyncError> {
        let store = Self {
            db,
            signals: Arc::new(Signals {
                queued: Notify::new(),
                pending_count: watch::channel(0).0,
                failed: watch::channel(Vec::new()).0,
                current: watch::channel(None).0,
            }),
        };
        store.publish()?;
        Ok(store)
    }

    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Record a mutation, coalescing with an existing row for the same target
    /// when the handler allows it.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or the write
    /// fails.
    pub fn queue<H: OperationHandler>(
        &self,
        handler: &H,
        entity_type: Option<EntityKind>,
        entity_id: Option<&str>,
        payload: &H::Payload,
    ) -> Result<QueueOutcome, SyncError> {
        self.queue_with(handler, entity_type, entity_id, payload, |_| Ok(()))
    }

    /// Like [`queue`](Self::queue), but first runs `local` in the same
    /// transaction. A local cache write made there commits together with
    /// its queue row, so no reader ever sees the edit without the row that
    /// protects it (or the reverse).
    ///
    /// # Errors
    ///
    /// Returns an error if `local` fails, the payload cannot be serialized
    /// or the write fails. Nothing is committed in that case.
    pub fn queue_with<H: OperationHandler>(
        &self,
        handler: &H,
        entity_type: Option<EntityKind>,
        entity_id: Option<&str>,
        payload: &H::Payload,
        local: impl FnOnce(&Connection) -> Result<(), SyncError>,
    ) -> Result<QueueOutcome, SyncError> {
        let operation_type = OperationHandler::operation_type(handler);
        let serialized = handler.serialize_payload(payload)?;
        let batch_key = handler.batch_key(payload);
        let entity_id = if operation_type.is_global() {
            None
        } else {
            entity_id
        };

        let outcome = self.db.transaction(|tx| {
            local(tx)?;
            if let Some(existing) = find_coalesce_candidate(tx, operation_type, entity_id)? {
                if OperationHandler::should_coalesce(handler, &existing) {
                    if let Some(merged) = handler.coalesce_stored(&existing.payload, &serialized)? {
                        let merged_key = handler.batch_key_stored(&merged)?;
                        tx.execute(
                            r"UPDATE pending_operations SET
                                  payload = ?1,
                                  batch_key = ?2,
                                  status = 'pending',
                                  attempt_count = 0,
                                  last_error = NULL,
                                  updated_at = ?3
                              WHERE id = ?4",
                            params![merged, merged_key, now_millis(), existing.id],
                        )
                        .map_err(|e| {
                            SyncError::Database(format!("Failed to coalesce operation: {e}"))
                        })?;
                        return Ok(QueueOutcome::Coalesced(existing.id));
                    }
                }
            }

            let id = Uuid::new_v4().to_string();
            let now = now_millis();
            tx.execute(
                r"INSERT INTO pending_operations
                      (id, operation_type, entity_type, entity_id, payload, batch_key,
                       status, created_at, updated_at, attempt_count)
                  VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7, 0)",
                params![
                    id,
                    operation_type.as_str(),
                    entity_type.map(EntityKind::as_str),
                    entity_id,
                    serialized,
                    batch_key,
                    now,
                ],
            )
            .map_err(|e| SyncError::Database(format!("Failed to enqueue operation: {e}")))?;
            Ok(QueueOutcome::Inserted(id))
        })?;

        match &outcome {
            QueueOutcome::Inserted(id) => {
                debug!(%id, %operation_type, entity_id, "Queued operation");
            }
            QueueOutcome::Coalesced(id) => {
                debug!(%id, %operation_type, entity_id, "Coalesced into queued operation");
            }
        }

        self.publish()?;
        self.signals.queued.notify_one();
        Ok(outcome)
    }

    /// Claim the next rows to push: the oldest pending row, or, if it
    /// carries a batch key, every pending row of its type sharing that key
    /// (oldest first, at most `limit`). Claimed rows are IN_PROGRESS when
    /// this returns, so a later edit to the same target queues a new row
    /// instead of folding into a payload that is already on the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the query or update fails.
    pub fn claim_next_batch(&self, limit: usize) -> Result<Vec<PendingOperation>, SyncError> {
        let now = now_millis();
        let batch = self.db.transaction(|tx| {
            let mut batch = next_batch(tx, limit)?;
            let ids: Vec<String> = batch.iter().map(|op| op.id.clone()).collect();
            set_in_progress(tx, &ids, now)?;
            for op in &mut batch {
                op.status = OperationStatus::InProgress;
                op.updated_at = millis_to_datetime(now);
            }
            Ok(batch)
        })?;

        if !batch.is_empty() {
            self.publish()?;
        }
        Ok(batch)
    }

    /// The rows [`claim_next_batch`](Self::claim_next_batch) would take,
    /// without claiming them. The result is a snapshot: a later edit may
    /// coalesce into any of these rows, so never execute from it.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_next_batch(&self, limit: usize) -> Result<Vec<PendingOperation>, SyncError> {
        next_batch(&self.db.connection(), limit)
    }

    /// Move pending rows to IN_PROGRESS. Rows in any other state are left
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn mark_in_progress(&self, ids: &[String]) -> Result<(), SyncError> {
        let now = now_millis();
        self.db.transaction(|tx| set_in_progress(tx, ids, now))?;
        self.publish()
    }

    /// Remove rows the server has acknowledged.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn mark_completed(&self, ids: &[String]) -> Result<(), SyncError> {
        self.db.transaction(|tx| delete_rows(tx, ids))?;
        self.publish()
    }

    /// Record a surfaced failure: the row stays, as FAILED, until the user
    /// retries or dismisses it.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<(), SyncError> {
        self.record_attempt(id, error, OperationStatus::Failed)
    }

    /// Record a transient failure: the row goes back to PENDING for the next
    /// flush.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn mark_retryable(&self, id: &str, error: &str) -> Result<(), SyncError> {
        self.record_attempt(id, error, OperationStatus::Pending)
    }

    fn record_attempt(&self, id: &str, error: &str, status: OperationStatus) -> Result<(), SyncError> {
        self.db
            .connection()
            .execute(
                r"UPDATE pending_operations SET
                      status = ?1,
                      attempt_count = attempt_count + 1,
                      last_error = ?2,
                      updated_at = ?3
                  WHERE id = ?4",
                params![status.as_str(), error, now_millis(), id],
            )
            .map_err(|e| SyncError::Database(format!("Failed to record attempt: {e}")))?;
        self.publish()
    }

    /// Put a failed row back in the queue with a fresh attempt budget.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such row exists and `InvalidState` if the row
    /// has not failed.
    pub fn retry(&self, id: &str) -> Result<(), SyncError> {
        self.db.transaction(|tx| {
            let op = find_by_id(tx, id)?;
            if op.status != OperationStatus::Failed {
                return Err(SyncError::InvalidState(format!(
                    "operation {id} is {}, only failed operations can be retried",
                    op.status.as_str()
                )));
            }
            tx.execute(
                r"UPDATE pending_operations SET
                      status = 'pending', attempt_count = 0, last_error = NULL, updated_at = ?1
                  WHERE id = ?2 AND status = 'failed'",
                params![now_millis(), id],
            )
            .map_err(|e| SyncError::Database(format!("Failed to retry operation: {e}")))?;
            Ok(())
        })?;

        info!(%id, "Operation queued for retry");
        self.publish()?;
        self.signals.queued.notify_one();
        Ok(())
    }

    /// Retry every failed row. Returns how many were reset.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn retry_all_failed(&self) -> Result<usize, SyncError> {
        let changed = self
            .db
            .connection()
            .execute(
                r"UPDATE pending_operations SET
                      status = 'pending', attempt_count = 0, last_error = NULL, updated_at = ?1
                  WHERE status = 'failed'",
                [now_millis()],
            )
            .map_err(|e| SyncError::Database(format!("Failed to retry operations: {e}")))?;
        self.publish()?;
        if changed > 0 {
            self.signals.queued.notify_one();
        }
        Ok(changed)
    }

    /// Discard a local change: delete the row and mark its entity unsynced so
    /// the next pull restores the server copy.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such row exists and `InvalidState` if the row
    /// is being pushed right now.
    pub fn dismiss(&self, id: &str) -> Result<PendingOperation, SyncError> {
        let dismissed = self.db.transaction(|tx| {
            let op = find_by_id(tx, id)?;
            if op.status == OperationStatus::InProgress {
                return Err(SyncError::InvalidState(format!(
                    "operation {id} is being pushed and cannot be dismissed"
                )));
            }

            delete_rows(tx, std::slice::from_ref(&op.id))?;

            let kind = op
                .entity_type
                .unwrap_or_else(|| op.operation_type.entity_kind());
            let entity_id = op.entity_id.as_deref().unwrap_or(SINGLETON_ID);
            cache_store::set_sync_state(tx, kind, entity_id, SyncState::NotSynced)?;
            Ok(op)
        })?;

        info!(%id, target = %dismissed.target(), "Dismissed local change");
        self.publish()?;
        Ok(dismissed)
    }

    /// Revert rows left IN_PROGRESS by a crash mid-flush. Run once at
    /// startup, before any flush.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn reset_stuck_operations(&self) -> Result<usize, SyncError> {
        let reset = self
            .db
            .connection()
            .execute(
                "UPDATE pending_operations SET status = 'pending', updated_at = ?1 WHERE status = 'in_progress'",
                [now_millis()],
            )
            .map_err(|e| SyncError::Database(format!("Failed to reset operations: {e}")))?;

        if reset > 0 {
            warn!(count = reset, "Recovered operations interrupted mid-flush");
        }
        self.publish()?;
        Ok(reset)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, id: &str) -> Result<Option<PendingOperation>, SyncError> {
        Ok(query_operations(&self.db.connection(), "WHERE id = ?1", [id])?
            .into_iter()
            .next())
    }

    /// Rows in queue order, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(
        &self,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<PendingOperation>, SyncError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.db.connection();
        match status {
            Some(status) => query_operations(
                &conn,
                "WHERE status = ?1 ORDER BY seq LIMIT ?2",
                params![status.as_str(), limit],
            ),
            None => query_operations(&conn, "ORDER BY seq LIMIT ?1", [limit]),
        }
    }

    /// Whether any row still references the entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn has_operations_for(&self, kind: EntityKind, entity_id: &str) -> Result<bool, SyncError> {
        has_operations_for(&self.db.connection(), kind, entity_id)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn stats(&self) -> Result<QueueStats, SyncError> {
        let conn = self.db.connection();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*), MIN(created_at) FROM pending_operations GROUP BY status")
            .map_err(|e| SyncError::Database(format!("Failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            })
            .map_err(|e| SyncError::Database(format!("Failed to query stats: {e}")))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count, oldest) = row.map_err(|e| SyncError::Database(e.to_string()))?;
            let count = usize::try_from(count).unwrap_or_default();
            match status.parse::<OperationStatus>() {
                Ok(OperationStatus::Pending) => {
                    stats.pending = count;
                    stats.oldest_pending = oldest.map(millis_to_datetime);
                }
                Ok(OperationStatus::InProgress) => stats.in_progress = count,
                Ok(OperationStatus::Failed) => stats.failed = count,
                Err(_) => {}
            }
        }
        Ok(stats)
    }

    /// Drop every queued row.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn clear(&self) -> Result<usize, SyncError> {
        let removed = self
            .db
            .connection()
            .execute("DELETE FROM pending_operations", [])
            .map_err(|e| SyncError::Database(format!("Failed to clear queue: {e}")))?;
        self.publish()?;
        Ok(removed)
    }

    /// Wait for the "new operation queued" signal. Signals raised while no one
    /// is waiting collapse into one.
    pub async fn queued(&self) {
        self.signals.queued.notified().await;
    }

    /// Count of rows not yet failed (pending or in flight).
    #[must_use]
    pub fn subscribe_pending_count(&self) -> watch::Receiver<usize> {
        self.signals.pending_count.subscribe()
    }

    #[must_use]
    pub fn subscribe_failed(&self) -> watch::Receiver<Vec<PendingOperation>> {
        self.signals.failed.subscribe()
    }

    /// The row currently on the wire, if any.
    #[must_use]
    pub fn subscribe_current(&self) -> watch::Receiver<Option<PendingOperation>> {
        self.signals.current.subscribe()
    }

    fn publish(&self) -> Result<(), SyncError> {
        let (pending, failed, current) = {
            let conn = self.db.connection();
            let pending: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM pending_operations WHERE status != 'failed'",
                    [],
                    |row| row.get(0),
                )
                .map_err(|e| SyncError::Database(format!("Failed to count operations: {e}")))?;
            let failed = query_operations(&conn, "WHERE status = 'failed' ORDER BY seq", [])?;
            let current = query_operations(
                &conn,
                "WHERE status = 'in_progress' ORDER BY seq LIMIT 1",
                [],
            )?
            .into_iter()
            .next();
            (usize::try_from(pending).unwrap_or_default(), failed, current)
        };

        self.signals.pending_count.send_replace(pending);
        self.signals.failed.send_replace(failed);
        self.signals.current.send_replace(current);
        Ok(())
    }
}

/// Whether any queued row references the entity. Global rows carry no
/// entity id and count for every entity of their kind.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn has_operations_for(
    conn: &Connection,
    kind: EntityKind,
    entity_id: &str,
) -> Result<bool, SyncError> {
    conn.query_row(
        r"SELECT 1 FROM pending_operations
          WHERE entity_type = ?1 AND (entity_id = ?2 OR entity_id IS NULL) LIMIT 1",
        params![kind.as_str(), entity_id],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|e| SyncError::Database(format!("Failed to check pending operations: {e}")))
}
