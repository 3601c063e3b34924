//! Reconciling server data with the local cache.
//!
//! The rule is asymmetric last-write-wins. An entity with no queued local
//! change always takes the server copy. An entity with a queued change keeps
//! its local copy unless the server's modification time is strictly newer.
//! Either way, fields the server does not carry (device-local state such as
//! playback speed) survive.

use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::debug;

use super::queue;
use crate::api::RemoteRecord;
use crate::cache::store;
use crate::cache::{EntityKind, LocalEntity, PlaybackPosition, SyncState};
use crate::error::SyncError;
use crate::storage::now_millis;

/// Outcome of comparing a local copy against a server copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    ApplyRemote,
    KeepLocal,
}

/// What reconciling one record did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Added,
    Updated,
    /// Local copy kept because it carries a newer unpushed edit.
    KeptLocal,
}

/// Conflict rules, free of any storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    /// Decide between local and server copies.
    ///
    /// `pending_local_edit` is the local modification time when a queued
    /// change exists for the entity, `None` otherwise.
    #[must_use]
    pub const fn resolve(pending_local_edit: Option<i64>, remote_updated_at: i64) -> Resolution {
        match pending_local_edit {
            Some(local) if remote_updated_at <= local => Resolution::KeepLocal,
            _ => Resolution::ApplyRemote,
        }
    }

    /// Whether incoming progress should replace local progress. Only a
    /// strictly later `last_played_at` wins; ties keep what is stored.
    #[must_use]
    pub const fn remote_progress_wins(local_last_played: i64, remote_last_played: i64) -> bool {
        remote_last_played > local_last_played
    }

    /// Lay `remote` over `local`. Keys the server sent replace local ones;
    /// keys only present locally are kept.
    #[must_use]
    pub fn overlay(local: &Value, remote: &Value) -> Value {
        match (local, remote) {
            (Value::Object(local), Value::Object(remote)) => {
                let mut merged: Map<String, Value> = local.clone();
                for (key, value) in remote {
                    merged.insert(key.clone(), value.clone());
                }
                Value::Object(merged)
            }
            _ => remote.clone(),
        }
    }
}

/// Progress fields carried by a server position record.
fn position_fields(record: &RemoteRecord) -> Result<(i64, i64), SyncError> {
    let field = |name: &str| {
        record.data.get(name).and_then(Value::as_i64).ok_or_else(|| {
            SyncError::Payload(format!(
                "playback position {} is missing {name}",
                record.id
            ))
        })
    };
    Ok((field("position_ms")?, field("last_played_at")?))
}

/// Apply one server record to the cache, honouring queued local edits.
///
/// # Errors
///
/// Returns an error if the cache cannot be read or written, or if a
/// playback position record lacks its progress fields.
pub fn reconcile_record(
    conn: &Connection,
    kind: EntityKind,
    record: &RemoteRecord,
) -> Result<ApplyOutcome, SyncError> {
    if kind == EntityKind::PlaybackPosition {
        return reconcile_position(conn, record);
    }

    let Some(local) = store::get_entity(conn, kind, &record.id)? else {
        store::put_entity(
            conn,
            &LocalEntity::synced(kind, record.id.clone(), record.data.clone(), record.updated_at),
        )?;
        return Ok(ApplyOutcome::Added);
    };

    let pending = queue::has_operations_for(conn, kind, &record.id)?;
    let pending_edit = pending.then_some(local.updated_at);

    match ConflictDetector::resolve(pending_edit, record.updated_at) {
        Resolution::KeepLocal => {
            debug!(%kind, id = %record.id, "Kept local edit over older server copy");
            Ok(ApplyOutcome::KeptLocal)
        }
        Resolution::ApplyRemote => {
            let sync_state = if pending {
                SyncState::NotSynced
            } else {
                SyncState::Synced
            };
            store::put_entity(
                conn,
                &LocalEntity {
                    kind,
                    id: local.id,
                    data: ConflictDetector::overlay(&local.data, &record.data),
                    updated_at: record.updated_at,
                    sync_state,
                },
            )?;
            Ok(ApplyOutcome::Updated)
        }
    }
}

/// Positions compare by `last_played_at` when a local report is queued.
/// Playback speed never comes from the server.
fn reconcile_position(conn: &Connection, record: &RemoteRecord) -> Result<ApplyOutcome, SyncError> {
    let (position_ms, last_played_at) = position_fields(record)?;
    let local = store::get_position(conn, &record.id)?;
    let pending = queue::has_operations_for(conn, EntityKind::PlaybackPosition, &record.id)?;

    if let Some(local) = &local {
        if pending && !ConflictDetector::remote_progress_wins(local.last_played_at, last_played_at)
        {
            debug!(book_id = %record.id, "Kept local progress over older server copy");
            return Ok(ApplyOutcome::KeptLocal);
        }
    }

    store::put_position(
        conn,
        &PlaybackPosition {
            book_id: record.id.clone(),
            position_ms,
            last_played_at,
            playback_speed: local.as_ref().and_then(|p| p.playback_speed),
            updated_at: record.updated_at,
            sync_state: if pending {
                SyncState::NotSynced
            } else {
                SyncState::Synced
            },
        },
    )?;

    Ok(if local.is_some() {
        ApplyOutcome::Updated
    } else {
        ApplyOutcome::Added
    })
}

/// Apply pushed progress from another device. Returns whether it was
/// stored; stale or equal progress is ignored.
///
/// # Errors
///
/// Returns an error if the cache cannot be read or written.
pub fn apply_remote_progress(
    conn: &Connection,
    book_id: &str,
    position_ms: i64,
    last_played_at: i64,
) -> Result<bool, SyncError> {
    let local = store::get_position(conn, book_id)?;
    if let Some(local) = &local {
        if !ConflictDetector::remote_progress_wins(local.last_played_at, last_played_at) {
            return Ok(false);
        }
    }

    let pending = queue::has_operations_for(conn, EntityKind::PlaybackPosition, book_id)?;
    store::put_position(
        conn,
        &PlaybackPosition {
            book_id: book_id.to_string(),
            position_ms,
            last_played_at,
            playback_speed: local.and_then(|p| p.playback_speed),
            updated_at: now_millis(),
            sync_state: if pending {
                SyncState::NotSynced
            } else {
                SyncState::Synced
            },
        },
    )?;
    Ok(true)
}

/// Apply a server-side deletion. Returns whether anything was removed.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn apply_remote_delete(conn: &Connection, kind: EntityKind, id: &str) -> Result<bool, SyncError> {
    if kind == EntityKind::PlaybackPosition {
        store::delete_position(conn, id)
    } else {
        store::delete_entity(conn, kind, id)
    }
}
