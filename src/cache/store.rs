//! Reads and writes against the cache tables.
//!
//! The free functions take a plain `&Connection` so they can run either on
//! the shared connection or inside a `Transaction` (which derefs to one).
//! `LocalCache` wraps them for callers that hold a `Database`.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};

use super::model::{EntityKind, LinkKind, LocalEntity, PlaybackPosition, SyncState};
use crate::error::SyncError;
use crate::storage::{now_millis, Database};

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> SyncError + '_ {
    move |e| SyncError::Database(format!("{context}: {e}"))
}

fn row_to_entity(row: &Row<'_>) -> rusqlite::Result<(String, String, String, i64, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn decode_entity(
    (kind, id, data, updated_at, state): (String, String, String, i64, String),
) -> Result<LocalEntity, SyncError> {
    Ok(LocalEntity {
        kind: kind.parse()?,
        id,
        data: serde_json::from_str(&data)?,
        updated_at,
        sync_state: SyncState::from_db(&state),
    })
}

/// Fetch one cached entity.
///
/// # Errors
///
/// Returns an error if the query fails or the stored document is invalid.
pub fn get_entity(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
) -> Result<Option<LocalEntity>, SyncError> {
    let raw = conn
        .query_row(
            r"SELECT entity_type, id, data, updated_at, sync_state
              FROM entities WHERE entity_type = ?1 AND id = ?2",
            params![kind.as_str(), id],
            row_to_entity,
        )
        .optional()
        .map_err(db_err("Failed to load entity"))?;

    raw.map(decode_entity).transpose()
}

/// Insert or replace a cached entity.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn put_entity(conn: &Connection, entity: &LocalEntity) -> Result<(), SyncError> {
    conn.execute(
        r"INSERT INTO entities (entity_type, id, data, updated_at, sync_state)
          VALUES (?1, ?2, ?3, ?4, ?5)
          ON CONFLICT(entity_type, id) DO UPDATE SET
              data = excluded.data,
              updated_at = excluded.updated_at,
              sync_state = excluded.sync_state",
        params![
            entity.kind.as_str(),
            entity.id,
            serde_json::to_string(&entity.data)?,
            entity.updated_at,
            entity.sync_state.as_str(),
        ],
    )
    .map_err(db_err("Failed to store entity"))?;
    Ok(())
}

/// Delete an entity and every link touching it. Returns whether it existed.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn delete_entity(conn: &Connection, kind: EntityKind, id: &str) -> Result<bool, SyncError> {
    let removed = conn
        .execute(
            "DELETE FROM entities WHERE entity_type = ?1 AND id = ?2",
            params![kind.as_str(), id],
        )
        .map_err(db_err("Failed to delete entity"))?;

    for link in LinkKind::ALL {
        let (from, to) = link.endpoints();
        if from == kind {
            conn.execute(
                "DELETE FROM entity_links WHERE link_kind = ?1 AND from_id = ?2",
                params![link.as_str(), id],
            )
            .map_err(db_err("Failed to delete links"))?;
        }
        if to == kind {
            conn.execute(
                "DELETE FROM entity_links WHERE link_kind = ?1 AND to_id = ?2",
                params![link.as_str(), id],
            )
            .map_err(db_err("Failed to delete links"))?;
        }
    }

    if kind == EntityKind::Book {
        delete_position(conn, id)?;
    }

    Ok(removed > 0)
}

/// Set the sync state of an entity, if it is cached.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn set_sync_state(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
    state: SyncState,
) -> Result<(), SyncError> {
    let result = if kind == EntityKind::PlaybackPosition {
        conn.execute(
            "UPDATE playback_positions SET sync_state = ?1 WHERE book_id = ?2",
            params![state.as_str(), id],
        )
    } else {
        conn.execute(
            "UPDATE entities SET sync_state = ?1 WHERE entity_type = ?2 AND id = ?3",
            params![state.as_str(), kind.as_str(), id],
        )
    };
    result.map_err(db_err("Failed to update sync state"))?;
    Ok(())
}

/// All cached entities of one kind, ordered by id.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_entities(conn: &Connection, kind: EntityKind) -> Result<Vec<LocalEntity>, SyncError> {
    let mut stmt = conn
        .prepare(
            r"SELECT entity_type, id, data, updated_at, sync_state
              FROM entities WHERE entity_type = ?1 ORDER BY id",
        )
        .map_err(db_err("Failed to prepare query"))?;

    let rows = stmt
        .query_map([kind.as_str()], row_to_entity)
        .map_err(db_err("Failed to list entities"))?;

    let mut entities = Vec::new();
    for row in rows {
        entities.push(decode_entity(row.map_err(db_err("Failed to read row"))?)?);
    }
    Ok(entities)
}

/// Ids of entities of one kind that are not synced.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn unsynced_ids(conn: &Connection, kind: EntityKind) -> Result<Vec<String>, SyncError> {
    let (sql, filter) = if kind == EntityKind::PlaybackPosition {
        (
            r"SELECT book_id FROM playback_positions
              WHERE sync_state != 'synced' AND ?1 IS NOT NULL ORDER BY book_id",
            "",
        )
    } else {
        (
            r"SELECT id FROM entities
              WHERE entity_type = ?1 AND sync_state != 'synced' ORDER BY id",
            kind.as_str(),
        )
    };
    let mut stmt = conn.prepare(sql).map_err(db_err("Failed to prepare query"))?;
    let rows = stmt
        .query_map([filter], |row| row.get(0))
        .map_err(db_err("Failed to list unsynced entities"))?;

    rows.collect::<rusqlite::Result<Vec<String>>>()
        .map_err(db_err("Failed to read row"))
}

/// Replace every entity of `kind` with `records`.
///
/// # Errors
///
/// Returns an error if any write fails.
pub fn replace_all(
    conn: &Connection,
    kind: EntityKind,
    records: &[LocalEntity],
) -> Result<(), SyncError> {
    conn.execute(
        "DELETE FROM entities WHERE entity_type = ?1",
        [kind.as_str()],
    )
    .map_err(db_err("Failed to clear entities"))?;

    for record in records {
        put_entity(conn, record)?;
    }
    Ok(())
}

/// Replace the full set of `link` edges leaving `from_id`.
///
/// # Errors
///
/// Returns an error if any write fails.
pub fn set_links(
    conn: &Connection,
    link: LinkKind,
    from_id: &str,
    to_ids: &[String],
) -> Result<(), SyncError> {
    conn.execute(
        "DELETE FROM entity_links WHERE link_kind = ?1 AND from_id = ?2",
        params![link.as_str(), from_id],
    )
    .map_err(db_err("Failed to clear links"))?;

    for to_id in to_ids {
        add_link(conn, link, from_id, to_id)?;
    }
    Ok(())
}

/// Add one edge. Adding an existing edge is a no-op.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn add_link(conn: &Connection, link: LinkKind, from_id: &str, to_id: &str) -> Result<(), SyncError> {
    conn.execute(
        "INSERT OR IGNORE INTO entity_links (link_kind, from_id, to_id) VALUES (?1, ?2, ?3)",
        params![link.as_str(), from_id, to_id],
    )
    .map_err(db_err("Failed to add link"))?;
    Ok(())
}

/// Remove one edge. Returns whether it existed.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn remove_link(
    conn: &Connection,
    link: LinkKind,
    from_id: &str,
    to_id: &str,
) -> Result<bool, SyncError> {
    let removed = conn
        .execute(
            "DELETE FROM entity_links WHERE link_kind = ?1 AND from_id = ?2 AND to_id = ?3",
            params![link.as_str(), from_id, to_id],
        )
        .map_err(db_err("Failed to remove link"))?;
    Ok(removed > 0)
}

/// Targets of `link` edges leaving `from_id`, sorted.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn links_from(conn: &Connection, link: LinkKind, from_id: &str) -> Result<Vec<String>, SyncError> {
    let mut stmt = conn
        .prepare(
            "SELECT to_id FROM entity_links WHERE link_kind = ?1 AND from_id = ?2 ORDER BY to_id",
        )
        .map_err(db_err("Failed to prepare query"))?;
    let rows = stmt
        .query_map(params![link.as_str(), from_id], |row| row.get(0))
        .map_err(db_err("Failed to list links"))?;
    rows.collect::<rusqlite::Result<Vec<String>>>()
        .map_err(db_err("Failed to read row"))
}

/// Load the playback position for a book.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_position(conn: &Connection, book_id: &str) -> Result<Option<PlaybackPosition>, SyncError> {
    conn.query_row(
        r"SELECT book_id, position_ms, last_played_at, playback_speed, updated_at, sync_state
          FROM playback_positions WHERE book_id = ?1",
        [book_id],
        |row| {
            Ok(PlaybackPosition {
                book_id: row.get(0)?,
                position_ms: row.get(1)?,
                last_played_at: row.get(2)?,
                playback_speed: row.get(3)?,
                updated_at: row.get(4)?,
                sync_state: SyncState::from_db(&row.get::<_, String>(5)?),
            })
        },
    )
    .optional()
    .map_err(db_err("Failed to load playback position"))
}

/// Insert or replace a playback position.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn put_position(conn: &Connection, position: &PlaybackPosition) -> Result<(), SyncError> {
    conn.execute(
        r"INSERT INTO playback_positions
              (book_id, position_ms, last_played_at, playback_speed, updated_at, sync_state)
          VALUES (?1, ?2, ?3, ?4, ?5, ?6)
          ON CONFLICT(book_id) DO UPDATE SET
              position_ms = excluded.position_ms,
              last_played_at = excluded.last_played_at,
              playback_speed = excluded.playback_speed,
              updated_at = excluded.updated_at,
              sync_state = excluded.sync_state",
        params![
            position.book_id,
            position.position_ms,
            position.last_played_at,
            position.playback_speed,
            position.updated_at,
            position.sync_state.as_str(),
        ],
    )
    .map_err(db_err("Failed to store playback position"))?;
    Ok(())
}

/// Delete a playback position. Returns whether it existed.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn delete_position(conn: &Connection, book_id: &str) -> Result<bool, SyncError> {
    let removed = conn
        .execute("DELETE FROM playback_positions WHERE book_id = ?1", [book_id])
        .map_err(db_err("Failed to delete playback position"))?;
    Ok(removed > 0)
}

/// Drop every cached entity, link, position, and cursor.
///
/// # Errors
///
/// Returns an error if any delete fails.
pub fn clear_all(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        r"
        DELETE FROM entities;
        DELETE FROM entity_links;
        DELETE FROM playback_positions;
        DELETE FROM sync_cursors;
        ",
    )
    .map_err(db_err("Failed to clear cache"))
}

/// Shallow-merge `patch` into `target`. A non-object target is replaced by
/// an empty object first; `null` values in the patch are stored as `null`.
pub fn merge_object(target: &mut Value, patch: &Map<String, Value>) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            map.insert(key.clone(), value.clone());
        }
    }
}

/// Merge `patch` into the cached document (creating it if absent), stamp it
/// with the current time and mark it unsynced.
///
/// # Errors
///
/// Returns an error if the read or write fails.
pub fn apply_local_edit(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
    patch: &Map<String, Value>,
) -> Result<LocalEntity, SyncError> {
    let mut entity = get_entity(conn, kind, id)?.unwrap_or_else(|| LocalEntity {
        kind,
        id: id.to_string(),
        data: Value::Object(Map::new()),
        updated_at: 0,
        sync_state: SyncState::NotSynced,
    });
    merge_object(&mut entity.data, patch);
    entity.updated_at = now_millis();
    entity.sync_state = SyncState::NotSynced;
    put_entity(conn, &entity)?;
    Ok(entity)
}

/// Record local playback progress. The speed, when given, replaces the
/// stored device-local speed; otherwise the existing one is kept.
///
/// # Errors
///
/// Returns an error if the read or write fails.
pub fn apply_local_position(
    conn: &Connection,
    book_id: &str,
    position_ms: i64,
    last_played_at: i64,
    playback_speed: Option<f64>,
) -> Result<PlaybackPosition, SyncError> {
    let existing_speed = get_position(conn, book_id)?.and_then(|p| p.playback_speed);
    let position = PlaybackPosition {
        book_id: book_id.to_string(),
        position_ms,
        last_played_at,
        playback_speed: playback_speed.or(existing_speed),
        updated_at: now_millis(),
        sync_state: SyncState::NotSynced,
    };
    put_position(conn, &position)?;
    Ok(position)
}

/// Handle to the local cache.
#[derive(Debug, Clone)]
pub struct LocalCache {
    db: Database,
}

impl LocalCache {
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// The database this cache reads and writes.
    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, kind: EntityKind, id: &str) -> Result<Option<LocalEntity>, SyncError> {
        get_entity(&self.db.connection(), kind, id)
    }

    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put(&self, entity: &LocalEntity) -> Result<(), SyncError> {
        put_entity(&self.db.connection(), entity)
    }

    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete(&self, kind: EntityKind, id: &str) -> Result<bool, SyncError> {
        self.db.transaction(|tx| delete_entity(tx, kind, id))
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self, kind: EntityKind) -> Result<Vec<LocalEntity>, SyncError> {
        list_entities(&self.db.connection(), kind)
    }

    /// Apply a local edit outside of any queue write.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or write fails.
    pub fn apply_local_edit(
        &self,
        kind: EntityKind,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<LocalEntity, SyncError> {
        self.db.transaction(|tx| apply_local_edit(tx, kind, id, patch))
    }

    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn set_sync_state(&self, kind: EntityKind, id: &str, state: SyncState) -> Result<(), SyncError> {
        set_sync_state(&self.db.connection(), kind, id, state)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn unsynced_ids(&self, kind: EntityKind) -> Result<Vec<String>, SyncError> {
        unsynced_ids(&self.db.connection(), kind)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn links_from(&self, link: LinkKind, from_id: &str) -> Result<Vec<String>, SyncError> {
        links_from(&self.db.connection(), link, from_id)
    }

    /// # Errors
    ///
    /// Returns an error if any write fails.
    pub fn set_links(&self, link: LinkKind, from_id: &str, to_ids: &[String]) -> Result<(), SyncError> {
        self.db.transaction(|tx| set_links(tx, link, from_id, to_ids))
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn position(&self, book_id: &str) -> Result<Option<PlaybackPosition>, SyncError> {
        get_position(&self.db.connection(), book_id)
    }

    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put_position(&self, position: &PlaybackPosition) -> Result<(), SyncError> {
        put_position(&self.db.connection(), position)
    }

    /// # Errors
    ///
    /// Returns an error if the read or write fails.
    pub fn apply_local_position(
        &self,
        book_id: &str,
        position_ms: i64,
        last_played_at: i64,
        playback_speed: Option<f64>,
    ) -> Result<PlaybackPosition, SyncError> {
        self.db.transaction(|tx| {
            apply_local_position(tx, book_id, position_ms, last_played_at, playback_speed)
        })
    }

    /// # Errors
    ///
    /// Returns an error if any delete fails.
    pub fn clear_all(&self) -> Result<(), SyncError> {
        clear_all(&self.db.connection())
    }
}
