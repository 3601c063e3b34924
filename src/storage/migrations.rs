//! Database migrations for shelfsync.
//!
//! Each migration upgrades the schema by one version, tracked in
//! `PRAGMA user_version`. Migrations run when the database is opened.

use rusqlite::Connection;

use crate::error::SyncError;

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Read the schema version. A fresh database reports 0.
///
/// # Errors
///
/// Returns an error if the pragma cannot be read.
pub fn get_version(conn: &Connection) -> Result<i32, SyncError> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| SyncError::Database(format!("Failed to get schema version: {e}")))
}

fn set_version(conn: &Connection, version: i32) -> Result<(), SyncError> {
    conn.execute_batch(&format!("PRAGMA user_version = {version};"))
        .map_err(|e| SyncError::Database(format!("Failed to set schema version: {e}")))
}

/// Run all pending migrations.
///
/// # Errors
///
/// Returns an error if any migration fails.
pub fn run(conn: &Connection) -> Result<(), SyncError> {
    let current = get_version(conn)?;

    for version in (current + 1)..=CURRENT_VERSION {
        run_migration(conn, version)?;
        set_version(conn, version)?;
    }

    Ok(())
}

fn run_migration(conn: &Connection, version: i32) -> Result<(), SyncError> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        _ => Err(SyncError::Database(format!(
            "Unknown migration version: {version}"
        ))),
    }
}

/// Migration v1: initial schema.
///
/// - `pending_operations`: durable queue of local mutations. `seq` gives a
///   total insertion order; timestamps are unix milliseconds.
/// - `sync_cursors`: per entity kind pull watermark.
/// - `entities`: cached server entities as JSON documents.
/// - `entity_links`: relationship edges (book/contributor, shelf/book, ...).
/// - `playback_positions`: per book progress, including the device-local
///   playback speed the server never sees.
fn migrate_v1(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS pending_operations (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            operation_type TEXT NOT NULL,
            entity_type TEXT,
            entity_id TEXT,
            payload TEXT NOT NULL,
            batch_key TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_pending_operations_status
            ON pending_operations(status, seq);
        CREATE INDEX IF NOT EXISTS idx_pending_operations_target
            ON pending_operations(operation_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_pending_operations_batch
            ON pending_operations(batch_key, status);

        CREATE TABLE IF NOT EXISTS sync_cursors (
            entity_kind TEXT PRIMARY KEY,
            updated_after INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entities (
            entity_type TEXT NOT NULL,
            id TEXT NOT NULL,
            data TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            sync_state TEXT NOT NULL DEFAULT 'synced',
            PRIMARY KEY (entity_type, id)
        );

        CREATE INDEX IF NOT EXISTS idx_entities_sync_state
            ON entities(entity_type, sync_state);

        CREATE TABLE IF NOT EXISTS entity_links (
            link_kind TEXT NOT NULL,
            from_id TEXT NOT NULL,
            to_id TEXT NOT NULL,
            PRIMARY KEY (link_kind, from_id, to_id)
        );

        CREATE INDEX IF NOT EXISTS idx_entity_links_to
            ON entity_links(link_kind, to_id);

        CREATE TABLE IF NOT EXISTS playback_positions (
            book_id TEXT PRIMARY KEY,
            position_ms INTEGER NOT NULL,
            last_played_at INTEGER NOT NULL,
            playback_speed REAL,
            updated_at INTEGER NOT NULL,
            sync_state TEXT NOT NULL DEFAULT 'synced'
        );
        ",
    )
    .map_err(|e| SyncError::Database(format!("Migration v1 failed: {e}")))
}

/// Migration v2: pull cursors also record the id of the last change seen,
/// so changes sharing a timestamp can be split across pages.
///
/// Existing cursors get an empty id, which sorts before every real id, so
/// the first pull after upgrading re-reads the boundary timestamp once.
fn migrate_v2(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "ALTER TABLE sync_cursors ADD COLUMN after_id TEXT NOT NULL DEFAULT '';",
    )
    .map_err(|e| SyncError::Database(format!("Migration v2 failed: {e}")))
}
