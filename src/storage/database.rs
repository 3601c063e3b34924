//! `SQLite` database connection.
//!
//! The database is stored at `~/.shelfsync/shelfsync.db` and holds the local
//! entity cache, relationship links, playback positions, pull cursors, and
//! the pending operation queue.
//!
//! One connection is shared by every component. The handle is cheap to
//! clone; the connection itself sits behind a mutex, and guards must never be
//! held across an `.await`.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, Transaction};

use crate::config::Paths;
use crate::error::SyncError;

use super::migrations;

/// Shared database handle.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open the database at the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open() -> Result<Self, SyncError> {
        let paths = Paths::new()?;
        paths.ensure_dirs()?;
        Self::open_at(&paths.database)
    }

    /// Open the database at a specific path, creating it if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open_at(path: &Path) -> Result<Self, SyncError> {
        let conn = Connection::open(path).map_err(|e| {
            SyncError::Database(format!("Failed to open database {}: {e}", path.display()))
        })?;
        Self::init(conn)
    }

    /// Open an in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            SyncError::Database(format!("Failed to open in-memory database: {e}"))
        })?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, SyncError> {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .map_err(|e| SyncError::Database(format!("Failed to configure connection: {e}")))?;

        migrations::run(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Get the current schema version.
    ///
    /// # Errors
    ///
    /// Returns an error if the version cannot be read.
    pub fn schema_version(&self) -> Result<i32, SyncError> {
        migrations::get_version(&self.connection())
    }

    /// Lock the connection.
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Run `f` inside a transaction, committing if it returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or a database error if the transaction
    /// cannot be started or committed. On error nothing is committed.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| SyncError::Database(format!("Failed to begin transaction: {e}")))?;
        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| SyncError::Database(format!("Failed to commit transaction: {e}")))?;
        Ok(value)
    }
}
