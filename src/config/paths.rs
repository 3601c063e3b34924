//! Path resolution for shelfsync data files.
//!
//! All data is stored in `~/.shelfsync/`:
//! - `config.yaml` - settings
//! - `shelfsync.db` - local cache and operation queue

use std::path::PathBuf;

use crate::error::SyncError;

/// Locations of the shelfsync data directory and its files.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Root directory: `~/.shelfsync/`
    pub root: PathBuf,
    /// Config file: `~/.shelfsync/config.yaml`
    pub config_file: PathBuf,
    /// Database file: `~/.shelfsync/shelfsync.db`
    pub database: PathBuf,
}

impl Paths {
    /// Resolve paths under the user's home directory.
    ///
    /// # Errors
    ///
    /// Returns an error if `HOME` is not set.
    pub fn new() -> Result<Self, SyncError> {
        let home = std::env::var("HOME")
            .map_err(|_| SyncError::Config("Could not determine home directory".to_string()))?;

        Ok(Self::with_root(PathBuf::from(home).join(".shelfsync")))
    }

    /// Resolve paths under a custom root.
    #[must_use]
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            config_file: root.join("config.yaml"),
            database: root.join("shelfsync.db"),
            root,
        }
    }

    /// Create the root directory if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn ensure_dirs(&self) -> Result<(), SyncError> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root).map_err(|e| {
                SyncError::Config(format!(
                    "Failed to create directory {}: {e}",
                    self.root.display()
                ))
            })?;
        }
        Ok(())
    }
}
