//! Configuration management for shelfsync.
//!
//! Handles loading and saving configuration from `~/.shelfsync/`.

mod paths;
mod settings;

pub use paths::Paths;
pub use settings::{Config, LoggingConfig, SyncSettings};
