//! shelfsync - offline-first sync engine for an audiobook library cache
//!
//! Local edits are written to a SQLite cache and queued; the queue is pushed
//! to the server when online, server changes are pulled by delta, and
//! realtime events are applied as they arrive.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod network;
pub mod output;
pub mod storage;
pub mod sync;

pub use cli::args::{Cli, Commands, OutputFormat};
pub use error::SyncError;
pub use sync::SyncEngine;
