use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::sync::OperationStatus;

#[derive(Parser)]
#[command(name = "shelfsync")]
#[command(about = "Inspect and repair the shelfsync offline queue and local cache")]
#[command(long_about = "shelfsync - operator tool for the offline-first library cache

Reads the local SQLite database that holds the cached library, the queue of
local changes waiting to be pushed, and the per-kind pull cursors.

QUICK START:
  shelfsync status                  Queue counts and oldest pending change
  shelfsync list --status failed    Changes the server refused
  shelfsync retry --all-failed      Put every failed change back in the queue
  shelfsync replay events.jsonl     Apply recorded realtime events

OUTPUT FORMATS:
  --output pretty    Human-readable colored output (default)
  --output json      Machine-readable JSON for scripting

DATABASE:
  Defaults to ~/.shelfsync/shelfsync.db; override with --db.")]
#[command(version, propagate_version = true)]
pub struct Cli {
    /// Output format for command results
    ///
    /// Use 'pretty' for human-readable colored output (default),
    /// or 'json' for machine-readable output suitable for scripting.
    #[arg(short, long, value_enum, default_value = "pretty", global = true)]
    pub output: OutputFormat,

    /// Path to the database file
    #[arg(long, global = true, env = "SHELFSYNC_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for command results.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable colored output.
    #[default]
    Pretty,
    /// Machine-readable JSON output.
    Json,
}

/// Status filter accepted by `list`.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusFilter {
    Pending,
    InProgress,
    Failed,
}

impl From<StatusFilter> for OperationStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => Self::Pending,
            StatusFilter::InProgress => Self::InProgress,
            StatusFilter::Failed => Self::Failed,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show queue status
    ///
    /// Pending, in-progress and failed counts, the age of the oldest pending
    /// change, and how many cached entities are waiting to sync.
    ///
    /// # Examples
    ///
    ///   shelfsync status
    ///   shelfsync status -o json
    #[command(alias = "st")]
    Status,

    /// List queued operations
    ///
    /// Operations are shown in the order they will be pushed.
    ///
    /// # Examples
    ///
    ///   shelfsync list
    ///   shelfsync list --status failed
    ///   shelfsync list -n 5 -o json
    #[command(alias = "ls")]
    List {
        /// Only show operations with this status
        #[arg(long, short = 's', value_enum)]
        status: Option<StatusFilter>,

        /// Maximum operations to show
        #[arg(long, short = 'n', default_value = "20")]
        limit: usize,
    },

    /// Return failed operations to the queue
    ///
    /// The attempt counter is reset so the operation gets a fresh set of
    /// retries on the next flush.
    ///
    /// # Examples
    ///
    ///   shelfsync retry 5f1c...
    ///   shelfsync retry --all-failed
    Retry {
        /// Operation id
        #[arg(required_unless_present = "all_failed", conflicts_with = "all_failed")]
        id: Option<String>,

        /// Retry every failed operation
        #[arg(long)]
        all_failed: bool,
    },

    /// Discard a queued local change
    ///
    /// The operation is deleted and its entity is marked unsynced, so the
    /// next pull restores the server's copy.
    Dismiss {
        /// Operation id
        id: String,
    },

    /// Reset operations stuck in progress
    ///
    /// A flush interrupted by a crash leaves rows marked in progress; this
    /// puts them back in the queue. The engine also does this on start.
    Recover,

    /// Show or reset pull cursors
    ///
    /// Each entity kind remembers the newest server change it has seen.
    /// Resetting forces the next pull to fetch everything.
    Cursors {
        /// Forget all cursors
        #[arg(long)]
        reset: bool,
    },

    /// Apply realtime events from a file
    ///
    /// Reads one JSON event per line and applies each through the same path
    /// as live events. Blank lines are skipped; bad lines are counted and
    /// skipped.
    ///
    /// # Examples
    ///
    ///   shelfsync replay captured.jsonl
    Replay {
        /// JSON lines file of events
        file: PathBuf,
    },

    /// Generate shell completions
    ///
    /// Example: shelfsync completions bash > ~/.bash_completion.d/shelfsync
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}
