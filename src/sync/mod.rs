//! Offline-first synchronization.
//!
//! Local writes are queued as [`PendingOperation`]s and pushed in order;
//! server state is pulled by delta per entity kind; realtime events are
//! applied as they arrive. All three paths share one [`SyncCoordinator`]
//! lock.

pub mod conflict;
pub mod coordinator;
pub mod engine;
pub mod executor;
pub mod handler;
pub mod handlers;
pub mod operation;
pub mod pull;
pub mod push;
pub mod queue;
pub mod realtime;

pub use conflict::{ApplyOutcome, ConflictDetector, Resolution};
pub use coordinator::{Disposition, LockHolder, RetryPolicy, SyncCoordinator};
pub use engine::{EngineHandle, SyncEngine};
pub use executor::OperationExecutor;
pub use handler::{BatchResults, HandlerRegistry, OperationHandler};
pub use operation::{OperationStatus, OperationType, PendingOperation};
pub use pull::{format_pull_report, PullOrchestrator, PullPhase, PullProgress, PullReport};
pub use push::{format_push_report, PushOrchestrator, PushReport, PushStop};
pub use queue::{OperationStore, QueueOutcome, QueueStats};
pub use realtime::{
    FrameOutcome, MediaUsage, NoMediaUsage, RealtimeApplier, RealtimeEvent, SyncNotice,
    TransportFrame,
};
