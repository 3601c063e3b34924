//! Local entity cache.
//!
//! Books, series, contributors and the rest of the library are stored as
//! JSON documents keyed by `(kind, id)`, each tagged with a [`SyncState`].
//! Relationship edges and playback positions have their own tables.

mod model;
pub mod store;

pub use model::{EntityKind, LinkKind, LocalEntity, PlaybackPosition, SyncState, SINGLETON_ID};
pub use store::LocalCache;
