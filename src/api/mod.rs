//! Server API surface consumed by the sync engine.
//!
//! The engine talks to the server only through [`ServerApi`]. Transport,
//! authentication, and endpoint layout belong to the implementation.
//! [`MemoryServer`] is an in-process implementation used by tests and the
//! replay tooling.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::cache::{EntityKind, LinkKind};

pub use memory::{ApiCall, MemoryServer};

/// Failure reported by a [`ServerApi`] call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// No response (timeout, DNS, connection reset).
    #[error("network unavailable: {0}")]
    Network(String),

    /// The server answered with a transient error status.
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    /// The server refused the request permanently.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The target no longer exists on the server.
    #[error("not found: {0}")]
    NotFound(String),
}

impl ApiError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Server { .. })
    }
}

/// One entity as the server sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    /// Server modification time, unix milliseconds.
    pub updated_at: i64,
    pub data: Value,
}

/// A server-side deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: String,
    pub deleted_at: i64,
}

/// One page of a delta fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangePage {
    pub records: Vec<RemoteRecord>,
    pub deleted: Vec<Tombstone>,
    pub has_more: bool,
}

/// Position in one kind's change feed. Changes are ordered by
/// `(updated_at, id)`, so records sharing a timestamp still have a strict
/// order and a page boundary can fall between them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeCursor {
    pub updated_at: i64,
    pub id: String,
}

impl ChangeCursor {
    #[must_use]
    pub fn new(updated_at: i64, id: impl Into<String>) -> Self {
        Self {
            updated_at,
            id: id.into(),
        }
    }
}

impl ChangePage {
    /// Last change on the page in feed order.
    #[must_use]
    pub fn high_water_mark(&self) -> Option<ChangeCursor> {
        self.records
            .iter()
            .map(|r| (r.updated_at, &r.id))
            .chain(self.deleted.iter().map(|t| (t.deleted_at, &t.id)))
            .max()
            .map(|(updated_at, id)| ChangeCursor::new(updated_at, id.as_str()))
    }
}

/// A listening interval recorded on this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListeningEvent {
    pub book_id: String,
    pub started_at: i64,
    pub ended_at: i64,
    pub start_position_ms: i64,
    pub end_position_ms: i64,
}

/// A listening event tagged with the client id the server echoes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListeningSubmission {
    pub client_id: String,
    pub event: ListeningEvent,
}

/// Result of a batch submission: per-item rejections keyed by client id.
/// Items not listed were accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAck {
    pub rejected: HashMap<String, String>,
}

/// Progress as sent to the server. Playback speed is device-local and has no
/// field here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub position_ms: i64,
    pub last_played_at: i64,
}

/// Server operations used by push, pull, and repair.
#[async_trait]
pub trait ServerApi: Send + Sync {
    async fn update_metadata(
        &self,
        kind: EntityKind,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), ApiError>;

    async fn merge_contributors(&self, source_id: &str, target_id: &str) -> Result<(), ApiError>;

    async fn unmerge_contributor(&self, contributor_id: &str) -> Result<(), ApiError>;

    /// Replace the full set of `link` targets for `owner_id`.
    async fn set_relationships(
        &self,
        link: LinkKind,
        owner_id: &str,
        target_ids: &[String],
    ) -> Result<(), ApiError>;

    async fn submit_listening_events(
        &self,
        events: &[ListeningSubmission],
    ) -> Result<BatchAck, ApiError>;

    async fn update_playback_position(
        &self,
        book_id: &str,
        update: &PositionUpdate,
    ) -> Result<(), ApiError>;

    async fn update_preferences(&self, fields: &Map<String, Value>) -> Result<(), ApiError>;

    async fn update_profile(&self, fields: &Map<String, Value>) -> Result<(), ApiError>;

    /// Changes to `kind` strictly after `after` in `(updated_at, id)`
    /// order, oldest first. `None` starts from the beginning.
    async fn fetch_changes(
        &self,
        kind: EntityKind,
        after: Option<&ChangeCursor>,
        limit: usize,
    ) -> Result<ChangePage, ApiError>;

    /// Current server copy of one entity, `None` if it no longer exists.
    async fn fetch_entity(&self, kind: EntityKind, id: &str)
        -> Result<Option<RemoteRecord>, ApiError>;

    /// Every live playback session.
    async fn fetch_active_sessions(&self) -> Result<Vec<RemoteRecord>, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retryable_classification() {
        assert!(ApiError::Network("reset".into()).is_retryable());
        assert!(ApiError::Server {
            status: 502,
            message: "bad gateway".into()
        }
        .is_retryable());
        assert!(!ApiError::Rejected("invalid".into()).is_retryable());
        assert!(!ApiError::NotFound("b1".into()).is_retryable());
    }

    #[test]
    fn test_high_water_mark_includes_tombstones() {
        let page = ChangePage {
            records: vec![RemoteRecord {
                id: "a".into(),
                updated_at: 10,
                data: json!({}),
            }],
            deleted: vec![Tombstone {
                id: "b".into(),
                deleted_at: 25,
            }],
            has_more: false,
        };
        assert_eq!(page.high_water_mark(), Some(ChangeCursor::new(25, "b")));
        assert_eq!(ChangePage::default().high_water_mark(), None);
    }

    #[test]
    fn test_high_water_mark_breaks_ties_by_id() {
        let record = |id: &str| RemoteRecord {
            id: id.into(),
            updated_at: 10,
            data: json!({}),
        };
        let page = ChangePage {
            records: vec![record("b2"), record("b1")],
            deleted: vec![Tombstone {
                id: "a9".into(),
                deleted_at: 10,
            }],
            has_more: true,
        };
        assert_eq!(page.high_water_mark(), Some(ChangeCursor::new(10, "b2")));
        assert!(ChangeCursor::new(10, "b2") < ChangeCursor::new(10, "b3"));
        assert!(ChangeCursor::new(10, "z") < ChangeCursor::new(11, "a"));
    }
}
