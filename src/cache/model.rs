//! Cached entity types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// Id of the single cached preferences and profile documents.
pub const SINGLETON_ID: &str = "me";

/// Kinds of entity held in the local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Book,
    Series,
    Contributor,
    Tag,
    Collection,
    Shelf,
    ListeningEvent,
    Session,
    Preferences,
    Profile,
    PlaybackPosition,
}

impl EntityKind {
    /// Every kind, in a stable order.
    pub const ALL: [Self; 11] = [
        Self::Book,
        Self::Series,
        Self::Contributor,
        Self::Tag,
        Self::Collection,
        Self::Shelf,
        Self::ListeningEvent,
        Self::Session,
        Self::Preferences,
        Self::Profile,
        Self::PlaybackPosition,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Book => "book",
            Self::Series => "series",
            Self::Contributor => "contributor",
            Self::Tag => "tag",
            Self::Collection => "collection",
            Self::Shelf => "shelf",
            Self::ListeningEvent => "listening_event",
            Self::Session => "session",
            Self::Preferences => "preferences",
            Self::Profile => "profile",
            Self::PlaybackPosition => "playback_position",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| SyncError::Payload(format!("unknown entity kind: {s}")))
    }
}

/// Whether the cached copy reflects server truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Synced,
    NotSynced,
}

impl SyncState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::NotSynced => "not_synced",
        }
    }

    /// Parse the stored form. Anything unrecognised is treated as unsynced so
    /// that the next pull repairs it.
    #[must_use]
    pub fn from_db(s: &str) -> Self {
        if s == "synced" {
            Self::Synced
        } else {
            Self::NotSynced
        }
    }
}

/// A cached entity: a JSON document plus sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntity {
    pub kind: EntityKind,
    pub id: String,
    pub data: Value,
    /// Unix milliseconds of the last write, local or remote.
    pub updated_at: i64,
    pub sync_state: SyncState,
}

impl LocalEntity {
    /// An entity as received from the server.
    #[must_use]
    pub fn synced(kind: EntityKind, id: impl Into<String>, data: Value, updated_at: i64) -> Self {
        Self {
            kind,
            id: id.into(),
            data,
            updated_at,
            sync_state: SyncState::Synced,
        }
    }
}

/// Playback progress for one book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackPosition {
    pub book_id: String,
    pub position_ms: i64,
    /// Unix milliseconds when the position was recorded on its device.
    pub last_played_at: i64,
    /// Device-local; never sent to or received from the server.
    pub playback_speed: Option<f64>,
    pub updated_at: i64,
    pub sync_state: SyncState,
}

/// Relationship edges between cached entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    BookContributor,
    BookSeries,
    BookTag,
    CollectionBook,
    ShelfBook,
}

impl LinkKind {
    pub const ALL: [Self; 5] = [
        Self::BookContributor,
        Self::BookSeries,
        Self::BookTag,
        Self::CollectionBook,
        Self::ShelfBook,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BookContributor => "book_contributor",
            Self::BookSeries => "book_series",
            Self::BookTag => "book_tag",
            Self::CollectionBook => "collection_book",
            Self::ShelfBook => "shelf_book",
        }
    }

    /// Kinds at each end of the edge, as `(from, to)`.
    #[must_use]
    pub const fn endpoints(self) -> (EntityKind, EntityKind) {
        match self {
            Self::BookContributor => (EntityKind::Book, EntityKind::Contributor),
            Self::BookSeries => (EntityKind::Book, EntityKind::Series),
            Self::BookTag => (EntityKind::Book, EntityKind::Tag),
            Self::CollectionBook => (EntityKind::Collection, EntityKind::Book),
            Self::ShelfBook => (EntityKind::Shelf, EntityKind::Book),
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_round_trips_through_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("podcast".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_entity_kind_serde_matches_as_str() {
        let json = serde_json::to_string(&EntityKind::ListeningEvent).unwrap();
        assert_eq!(json, "\"listening_event\"");
    }

    #[test]
    fn test_unknown_sync_state_is_not_synced() {
        assert_eq!(SyncState::from_db("synced"), SyncState::Synced);
        assert_eq!(SyncState::from_db("garbage"), SyncState::NotSynced);
    }

    #[test]
    fn test_link_endpoints() {
        assert_eq!(
            LinkKind::ShelfBook.endpoints(),
            (EntityKind::Shelf, EntityKind::Book)
        );
    }
}
