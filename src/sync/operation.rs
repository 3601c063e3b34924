//! Queued operation types.
//!
//! A [`PendingOperation`] is one durable, not-yet-acknowledged local mutation.
//! Its payload is stored as serialized JSON and only decoded by the handler
//! registered for its [`OperationType`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::EntityKind;
use crate::error::SyncError;

/// Kinds of mutation the engine knows how to push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Edit book metadata fields
    UpdateBook,
    /// Edit contributor metadata fields
    UpdateContributor,
    /// Edit series metadata fields
    UpdateSeries,
    /// Fold one contributor into another
    MergeContributor,
    /// Undo a contributor merge
    UnmergeContributor,
    /// Replace a book's contributors
    SetBookContributors,
    /// Replace a book's series membership
    SetBookSeries,
    /// Replace a book's tags
    SetBookTags,
    /// Report a listening interval
    RecordListeningEvent,
    /// Report playback progress
    UpdatePlaybackPosition,
    /// Edit user preferences
    UpdatePreferences,
    /// Edit the user profile
    UpdateProfile,
}

impl OperationType {
    pub const ALL: [Self; 12] = [
        Self::UpdateBook,
        Self::UpdateContributor,
        Self::UpdateSeries,
        Self::MergeContributor,
        Self::UnmergeContributor,
        Self::SetBookContributors,
        Self::SetBookSeries,
        Self::SetBookTags,
        Self::RecordListeningEvent,
        Self::UpdatePlaybackPosition,
        Self::UpdatePreferences,
        Self::UpdateProfile,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UpdateBook => "update_book",
            Self::UpdateContributor => "update_contributor",
            Self::UpdateSeries => "update_series",
            Self::MergeContributor => "merge_contributor",
            Self::UnmergeContributor => "unmerge_contributor",
            Self::SetBookContributors => "set_book_contributors",
            Self::SetBookSeries => "set_book_series",
            Self::SetBookTags => "set_book_tags",
            Self::RecordListeningEvent => "record_listening_event",
            Self::UpdatePlaybackPosition => "update_playback_position",
            Self::UpdatePreferences => "update_preferences",
            Self::UpdateProfile => "update_profile",
        }
    }

    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::UpdateBook => "Update Book",
            Self::UpdateContributor => "Update Contributor",
            Self::UpdateSeries => "Update Series",
            Self::MergeContributor => "Merge Contributor",
            Self::UnmergeContributor => "Unmerge Contributor",
            Self::SetBookContributors => "Set Book Contributors",
            Self::SetBookSeries => "Set Book Series",
            Self::SetBookTags => "Set Book Tags",
            Self::RecordListeningEvent => "Record Listening",
            Self::UpdatePlaybackPosition => "Update Position",
            Self::UpdatePreferences => "Update Preferences",
            Self::UpdateProfile => "Update Profile",
        }
    }

    /// Globally scoped types have at most one queued row regardless of
    /// entity id.
    #[must_use]
    pub const fn is_global(self) -> bool {
        matches!(self, Self::UpdatePreferences | Self::UpdateProfile)
    }

    /// The cached entity kind a row of this type refers to.
    #[must_use]
    pub const fn entity_kind(self) -> EntityKind {
        match self {
            Self::UpdateBook
            | Self::SetBookContributors
            | Self::SetBookSeries
            | Self::SetBookTags => EntityKind::Book,
            Self::UpdateContributor | Self::MergeContributor | Self::UnmergeContributor => {
                EntityKind::Contributor
            }
            Self::UpdateSeries => EntityKind::Series,
            Self::RecordListeningEvent => EntityKind::ListeningEvent,
            Self::UpdatePlaybackPosition => EntityKind::PlaybackPosition,
            Self::UpdatePreferences => EntityKind::Preferences,
            Self::UpdateProfile => EntityKind::Profile,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SyncError::Payload(format!("unknown operation type: {s}")))
    }
}

/// Lifecycle state of a queued row. Completed rows are deleted, not kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Failed,
}

impl OperationStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "failed" => Ok(Self::Failed),
            other => Err(SyncError::Payload(format!("unknown status: {other}"))),
        }
    }
}

/// A queued local mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Client-generated unique id.
    pub id: String,
    pub operation_type: OperationType,
    pub entity_type: Option<EntityKind>,
    /// `None` for globally scoped operations.
    pub entity_id: Option<String>,
    /// Serialized handler payload.
    pub payload: String,
    pub batch_key: Option<String>,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

impl PendingOperation {
    /// Human-readable target, e.g. `book b1` or `preferences`.
    #[must_use]
    pub fn target(&self) -> String {
        let kind = self
            .entity_type
            .unwrap_or_else(|| self.operation_type.entity_kind());
        match &self.entity_id {
            Some(id) => format!("{kind} {id}"),
            None => kind.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_type_round_trip() {
        for op in OperationType::ALL {
            assert_eq!(op.as_str().parse::<OperationType>().unwrap(), op);
        }
        assert!("delete_everything".parse::<OperationType>().is_err());
    }

    #[test]
    fn test_global_types() {
        let global: Vec<_> = OperationType::ALL
            .into_iter()
            .filter(|t| t.is_global())
            .collect();
        assert_eq!(
            global,
            vec![OperationType::UpdatePreferences, OperationType::UpdateProfile]
        );
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "in_progress".parse::<OperationStatus>().unwrap(),
            OperationStatus::InProgress
        );
        assert_eq!(OperationStatus::Failed.to_string(), "failed");
        assert!("completed".parse::<OperationStatus>().is_err());
    }

    #[test]
    fn test_target_display() {
        let now = Utc::now();
        let mut op = PendingOperation {
            id: "x".into(),
            operation_type: OperationType::UpdateBook,
            entity_type: Some(EntityKind::Book),
            entity_id: Some("b1".into()),
            payload: "{}".into(),
            batch_key: None,
            status: OperationStatus::Pending,
            created_at: now,
            updated_at: now,
            attempt_count: 0,
            last_error: None,
        };
        assert_eq!(op.target(), "book b1");

        op.operation_type = OperationType::UpdatePreferences;
        op.entity_type = None;
        op.entity_id = None;
        assert_eq!(op.target(), "preferences");
    }
}
