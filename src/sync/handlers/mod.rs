//! Concrete handlers for every [`OperationType`].
//!
//! [`OperationType`]: crate::sync::operation::OperationType

mod contributor;
mod listening;
mod metadata;
mod position;
mod relationship;
mod settings;

use std::sync::Arc;

pub use contributor::{
    ContributorMerge, ContributorUnmerge, MergeContributorHandler, UnmergeContributorHandler,
};
pub use listening::{ListeningEventHandler, LISTENING_BATCH_KEY};
pub use metadata::{FieldPatch, MetadataHandler};
pub use position::PlaybackPositionHandler;
pub use relationship::{RelationshipSet, SetRelationshipHandler};
pub use settings::SettingsHandler;

use super::handler::HandlerRegistry;
use super::operation::PendingOperation;
use crate::api::ServerApi;
use crate::error::OperationError;

/// Entity-scoped handlers need the row's entity id.
fn require_entity_id(op: &PendingOperation) -> Result<&str, OperationError> {
    op.entity_id.as_deref().ok_or_else(|| {
        OperationError::PayloadCorrupt(format!(
            "{} operation {} has no entity id",
            op.operation_type, op.id
        ))
    })
}

/// One handler per operation type, all talking to the same server.
#[derive(Clone)]
pub struct Handlers {
    pub update_book: MetadataHandler,
    pub update_contributor: MetadataHandler,
    pub update_series: MetadataHandler,
    pub merge_contributor: MergeContributorHandler,
    pub unmerge_contributor: UnmergeContributorHandler,
    pub set_book_contributors: SetRelationshipHandler,
    pub set_book_series: SetRelationshipHandler,
    pub set_book_tags: SetRelationshipHandler,
    pub record_listening_event: ListeningEventHandler,
    pub update_playback_position: PlaybackPositionHandler,
    pub update_preferences: SettingsHandler,
    pub update_profile: SettingsHandler,
}

impl Handlers {
    #[must_use]
    pub fn new(api: &Arc<dyn ServerApi>) -> Self {
        Self {
            update_book: MetadataHandler::book(Arc::clone(api)),
            update_contributor: MetadataHandler::contributor(Arc::clone(api)),
            update_series: MetadataHandler::series(Arc::clone(api)),
            merge_contributor: MergeContributorHandler::new(Arc::clone(api)),
            unmerge_contributor: UnmergeContributorHandler::new(Arc::clone(api)),
            set_book_contributors: SetRelationshipHandler::book_contributors(Arc::clone(api)),
            set_book_series: SetRelationshipHandler::book_series(Arc::clone(api)),
            set_book_tags: SetRelationshipHandler::book_tags(Arc::clone(api)),
            record_listening_event: ListeningEventHandler::new(Arc::clone(api)),
            update_playback_position: PlaybackPositionHandler::new(Arc::clone(api)),
            update_preferences: SettingsHandler::preferences(Arc::clone(api)),
            update_profile: SettingsHandler::profile(Arc::clone(api)),
        }
    }

    /// A registry covering every operation type.
    #[must_use]
    pub fn registry(&self) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(self.update_book.clone());
        registry.register(self.update_contributor.clone());
        registry.register(self.update_series.clone());
        registry.register(self.merge_contributor.clone());
        registry.register(self.unmerge_contributor.clone());
        registry.register(self.set_book_contributors.clone());
        registry.register(self.set_book_series.clone());
        registry.register(self.set_book_tags.clone());
        registry.register(self.record_listening_event.clone());
        registry.register(self.update_playback_position.clone());
        registry.register(self.update_preferences.clone());
        registry.register(self.update_profile.clone());
        registry
    }
}
