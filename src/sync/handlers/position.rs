//! Playback progress reports.

use std::sync::Arc;

use async_trait::async_trait;

use super::require_entity_id;
use crate::api::{PositionUpdate, ServerApi};
use crate::error::OperationError;
use crate::sync::handler::OperationHandler;
use crate::sync::operation::{OperationType, PendingOperation};

#[derive(Clone)]
pub struct PlaybackPositionHandler {
    api: Arc<dyn ServerApi>,
}

impl PlaybackPositionHandler {
    #[must_use]
    pub fn new(api: Arc<dyn ServerApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl OperationHandler for PlaybackPositionHandler {
    type Payload = PositionUpdate;

    fn operation_type(&self) -> OperationType {
        OperationType::UpdatePlaybackPosition
    }

    /// The most recently played position wins, regardless of queue order.
    fn coalesce(&self, existing: PositionUpdate, new: PositionUpdate) -> Option<PositionUpdate> {
        if existing.last_played_at > new.last_played_at {
            Some(existing)
        } else {
            Some(new)
        }
    }

    async fn execute(
        &self,
        op: &PendingOperation,
        payload: PositionUpdate,
    ) -> Result<(), OperationError> {
        let book_id = require_entity_id(op)?;
        self.api
            .update_playback_position(book_id, &payload)
            .await
            .map_err(OperationError::from)
    }
}
