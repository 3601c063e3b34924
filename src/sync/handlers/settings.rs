//! User preferences and profile. Both are global: one queued row each.

use std::sync::Arc;

use async_trait::async_trait;

use super::metadata::FieldPatch;
use crate::api::ServerApi;
use crate::error::OperationError;
use crate::sync::handler::OperationHandler;
use crate::sync::operation::{OperationType, PendingOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Preferences,
    Profile,
}

#[derive(Clone)]
pub struct SettingsHandler {
    api: Arc<dyn ServerApi>,
    target: Target,
}

impl SettingsHandler {
    #[must_use]
    pub fn preferences(api: Arc<dyn ServerApi>) -> Self {
        Self {
            api,
            target: Target::Preferences,
        }
    }

    #[must_use]
    pub fn profile(api: Arc<dyn ServerApi>) -> Self {
        Self {
            api,
            target: Target::Profile,
        }
    }
}

#[async_trait]
impl OperationHandler for SettingsHandler {
    type Payload = FieldPatch;

    fn operation_type(&self) -> OperationType {
        match self.target {
            Target::Preferences => OperationType::UpdatePreferences,
            Target::Profile => OperationType::UpdateProfile,
        }
    }

    fn coalesce(&self, existing: FieldPatch, new: FieldPatch) -> Option<FieldPatch> {
        Some(existing.merged_with(new))
    }

    async fn execute(&self, _op: &PendingOperation, payload: FieldPatch) -> Result<(), OperationError> {
        let result = match self.target {
            Target::Preferences => self.api.update_preferences(&payload.0).await,
            Target::Profile => self.api.update_profile(&payload.0).await,
        };
        result.map_err(OperationError::from)
    }
}
