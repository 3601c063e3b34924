//! Field edits on books, contributors, and series.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::require_entity_id;
use crate::api::ServerApi;
use crate::cache::EntityKind;
use crate::error::OperationError;
use crate::sync::handler::OperationHandler;
use crate::sync::operation::{OperationType, PendingOperation};

/// A set of changed fields. Later edits win field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPatch(pub Map<String, Value>);

impl FieldPatch {
    /// Overlay `newer` on top of `self`.
    #[must_use]
    pub fn merged_with(mut self, newer: Self) -> Self {
        self.0.extend(newer.0);
        self
    }
}

impl From<Map<String, Value>> for FieldPatch {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Pushes metadata edits for one entity kind.
#[derive(Clone)]
pub struct MetadataHandler {
    api: Arc<dyn ServerApi>,
    kind: EntityKind,
    operation_type: OperationType,
}

impl MetadataHandler {
    #[must_use]
    pub fn book(api: Arc<dyn ServerApi>) -> Self {
        Self {
            api,
            kind: EntityKind::Book,
            operation_type: OperationType::UpdateBook,
        }
    }

    #[must_use]
    pub fn contributor(api: Arc<dyn ServerApi>) -> Self {
        Self {
            api,
            kind: EntityKind::Contributor,
            operation_type: OperationType::UpdateContributor,
        }
    }

    #[must_use]
    pub fn series(api: Arc<dyn ServerApi>) -> Self {
        Self {
            api,
            kind: EntityKind::Series,
            operation_type: OperationType::UpdateSeries,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.kind
    }
}

#[async_trait]
impl OperationHandler for MetadataHandler {
    type Payload = FieldPatch;

    fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    fn coalesce(&self, existing: FieldPatch, new: FieldPatch) -> Option<FieldPatch> {
        Some(existing.merged_with(new))
    }

    async fn execute(&self, op: &PendingOperation, payload: FieldPatch) -> Result<(), OperationError> {
        let id = require_entity_id(op)?;
        self.api
            .update_metadata(self.kind, id, &payload.0)
            .await
            .map_err(OperationError::from)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::api::{ApiCall, MemoryServer};
    use crate::sync::handlers::tests::pending;

    fn patch(value: Value) -> FieldPatch {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_coalesce_overlays_newer_fields() {
        let handler = MetadataHandler::book(Arc::new(MemoryServer::new()));
        let merged = handler
            .coalesce(
                patch(json!({"title": "Old", "subtitle": "Kept"})),
                patch(json!({"title": "New"})),
            )
            .unwrap();

        assert_eq!(merged, patch(json!({"title": "New", "subtitle": "Kept"})));
    }

    #[test]
    fn test_payload_is_a_plain_object() {
        let handler = MetadataHandler::series(Arc::new(MemoryServer::new()));
        let raw = handler
            .serialize_payload(&patch(json!({"name": "Foundation"})))
            .unwrap();
        assert_eq!(raw, r#"{"name":"Foundation"}"#);
    }

    #[tokio::test]
    async fn test_execute_sends_fields_for_kind() {
        let server = Arc::new(MemoryServer::new());
        server.put_record(EntityKind::Contributor, "c1", json!({"name": "A"}), 1);
        let handler = MetadataHandler::contributor(server.clone());

        handler
            .execute(
                &pending(OperationType::UpdateContributor, Some("c1")),
                patch(json!({"name": "B"})),
            )
            .await
            .unwrap();

        assert_eq!(
            server.mutation_calls(),
            vec![ApiCall::UpdateMetadata {
                kind: EntityKind::Contributor,
                id: "c1".into(),
                fields: json!({"name": "B"}).as_object().unwrap().clone(),
            }]
        );
        assert_eq!(
            server.record(EntityKind::Contributor, "c1").unwrap().data["name"],
            "B"
        );
    }

    #[tokio::test]
    async fn test_missing_entity_id_is_corrupt() {
        let handler = MetadataHandler::book(Arc::new(MemoryServer::new()));
        let err = handler
            .execute(&pending(OperationType::UpdateBook, None), FieldPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::PayloadCorrupt(_)));
    }
}
