//! Full-set replacement of a book's contributors, series, or tags.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::require_entity_id;
use crate::api::ServerApi;
use crate::cache::LinkKind;
use crate::error::OperationError;
use crate::sync::handler::OperationHandler;
use crate::sync::operation::{OperationType, PendingOperation};

/// The complete target list for one owner. A newer set replaces an older one
/// outright.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipSet {
    pub target_ids: Vec<String>,
}

#[derive(Clone)]
pub struct SetRelationshipHandler {
    api: Arc<dyn ServerApi>,
    link: LinkKind,
    operation_type: OperationType,
}

impl SetRelationshipHandler {
    #[must_use]
    pub fn book_contributors(api: Arc<dyn ServerApi>) -> Self {
        Self {
            api,
            link: LinkKind::BookContributor,
            operation_type: OperationType::SetBookContributors,
        }
    }

    #[must_use]
    pub fn book_series(api: Arc<dyn ServerApi>) -> Self {
        Self {
            api,
            link: LinkKind::BookSeries,
            operation_type: OperationType::SetBookSeries,
        }
    }

    #[must_use]
    pub fn book_tags(api: Arc<dyn ServerApi>) -> Self {
        Self {
            api,
            link: LinkKind::BookTag,
            operation_type: OperationType::SetBookTags,
        }
    }

    #[must_use]
    pub const fn link(&self) -> LinkKind {
        self.link
    }
}

#[async_trait]
impl OperationHandler for SetRelationshipHandler {
    type Payload = RelationshipSet;

    fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    async fn execute(
        &self,
        op: &PendingOperation,
        payload: RelationshipSet,
    ) -> Result<(), OperationError> {
        let owner = require_entity_id(op)?;
        self.api
            .set_relationships(self.link, owner, &payload.target_ids)
            .await
            .map_err(OperationError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryServer;
    use crate::sync::handlers::tests::pending;

    #[tokio::test]
    async fn test_sets_links_on_server() {
        let server = Arc::new(MemoryServer::new());
        let handler = SetRelationshipHandler::book_tags(server.clone());

        handler
            .execute(
                &pending(OperationType::SetBookTags, Some("b1")),
                RelationshipSet {
                    target_ids: vec!["t1".into(), "t2".into()],
                },
            )
            .await
            .unwrap();

        assert_eq!(server.links(LinkKind::BookTag, "b1"), vec!["t1", "t2"]);
    }

    #[test]
    fn test_newer_set_replaces() {
        let handler = SetRelationshipHandler::book_series(Arc::new(MemoryServer::new()));
        let merged = handler
            .coalesce(
                RelationshipSet {
                    target_ids: vec!["s1".into()],
                },
                RelationshipSet {
                    target_ids: vec!["s2".into()],
                },
            )
            .unwrap();
        assert_eq!(merged.target_ids, vec!["s2"]);
    }
}
