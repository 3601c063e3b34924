//! Contributor merge and unmerge.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::api::ServerApi;
use crate::error::OperationError;
use crate::sync::handler::OperationHandler;
use crate::sync::operation::{OperationType, PendingOperation};

/// Fold `source_id` into `target_id`. Queued against the source contributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributorMerge {
    pub source_id: String,
    pub target_id: String,
}

/// Split a previously merged contributor back out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributorUnmerge {
    pub contributor_id: String,
}

#[derive(Clone)]
pub struct MergeContributorHandler {
    api: Arc<dyn ServerApi>,
}

impl MergeContributorHandler {
    #[must_use]
    pub fn new(api: Arc<dyn ServerApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl OperationHandler for MergeContributorHandler {
    type Payload = ContributorMerge;

    fn operation_type(&self) -> OperationType {
        OperationType::MergeContributor
    }

    async fn execute(
        &self,
        _op: &PendingOperation,
        payload: ContributorMerge,
    ) -> Result<(), OperationError> {
        self.api
            .merge_contributors(&payload.source_id, &payload.target_id)
            .await
            .map_err(OperationError::from)
    }
}

#[derive(Clone)]
pub struct UnmergeContributorHandler {
    api: Arc<dyn ServerApi>,
}

impl UnmergeContributorHandler {
    #[must_use]
    pub fn new(api: Arc<dyn ServerApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl OperationHandler for UnmergeContributorHandler {
    type Payload = ContributorUnmerge;

    fn operation_type(&self) -> OperationType {
        OperationType::UnmergeContributor
    }

    async fn execute(
        &self,
        _op: &PendingOperation,
        payload: ContributorUnmerge,
    ) -> Result<(), OperationError> {
        self.api
            .unmerge_contributor(&payload.contributor_id)
            .await
            .map_err(OperationError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiCall, MemoryServer};
    use crate::sync::handlers::tests::pending;

    #[test]
    fn test_second_merge_target_replaces_first() {
        let handler = MergeContributorHandler::new(Arc::new(MemoryServer::new()));
        let merged = handler.coalesce(
            ContributorMerge {
                source_id: "c1".into(),
                target_id: "c2".into(),
            },
            ContributorMerge {
                source_id: "c1".into(),
                target_id: "c3".into(),
            },
        );
        assert_eq!(merged.unwrap().target_id, "c3");
    }

    #[tokio::test]
    async fn test_merge_then_unmerge_calls() {
        let server = Arc::new(MemoryServer::new());
        let merge = MergeContributorHandler::new(server.clone());
        let unmerge = UnmergeContributorHandler::new(server.clone());

        merge
            .execute(
                &pending(OperationType::MergeContributor, Some("c1")),
                ContributorMerge {
                    source_id: "c1".into(),
                    target_id: "c2".into(),
                },
            )
            .await
            .unwrap();
        unmerge
            .execute(
                &pending(OperationType::UnmergeContributor, Some("c1")),
                ContributorUnmerge {
                    contributor_id: "c1".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            server.mutation_calls(),
            vec![
                ApiCall::MergeContributors {
                    source_id: "c1".into(),
                    target_id: "c2".into(),
                },
                ApiCall::UnmergeContributor {
                    contributor_id: "c1".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_self_merge_is_rejected_terminally() {
        let server = Arc::new(MemoryServer::new());
        let err = MergeContributorHandler::new(server)
            .execute(
                &pending(OperationType::MergeContributor, Some("c1")),
                ContributorMerge {
                    source_id: "c1".into(),
                    target_id: "c1".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_terminal());
    }
}
