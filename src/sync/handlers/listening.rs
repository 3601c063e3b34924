//! Listening interval reports.
//!
//! Listening events are never coalesced: each interval is distinct history.
//! They accumulate in the queue and go to the server through the batch
//! endpoint, even when only one is waiting.

use std::sync::Arc;

use async_trait::async_trait;

use crate::api::{ListeningEvent, ListeningSubmission, ServerApi};
use crate::error::OperationError;
use crate::sync::handler::{BatchResults, OperationHandler};
use crate::sync::operation::{OperationType, PendingOperation};

/// Batch key shared by every queued listening event.
pub const LISTENING_BATCH_KEY: &str = "listening-events";

#[derive(Clone)]
pub struct ListeningEventHandler {
    api: Arc<dyn ServerApi>,
}

impl ListeningEventHandler {
    #[must_use]
    pub fn new(api: Arc<dyn ServerApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl OperationHandler for ListeningEventHandler {
    type Payload = ListeningEvent;

    fn operation_type(&self) -> OperationType {
        OperationType::RecordListeningEvent
    }

    fn should_coalesce(&self, _existing: &PendingOperation) -> bool {
        false
    }

    fn batch_key(&self, _payload: &ListeningEvent) -> Option<String> {
        Some(LISTENING_BATCH_KEY.to_string())
    }

    async fn execute(
        &self,
        op: &PendingOperation,
        payload: ListeningEvent,
    ) -> Result<(), OperationError> {
        let id = op.id.clone();
        self.execute_batch(vec![(op.clone(), payload)])
            .await
            .remove(&id)
            .unwrap_or_else(|| Err(OperationError::Server("no acknowledgement".to_string())))
    }

    async fn execute_batch(&self, items: Vec<(PendingOperation, ListeningEvent)>) -> BatchResults {
        let submissions: Vec<ListeningSubmission> = items
            .into_iter()
            .map(|(op, event)| ListeningSubmission {
                client_id: op.id,
                event,
            })
            .collect();

        match self.api.submit_listening_events(&submissions).await {
            Ok(mut ack) => submissions
                .into_iter()
                .map(|s| {
                    let outcome = ack
                        .rejected
                        .remove(&s.client_id)
                        .map_or(Ok(()), |reason| Err(OperationError::Rejected(reason)));
                    (s.client_id, outcome)
                })
                .collect(),
            Err(err) => {
                let err = OperationError::from(err);
                submissions
                    .into_iter()
                    .map(|s| (s.client_id, Err(err.clone())))
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiCall, ApiError, MemoryServer};
    use crate::sync::handlers::tests::pending_with_id;

    fn event(book: &str) -> ListeningEvent {
        ListeningEvent {
            book_id: book.into(),
            started_at: 1_000,
            ended_at: 61_000,
            start_position_ms: 0,
            end_position_ms: 60_000,
        }
    }

    fn item(id: &str, book: &str) -> (PendingOperation, ListeningEvent) {
        (
            pending_with_id(id, OperationType::RecordListeningEvent, Some(book)),
            event(book),
        )
    }

    #[test]
    fn test_never_coalesces_and_always_batches() {
        let handler = ListeningEventHandler::new(Arc::new(MemoryServer::new()));
        let (op, payload) = item("1", "b1");
        assert!(!OperationHandler::should_coalesce(&handler, &op));
        assert_eq!(
            handler.batch_key(&payload).as_deref(),
            Some(LISTENING_BATCH_KEY)
        );
    }

    #[tokio::test]
    async fn test_batch_submits_once_with_per_item_results() {
        let server = Arc::new(MemoryServer::new());
        server.reject_listening_for("gone", "book deleted");
        let handler = ListeningEventHandler::new(server.clone());

        let results = handler
            .execute_batch(vec![item("1", "b1"), item("2", "gone"), item("3", "b2")])
            .await;

        assert_eq!(results["1"], Ok(()));
        assert_eq!(
            results["2"],
            Err(OperationError::Rejected("book deleted".into()))
        );
        assert_eq!(results["3"], Ok(()));
        assert_eq!(
            server.mutation_calls(),
            vec![ApiCall::SubmitListeningEvents {
                client_ids: vec!["1".into(), "2".into(), "3".into()],
            }]
        );
    }

    #[tokio::test]
    async fn test_transport_failure_applies_to_all() {
        let server = Arc::new(MemoryServer::new());
        server.fail_next(ApiError::Network("reset".into()));
        let handler = ListeningEventHandler::new(server);

        let results = handler
            .execute_batch(vec![item("1", "b1"), item("2", "b2")])
            .await;

        assert!(results
            .values()
            .all(|r| matches!(r, Err(OperationError::Network(_)))));
    }
}
