//! Dispatches queued rows to their handlers.
//!
//! The executor never decides what happens to a row afterwards; it only
//! reports a per-id outcome. Callers must not assume all-or-nothing results.

use tracing::{debug, warn};

use super::handler::{BatchResults, ErasedHandler, HandlerRegistry, OperationHandler};
use super::operation::{OperationType, PendingOperation};
use crate::error::OperationError;

/// Looks up the handler for a batch and runs it.
#[derive(Debug, Clone)]
pub struct OperationExecutor {
    registry: HandlerRegistry,
}

impl OperationExecutor {
    #[must_use]
    pub const fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    #[must_use]
    pub const fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Execute a batch. The store only hands out single-type batches; mixed
    /// input is split by type and each group dispatched separately.
    pub async fn execute(&self, operations: Vec<PendingOperation>) -> BatchResults {
        let mut results = BatchResults::with_capacity(operations.len());

        for (operation_type, group) in group_by_type(operations) {
            match self.registry.get(operation_type) {
                Some(handler) => {
                    results.extend(handler.execute_stored(group).await);
                }
                None => {
                    warn!(%operation_type, count = group.len(), "No handler registered");
                    for op in group {
                        results.insert(
                            op.id,
                            Err(OperationError::NoHandler(operation_type.to_string())),
                        );
                    }
                }
            }
        }

        results
    }
}

fn group_by_type(operations: Vec<PendingOperation>) -> Vec<(OperationType, Vec<PendingOperation>)> {
    let mut groups: Vec<(OperationType, Vec<PendingOperation>)> = Vec::new();
    for op in operations {
        match groups.iter_mut().find(|(t, _)| *t == op.operation_type) {
            Some((_, group)) => group.push(op),
            None => groups.push((op.operation_type, vec![op])),
        }
    }
    groups
}

/// Decode, then run a homogeneous group through `handler`.
///
/// Rows whose payload does not decode are reported as `PayloadCorrupt` and
/// left out; the rest still run. The batch path is taken when more than one
/// row remains or when any remaining payload has a batch key.
pub async fn run_typed<H: OperationHandler>(handler: &H, ops: Vec<PendingOperation>) -> BatchResults {
    let mut results = BatchResults::with_capacity(ops.len());
    let mut parsed = Vec::with_capacity(ops.len());

    for op in ops {
        match handler.parse_payload(&op.payload) {
            Ok(payload) => parsed.push((op, payload)),
            Err(err) => {
                warn!(id = %op.id, operation_type = %op.operation_type, error = %err, "Dropping corrupt payload");
                results.insert(op.id, Err(err));
            }
        }
    }

    if parsed.is_empty() {
        return results;
    }

    let use_batch = parsed.len() > 1 || parsed.iter().any(|(_, p)| handler.batch_key(p).is_some());

    if use_batch {
        let ids: Vec<String> = parsed.iter().map(|(op, _)| op.id.clone()).collect();
        debug!(count = ids.len(), "Executing batch");
        let mut outcome = handler.execute_batch(parsed).await;
        for id in ids {
            let result = outcome.remove(&id).unwrap_or_else(|| {
                Err(OperationError::Server(
                    "batch response omitted this operation".to_string(),
                ))
            });
            results.insert(id, result);
        }
    } else {
        for (op, payload) in parsed {
            let result = handler.execute(&op, payload).await;
            results.insert(op.id, result);
        }
    }

    results
}
