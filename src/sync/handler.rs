//! Per-operation-type strategy and the registry that looks it up.
//!
//! Each [`OperationType`] has one [`OperationHandler`] that knows how to
//! decode its payload, merge two queued payloads, group rows into batches,
//! and send them to the server. The registry stores handlers type-erased so
//! the executor can dispatch on the stored type tag alone.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::executor;
use super::operation::{OperationType, PendingOperation};
use crate::error::{OperationError, SyncError};

/// Per-id outcome of executing a batch.
pub type BatchResults = HashMap<String, Result<(), OperationError>>;

/// Strategy for one kind of queued mutation.
#[async_trait]
pub trait OperationHandler: Send + Sync + 'static {
    /// Decoded payload.
    type Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// The type tag this handler serves.
    fn operation_type(&self) -> OperationType;

    /// Decode a stored payload.
    ///
    /// # Errors
    ///
    /// Returns `PayloadCorrupt` if the bytes do not decode.
    fn parse_payload(&self, raw: &str) -> Result<Self::Payload, OperationError> {
        serde_json::from_str(raw).map_err(|e| OperationError::PayloadCorrupt(e.to_string()))
    }

    /// Encode a payload for storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    fn serialize_payload(&self, payload: &Self::Payload) -> Result<String, SyncError> {
        Ok(serde_json::to_string(payload)?)
    }

    /// Whether a new payload may be folded into `existing`.
    fn should_coalesce(&self, _existing: &PendingOperation) -> bool {
        true
    }

    /// Fold `new` into `existing`. `None` keeps them as separate rows.
    fn coalesce(&self, _existing: Self::Payload, new: Self::Payload) -> Option<Self::Payload> {
        Some(new)
    }

    /// Grouping key for batch submission.
    fn batch_key(&self, _payload: &Self::Payload) -> Option<String> {
        None
    }

    /// Send one operation.
    async fn execute(
        &self,
        op: &PendingOperation,
        payload: Self::Payload,
    ) -> Result<(), OperationError>;

    /// Send several operations. Defaults to sequential [`execute`] calls;
    /// handlers with a real batch endpoint override this.
    ///
    /// [`execute`]: OperationHandler::execute
    async fn execute_batch(&self, items: Vec<(PendingOperation, Self::Payload)>) -> BatchResults {
        let mut results = BatchResults::with_capacity(items.len());
        for (op, payload) in items {
            let outcome = self.execute(&op, payload).await;
            results.insert(op.id, outcome);
        }
        results
    }
}

/// Object-safe view of an [`OperationHandler`] that works on stored strings.
#[async_trait]
pub trait ErasedHandler: Send + Sync {
    fn operation_type(&self) -> OperationType;

    fn should_coalesce(&self, existing: &PendingOperation) -> bool;

    /// Coalesce two stored payloads. `Ok(None)` means keep separate rows.
    ///
    /// # Errors
    ///
    /// Returns an error if `new` does not decode or the result cannot be
    /// encoded. A corrupt `existing` payload yields `new` unchanged.
    fn coalesce_stored(&self, existing: &str, new: &str) -> Result<Option<String>, SyncError>;

    /// # Errors
    ///
    /// Returns an error if the payload does not decode.
    fn batch_key_stored(&self, raw: &str) -> Result<Option<String>, SyncError>;

    /// Execute a homogeneous group of rows.
    async fn execute_stored(&self, ops: Vec<PendingOperation>) -> BatchResults;
}

#[async_trait]
impl<H: OperationHandler> ErasedHandler for H {
    fn operation_type(&self) -> OperationType {
        OperationHandler::operation_type(self)
    }

    fn should_coalesce(&self, existing: &PendingOperation) -> bool {
        OperationHandler::should_coalesce(self, existing)
    }

    fn coalesce_stored(&self, existing: &str, new: &str) -> Result<Option<String>, SyncError> {
        let new = self
            .parse_payload(new)
            .map_err(|e| SyncError::Payload(e.to_string()))?;
        let merged = match self.parse_payload(existing) {
            Ok(existing) => self.coalesce(existing, new),
            Err(e) => {
                tracing::warn!(
                    operation_type = %OperationHandler::operation_type(self),
                    error = %e,
                    "Replacing undecodable queued payload"
                );
                Some(new)
            }
        };
        merged.map(|p| self.serialize_payload(&p)).transpose()
    }

    fn batch_key_stored(&self, raw: &str) -> Result<Option<String>, SyncError> {
        let payload = self
            .parse_payload(raw)
            .map_err(|e| SyncError::Payload(e.to_string()))?;
        Ok(self.batch_key(&payload))
    }

    async fn execute_stored(&self, ops: Vec<PendingOperation>) -> BatchResults {
        executor::run_typed(self, ops).await
    }
}

/// Lookup from operation type to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OperationType, Arc<dyn ErasedHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for its type.
    pub fn register<H: OperationHandler>(&mut self, handler: H) {
        self.register_arc(Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn ErasedHandler>) {
        self.handlers.insert(handler.operation_type(), handler);
    }

    #[must_use]
    pub fn get(&self, operation_type: OperationType) -> Option<Arc<dyn ErasedHandler>> {
        self.handlers.get(&operation_type).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Counter {
        value: i64,
    }

    /// Adds coalesced values together; batches when the value is negative.
    struct SumHandler;

    #[async_trait]
    impl OperationHandler for SumHandler {
        type Payload = Counter;

        fn operation_type(&self) -> OperationType {
            OperationType::UpdatePreferences
        }

        fn coalesce(&self, existing: Counter, new: Counter) -> Option<Counter> {
            Some(Counter {
                value: existing.value + new.value,
            })
        }

        fn batch_key(&self, payload: &Counter) -> Option<String> {
            (payload.value < 0).then(|| "negative".to_string())
        }

        async fn execute(&self, _op: &PendingOperation, _payload: Counter) -> Result<(), OperationError> {
            Ok(())
        }
    }

    #[test]
    fn test_coalesce_stored_uses_handler_merge() {
        let merged = SumHandler
            .coalesce_stored(r#"{"value":2}"#, r#"{"value":3}"#)
            .unwrap()
            .unwrap();
        assert_eq!(merged, r#"{"value":5}"#);
    }

    #[test]
    fn test_coalesce_stored_replaces_corrupt_existing() {
        let merged = SumHandler
            .coalesce_stored("not json", r#"{"value":3}"#)
            .unwrap()
            .unwrap();
        assert_eq!(merged, r#"{"value":3}"#);
    }

    #[test]
    fn test_coalesce_stored_rejects_corrupt_new() {
        assert!(SumHandler.coalesce_stored(r#"{"value":2}"#, "{").is_err());
    }

    #[test]
    fn test_batch_key_stored() {
        assert_eq!(SumHandler.batch_key_stored(r#"{"value":1}"#).unwrap(), None);
        assert_eq!(
            SumHandler.batch_key_stored(r#"{"value":-1}"#).unwrap(),
            Some("negative".to_string())
        );
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        registry.register(SumHandler);

        assert_eq!(registry.len(), 1);
        assert!(registry.get(OperationType::UpdatePreferences).is_some());
        assert!(registry.get(OperationType::UpdateBook).is_none());
    }
}
