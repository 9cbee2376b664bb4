//! Cancellation-aware context that carries task metadata between producers
//! and consumers.
//!
//! A producer attaches ambient key-value pairs to a [`QueueContext`] before
//! enqueueing; the storage layer merges those pairs into the task's metadata
//! at insertion time. When a worker later picks the task up, the processor
//! publishes the stored metadata into the handler's context, so downstream
//! code can read the original annotations without threading them explicitly.
//!
//! The context records which keys it owns (in insertion order), so the
//! receiving side can enumerate exactly the pairs placed by this mechanism
//! rather than relying on a fixed key list.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::task::Metadata;

/// Carrier for a cancellation token plus queue-scoped metadata.
#[derive(Debug, Clone, Default)]
pub struct QueueContext {
    cancellation: CancellationToken,
    keys: Vec<String>,
    values: Metadata,
}

impl QueueContext {
    /// Create a context with a fresh, never-canceled token and no metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context bound to an existing cancellation token.
    pub fn with_cancellation(cancellation: CancellationToken) -> Self {
        QueueContext {
            cancellation,
            keys: Vec::new(),
            values: Metadata::default(),
        }
    }

    /// Add a single key-value pair for task metadata tracking.
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        if !self.keys.contains(&key) {
            self.keys.push(key.clone());
        }
        self.values.insert(key, value);
        self
    }

    /// Add multiple key-value pairs for task metadata tracking.
    pub fn with_values(mut self, values: Metadata) -> Self {
        for (key, value) in values.iter() {
            if !self.keys.contains(key) {
                self.keys.push(key.clone());
            }
            self.values.insert(key.clone(), value.clone());
        }
        self
    }

    /// Retrieve a stored value by key.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// All metadata placed into this context, in insertion order of keys.
    pub fn values(&self) -> Metadata {
        self.keys
            .iter()
            .filter_map(|key| {
                self.values
                    .get(key)
                    .map(|value| (key.clone(), value.clone()))
            })
            .collect()
    }

    /// The cancellation token this context observes. Handlers should check
    /// it at their own suspension points and return
    /// [`ProcessError::Shutdown`](crate::errors::ProcessError::Shutdown)
    /// when it fires.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_values_enumerates_only_owned_keys() {
        let ctx = QueueContext::new()
            .with_value("tenant", json!("acme"))
            .with_value("request_id", json!("r-1"));

        let values = ctx.values();
        assert_eq!(values.len(), 2);
        assert_eq!(values.get("tenant"), Some(&json!("acme")));
        assert_eq!(values.get("request_id"), Some(&json!("r-1")));
    }

    #[test]
    fn test_later_writes_overwrite() {
        let mut extra = Metadata::new();
        extra.insert("tenant", json!("globex"));

        let ctx = QueueContext::new()
            .with_value("tenant", json!("acme"))
            .with_values(extra);

        assert_eq!(ctx.value("tenant"), Some(&json!("globex")));
        assert_eq!(ctx.values().len(), 1);
    }

    #[test]
    fn test_empty_context_has_no_values() {
        let ctx = QueueContext::new();
        assert!(ctx.values().is_empty());
        assert!(ctx.value("missing").is_none());
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_cancellation_is_observable() {
        let token = CancellationToken::new();
        let ctx = QueueContext::with_cancellation(token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
