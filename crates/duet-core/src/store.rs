//! Rendezvous store interface
//!
//! The store is the only medium clients share. A `RendezvousStore` value is
//! one client's connection to it: cleanup rules registered with
//! `on_disconnect_remove` run when that connection goes away.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Values are JSON documents
pub type Value = serde_json::Value;

/// Multi-key write; `None` deletes the key and everything nested below it
pub type BatchUpdate = BTreeMap<String, Option<Value>>;

/// Store error type
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Connection closed")]
    Disconnected,
    #[error("Write rejected: {0}")]
    Rejected(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Whether retrying later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Rejected(_))
    }
}

/// A child created under a watched prefix
#[derive(Debug, Clone, PartialEq)]
pub struct ChildAdded {
    /// Full key of the child
    pub key: String,
    pub value: Value,
}

/// Stream of change notifications. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    /// Next notification; `None` once the connection is closed
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking variant of `next`
    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// One client's connection to the shared rendezvous store
#[async_trait]
pub trait RendezvousStore: Send + Sync {
    /// Read a key
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Direct children of `prefix` with their values, in key order
    async fn get_children(&self, prefix: &str) -> Result<BTreeMap<String, Value>, StoreError>;

    /// Write a key; `None` deletes it together with every nested key
    async fn set(&self, key: &str, value: Option<Value>) -> Result<(), StoreError>;

    /// Linearizable compare-and-set on a single key.
    /// Returns true if the current value equalled `expected` and `new` was written.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Option<Value>,
    ) -> Result<bool, StoreError>;

    /// Apply every update or none of them
    async fn batch_update(&self, updates: BatchUpdate) -> Result<(), StoreError>;

    /// Current value, then every subsequent change (at-least-once)
    async fn watch_value(&self, key: &str) -> Result<Subscription<Option<Value>>, StoreError>;

    /// Existing direct children of `prefix`, then each newly created one
    async fn watch_children(&self, prefix: &str) -> Result<Subscription<ChildAdded>, StoreError>;

    /// Delete `key` when this connection drops
    async fn on_disconnect_remove(&self, key: &str) -> Result<(), StoreError>;

    /// Forget a rule registered with `on_disconnect_remove`
    async fn cancel_on_disconnect(&self, key: &str) -> Result<(), StoreError>;

    /// Close the connection, running its on-disconnect rules
    async fn disconnect(&self);
}

// Blanket implementation so Arc-wrapped connections can be shared between tasks

#[async_trait]
impl<T: RendezvousStore + ?Sized> RendezvousStore for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        (**self).get(key).await
    }

    async fn get_children(&self, prefix: &str) -> Result<BTreeMap<String, Value>, StoreError> {
        (**self).get_children(prefix).await
    }

    async fn set(&self, key: &str, value: Option<Value>) -> Result<(), StoreError> {
        (**self).set(key, value).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Option<Value>,
    ) -> Result<bool, StoreError> {
        (**self).compare_and_set(key, expected, new).await
    }

    async fn batch_update(&self, updates: BatchUpdate) -> Result<(), StoreError> {
        (**self).batch_update(updates).await
    }

    async fn watch_value(&self, key: &str) -> Result<Subscription<Option<Value>>, StoreError> {
        (**self).watch_value(key).await
    }

    async fn watch_children(&self, prefix: &str) -> Result<Subscription<ChildAdded>, StoreError> {
        (**self).watch_children(prefix).await
    }

    async fn on_disconnect_remove(&self, key: &str) -> Result<(), StoreError> {
        (**self).on_disconnect_remove(key).await
    }

    async fn cancel_on_disconnect(&self, key: &str) -> Result<(), StoreError> {
        (**self).cancel_on_disconnect(key).await
    }

    async fn disconnect(&self) {
        (**self).disconnect().await
    }
}

pub fn to_value<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Typed helpers over JSON values
#[async_trait]
pub trait RendezvousStoreExt: RendezvousStore {
    async fn get_json<T>(&self, key: &str) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(value) => Ok(Some(from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T>(&self, key: &str, value: &T) -> Result<(), StoreError>
    where
        T: Serialize + Sync,
    {
        let value = to_value(value)?;
        self.set(key, Some(value)).await
    }
}

impl<S: RendezvousStore + ?Sized> RendezvousStoreExt for S {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(StoreError::Rejected("batch".into()).is_transient());
        assert!(!StoreError::Disconnected.is_transient());
        assert!(!StoreError::Serialization("bad".into()).is_transient());
    }

    #[test]
    fn test_from_value_reports_serialization_error() {
        let result: Result<u64, _> = from_value(serde_json::json!("nope"));
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }
}
