//! Presence queue: who is waiting to be paired

use duet_core::keys;
use duet_core::{from_value, to_value, ClientId, QueueEntry, RendezvousStore, StoreError};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PresenceQueue<S: RendezvousStore> {
    store: Arc<S>,
}

impl<S: RendezvousStore> Clone for PresenceQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: RendezvousStore> PresenceQueue<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Start waiting. The entry is removed by the store if this connection drops.
    pub async fn enter(&self, id: &ClientId) -> Result<QueueEntry, StoreError> {
        let key = keys::queue_entry(id);
        // Rule first: a crash between the two calls must not leave a stale entry
        self.store.on_disconnect_remove(&key).await?;
        let entry = QueueEntry::new(id.clone());
        self.store.set(&key, Some(to_value(&entry)?)).await?;
        debug!("[{}] entered queue", id.short());
        Ok(entry)
    }

    /// Stop waiting. Removing an absent entry is not an error.
    pub async fn leave(&self, id: &ClientId) -> Result<(), StoreError> {
        let key = keys::queue_entry(id);
        self.store.set(&key, None).await?;
        self.store.cancel_on_disconnect(&key).await?;
        debug!("[{}] left queue", id.short());
        Ok(())
    }

    pub async fn entry(&self, id: &ClientId) -> Result<Option<QueueEntry>, StoreError> {
        match self.store.get(&keys::queue_entry(id)).await? {
            Some(value) => Ok(Some(from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Every waiting client in key order. Malformed entries are skipped.
    pub async fn snapshot(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let children = self.store.get_children(keys::QUEUE).await?;
        Ok(children
            .into_iter()
            .filter_map(|(key, value)| match from_value::<QueueEntry>(value) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("ignoring malformed queue entry {}: {}", key, e);
                    None
                }
            })
            .collect())
    }
}
