//! In-memory rendezvous store
//!
//! `MemoryRendezvous` is the shared backend; every client gets its own
//! `MemoryConnection` via [`MemoryRendezvous::connect`]. A single mutex guards
//! all state, so compare-and-set and batch writes are linearizable and watchers
//! never observe a half-applied batch.
//!
//! Faults can be injected for tests: the whole store can be made unavailable,
//! upcoming batch writes can be rejected, and every operation can be delayed.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::store::{BatchUpdate, ChildAdded, RendezvousStore, StoreError, Subscription, Value};

/// Operation counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub cas_attempts: u64,
    pub cas_commits: u64,
    pub batches_applied: u64,
    pub batches_rejected: u64,
    pub disconnects: u64,
}

struct ValueWatcher {
    conn: u64,
    key: String,
    tx: mpsc::UnboundedSender<Option<Value>>,
}

struct ChildWatcher {
    conn: u64,
    /// Always ends with '/'
    prefix: String,
    tx: mpsc::UnboundedSender<ChildAdded>,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, Value>,
    value_watchers: Vec<ValueWatcher>,
    child_watchers: Vec<ChildWatcher>,
    on_disconnect: HashMap<u64, BTreeSet<String>>,
    unavailable: bool,
    failing_batches: u32,
    next_conn: u64,
    latency: Duration,
    stats: MemoryStats,
}

enum Change {
    Value(String, Option<Value>),
    Child(String, Value),
}

impl Inner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            Err(StoreError::Unavailable("rendezvous store offline".to_string()))
        } else {
            Ok(())
        }
    }

    /// Apply one write, recording the notifications it causes
    fn apply(&mut self, key: &str, value: Option<Value>, changes: &mut Vec<Change>) {
        match value {
            Some(value) => {
                let previous = self.data.insert(key.to_string(), value.clone());
                if previous.as_ref() == Some(&value) {
                    return;
                }
                if previous.is_none() {
                    changes.push(Change::Child(key.to_string(), value.clone()));
                }
                changes.push(Change::Value(key.to_string(), Some(value)));
            }
            None => {
                if self.data.remove(key).is_some() {
                    changes.push(Change::Value(key.to_string(), None));
                }
                // Siblings like "key-x" sort between "key" and "key/", so
                // nested keys are found from their own prefix
                let nested = format!("{}/", key);
                let removed: Vec<String> = self
                    .data
                    .range(nested.clone()..)
                    .take_while(|(k, _)| k.starts_with(&nested))
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in removed {
                    self.data.remove(&k);
                    changes.push(Change::Value(k, None));
                }
            }
        }
    }

    fn notify(&mut self, changes: Vec<Change>) {
        for change in changes {
            match change {
                Change::Value(key, value) => {
                    for w in self.value_watchers.iter().filter(|w| w.key == key) {
                        let _ = w.tx.send(value.clone());
                    }
                }
                Change::Child(key, value) => {
                    for w in self
                        .child_watchers
                        .iter()
                        .filter(|w| is_direct_child(&w.prefix, &key))
                    {
                        let _ = w.tx.send(ChildAdded {
                            key: key.clone(),
                            value: value.clone(),
                        });
                    }
                }
            }
        }
        self.value_watchers.retain(|w| !w.tx.is_closed());
        self.child_watchers.retain(|w| !w.tx.is_closed());
    }

    fn write(&mut self, updates: impl IntoIterator<Item = (String, Option<Value>)>) {
        let mut changes = Vec::new();
        for (key, value) in updates {
            self.apply(&key, value, &mut changes);
        }
        self.notify(changes);
    }
}

fn is_direct_child(prefix: &str, key: &str) -> bool {
    key.strip_prefix(prefix)
        .map(|rest| !rest.is_empty() && !rest.contains('/'))
        .unwrap_or(false)
}

fn normalize_prefix(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}

/// Shared in-memory backend
#[derive(Clone, Default)]
pub struct MemoryRendezvous {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new client connection
    pub fn connect(&self) -> MemoryConnection {
        let id = {
            let mut inner = self.lock();
            inner.next_conn += 1;
            inner.next_conn
        };
        MemoryConnection {
            backend: self.clone(),
            id,
            closed: AtomicBool::new(false),
        }
    }

    /// Make every operation fail with `Unavailable` (or recover)
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Reject the next `n` batch writes without applying them
    pub fn fail_next_batches(&self, n: u32) {
        self.lock().failing_batches = n;
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Copy of the whole key space
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.lock().data.clone()
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.lock().data.get(key).cloned()
    }

    /// Keys starting with `prefix`, in order
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats.clone()
    }

    fn latency(&self) -> Duration {
        self.lock().latency
    }

    /// Run and forget the on-disconnect rules of `conn`, close its watches
    fn drop_connection(&self, conn: u64) {
        let mut inner = self.lock();
        let rules = inner.on_disconnect.remove(&conn).unwrap_or_default();
        if !rules.is_empty() {
            debug!("connection {} dropped, removing {} keys", conn, rules.len());
        }
        inner.write(rules.into_iter().map(|k| (k, None)));
        inner.value_watchers.retain(|w| w.conn != conn);
        inner.child_watchers.retain(|w| w.conn != conn);
        inner.stats.disconnects += 1;
    }
}

/// One client's connection to a `MemoryRendezvous`
pub struct MemoryConnection {
    backend: MemoryRendezvous,
    id: u64,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn backend(&self) -> &MemoryRendezvous {
        &self.backend
    }

    /// Simulated network delay, then the backend lock
    async fn enter(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let latency = self.backend.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.is_closed() {
            return Err(StoreError::Disconnected);
        }
        let inner = self.backend.lock();
        inner.check_available()?;
        Ok(inner)
    }
}

#[async_trait]
impl RendezvousStore for MemoryConnection {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.enter().await?;
        Ok(inner.data.get(key).cloned())
    }

    async fn get_children(&self, prefix: &str) -> Result<BTreeMap<String, Value>, StoreError> {
        let inner = self.enter().await?;
        let prefix = normalize_prefix(prefix);
        Ok(inner
            .data
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| is_direct_child(&prefix, k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set(&self, key: &str, value: Option<Value>) -> Result<(), StoreError> {
        let mut inner = self.enter().await?;
        inner.write([(key.to_string(), value)]);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Option<Value>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.enter().await?;
        inner.stats.cas_attempts += 1;
        if inner.data.get(key) != expected {
            return Ok(false);
        }
        inner.write([(key.to_string(), new)]);
        inner.stats.cas_commits += 1;
        Ok(true)
    }

    async fn batch_update(&self, updates: BatchUpdate) -> Result<(), StoreError> {
        let mut inner = self.enter().await?;
        if inner.failing_batches > 0 {
            inner.failing_batches -= 1;
            inner.stats.batches_rejected += 1;
            return Err(StoreError::Rejected("injected batch failure".to_string()));
        }
        inner.write(updates);
        inner.stats.batches_applied += 1;
        Ok(())
    }

    async fn watch_value(&self, key: &str) -> Result<Subscription<Option<Value>>, StoreError> {
        let mut inner = self.enter().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(inner.data.get(key).cloned());
        inner.value_watchers.push(ValueWatcher {
            conn: self.id,
            key: key.to_string(),
            tx,
        });
        Ok(Subscription::new(rx))
    }

    async fn watch_children(&self, prefix: &str) -> Result<Subscription<ChildAdded>, StoreError> {
        let mut inner = self.enter().await?;
        let prefix = normalize_prefix(prefix);
        let (tx, rx) = mpsc::unbounded_channel();
        for (key, value) in inner.data.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            if is_direct_child(&prefix, key) {
                let _ = tx.send(ChildAdded {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        inner.child_watchers.push(ChildWatcher {
            conn: self.id,
            prefix,
            tx,
        });
        Ok(Subscription::new(rx))
    }

    async fn on_disconnect_remove(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.enter().await?;
        inner
            .on_disconnect
            .entry(self.id)
            .or_default()
            .insert(key.to_string());
        Ok(())
    }

    async fn cancel_on_disconnect(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.enter().await?;
        if let Some(rules) = inner.on_disconnect.get_mut(&self.id) {
            rules.remove(key);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.backend.drop_connection(self.id);
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.backend.drop_connection(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_and_nested_delete() {
        let store = MemoryRendezvous::new();
        let conn = store.connect();

        conn.set("rooms/a", Some(json!({"x": 1}))).await.unwrap();
        conn.set("rooms/a/offer", Some(json!("o"))).await.unwrap();
        conn.set("rooms/ab", Some(json!("other"))).await.unwrap();
        conn.set("rooms/a-b", Some(json!("dash"))).await.unwrap();
        conn.set("rooms/a/candidates/x/1", Some(json!("c"))).await.unwrap();
        assert_eq!(conn.get("rooms/a/offer").await.unwrap(), Some(json!("o")));

        conn.set("rooms/a", None).await.unwrap();
        assert_eq!(conn.get("rooms/a").await.unwrap(), None);
        assert_eq!(conn.get("rooms/a/offer").await.unwrap(), None);
        assert!(store.keys_with_prefix("rooms/a/").is_empty());
        // Siblings with a shared string prefix survive, including ones that
        // sort between the key and its children
        assert_eq!(conn.get("rooms/ab").await.unwrap(), Some(json!("other")));
        assert_eq!(conn.get("rooms/a-b").await.unwrap(), Some(json!("dash")));
    }

    #[tokio::test]
    async fn test_delete_without_own_value_removes_children() {
        let store = MemoryRendezvous::new();
        let conn = store.connect();
        conn.set("rooms/s1-b", Some(json!(1))).await.unwrap();
        conn.set("rooms/s1/offer", Some(json!("o"))).await.unwrap();

        let mut sub = conn.watch_value("rooms/s1/offer").await.unwrap();
        assert_eq!(sub.next().await, Some(Some(json!("o"))));

        conn.set("rooms/s1", None).await.unwrap();
        assert_eq!(sub.next().await, Some(None));
        assert_eq!(store.keys_with_prefix("rooms/"), vec!["rooms/s1-b".to_string()]);
    }

    #[tokio::test]
    async fn test_get_children() {
        let store = MemoryRendezvous::new();
        let conn = store.connect();
        conn.set("queue/b", Some(json!(2))).await.unwrap();
        conn.set("queue/a", Some(json!(1))).await.unwrap();
        conn.set("queue/a/nested", Some(json!(3))).await.unwrap();
        conn.set("queued", Some(json!(4))).await.unwrap();

        let children = conn.get_children("queue").await.unwrap();
        let keys: Vec<&str> = children.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["queue/a", "queue/b"]);
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = MemoryRendezvous::new();
        let conn = store.connect();

        assert!(conn.compare_and_set("k", None, Some(json!(1))).await.unwrap());
        assert!(!conn.compare_and_set("k", None, Some(json!(2))).await.unwrap());
        assert!(conn
            .compare_and_set("k", Some(&json!(1)), Some(json!(2)))
            .await
            .unwrap());
        assert_eq!(store.value("k"), Some(json!(2)));

        let stats = store.stats();
        assert_eq!(stats.cas_attempts, 3);
        assert_eq!(stats.cas_commits, 2);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = MemoryRendezvous::new();
        let conn = store.connect();
        conn.set("queue/a", Some(json!(1))).await.unwrap();

        let mut batch = BatchUpdate::new();
        batch.insert("matches/a".into(), Some(json!("s")));
        batch.insert("queue/a".into(), None);

        store.fail_next_batches(1);
        assert!(matches!(
            conn.batch_update(batch.clone()).await,
            Err(StoreError::Rejected(_))
        ));
        assert_eq!(store.value("matches/a"), None);
        assert_eq!(store.value("queue/a"), Some(json!(1)));

        conn.batch_update(batch).await.unwrap();
        assert_eq!(store.value("matches/a"), Some(json!("s")));
        assert_eq!(store.value("queue/a"), None);
    }

    #[tokio::test]
    async fn test_watch_value_sees_current_then_changes() {
        let store = MemoryRendezvous::new();
        let conn = store.connect();
        conn.set("k", Some(json!("v1"))).await.unwrap();

        let mut sub = conn.watch_value("k").await.unwrap();
        assert_eq!(sub.next().await, Some(Some(json!("v1"))));

        conn.set("k", Some(json!("v2"))).await.unwrap();
        conn.set("k", None).await.unwrap();
        assert_eq!(sub.next().await, Some(Some(json!("v2"))));
        assert_eq!(sub.next().await, Some(None));
    }

    #[tokio::test]
    async fn test_watch_children_only_direct_children() {
        let store = MemoryRendezvous::new();
        let conn = store.connect();
        conn.set("c/1", Some(json!("one"))).await.unwrap();

        let mut sub = conn.watch_children("c").await.unwrap();
        assert_eq!(sub.next().await.unwrap().key, "c/1");

        conn.set("c/1/deep", Some(json!("no"))).await.unwrap();
        conn.set("c/2", Some(json!("two"))).await.unwrap();
        // Overwriting an existing child is not an addition
        conn.set("c/2", Some(json!("two again"))).await.unwrap();

        let added = sub.next().await.unwrap();
        assert_eq!(added.key, "c/2");
        assert_eq!(added.value, json!("two"));
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn test_on_disconnect_rules_run_on_drop() {
        let store = MemoryRendezvous::new();
        let observer = store.connect();
        let conn = store.connect();

        conn.set("queue/a", Some(json!(1))).await.unwrap();
        conn.set("queue/b", Some(json!(2))).await.unwrap();
        conn.on_disconnect_remove("queue/a").await.unwrap();
        conn.on_disconnect_remove("queue/b").await.unwrap();
        conn.cancel_on_disconnect("queue/b").await.unwrap();

        let mut sub = observer.watch_value("queue/a").await.unwrap();
        assert_eq!(sub.next().await, Some(Some(json!(1))));

        drop(conn);
        assert_eq!(sub.next().await, Some(None));
        assert_eq!(store.value("queue/b"), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_operations() {
        let store = MemoryRendezvous::new();
        let conn = store.connect();
        let mut sub = conn.watch_value("k").await.unwrap();
        assert_eq!(sub.next().await, Some(None));

        conn.disconnect().await;
        assert_eq!(conn.get("k").await, Err(StoreError::Disconnected));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryRendezvous::new();
        let conn = store.connect();

        store.set_available(false);
        assert!(matches!(
            conn.set("k", Some(json!(1))).await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_available(true);
        conn.set("k", Some(json!(1))).await.unwrap();
    }
}
