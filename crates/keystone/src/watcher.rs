//! Deduplicated prefix watches.
//!
//! A [`Watcher`] keeps at most one live subscription per path. Each
//! subscription is a forwarding task between the store's event stream and
//! the caller's [`WatchHandle`]; store errors are forwarded tagged with the
//! path and never end the subscription. Only [`Watcher::unwatch`] (or
//! dropping the watcher) tears it down.

use keystone_common::constants::DEFAULT_WATCH_BUFFER;
use keystone_common::{EventKind, KeyValue, KeystoneError, Result};
use std::collections::HashMap;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::store::{EventStream, RangeOptions, RangeResponse, SharedStore};

/// What a subscriber sees
#[derive(Debug)]
pub enum WatchNotification {
    Put(KeyValue),
    Delete(KeyValue),
    /// The underlying stream reported a failure; the watch stays registered
    Error { path: String, error: KeystoneError },
}

/// Receiving end of a subscription
#[derive(Debug)]
pub struct WatchHandle {
    path: String,
    events: mpsc::Receiver<WatchNotification>,
}

impl WatchHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next notification; `None` once the subscription is cancelled
    pub async fn recv(&mut self) -> Option<WatchNotification> {
        self.events.recv().await
    }
}

struct Subscription {
    forwarder: JoinHandle<()>,
}

/// Single-subscription-per-path multiplexer over the store's watch
pub struct Watcher {
    store: SharedStore,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    buffer: usize,
}

impl Watcher {
    pub fn new(store: SharedStore) -> Self {
        Self::with_buffer(store, DEFAULT_WATCH_BUFFER)
    }

    pub fn with_buffer(store: SharedStore, buffer: usize) -> Self {
        Self {
            store,
            subscriptions: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Open a prefix watch on `path`
    pub async fn watch(&self, path: &str) -> Result<WatchHandle> {
        self.subscribe(path, None).await
    }

    /// Read `path`, then watch it from the revision right after the read.
    ///
    /// Anchoring at the read revision means a write landing between the
    /// read and the subscription is delivered exactly once.
    pub async fn get_and_watch(&self, path: &str) -> Result<(RangeResponse, WatchHandle)> {
        if self.is_watching(path).await {
            return Err(KeystoneError::AlreadyWatching(path.to_string()));
        }
        let snapshot = self.store.range(path, RangeOptions::single()).await?;
        let handle = self.subscribe(path, Some(snapshot.revision + 1)).await?;
        Ok((snapshot, handle))
    }

    /// Cancel the subscription on `path`
    pub async fn unwatch(&self, path: &str) -> Result<()> {
        let subscription = self
            .subscriptions
            .lock()
            .await
            .remove(path)
            .ok_or_else(|| KeystoneError::NoSuchWatcher(path.to_string()))?;

        subscription.forwarder.abort();
        tracing::debug!(path = %path, "Unwatched");
        Ok(())
    }

    pub async fn is_watching(&self, path: &str) -> bool {
        self.subscriptions.lock().await.contains_key(path)
    }

    /// Paths with a live subscription
    pub async fn paths(&self) -> Vec<String> {
        self.subscriptions.lock().await.keys().cloned().collect()
    }

    async fn subscribe(&self, path: &str, start_revision: Option<i64>) -> Result<WatchHandle> {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(path) {
            return Err(KeystoneError::AlreadyWatching(path.to_string()));
        }

        let stream = self.store.watch(path, start_revision).await?;
        let (tx, rx) = mpsc::channel(self.buffer);
        let forwarder = tokio::spawn(forward(path.to_string(), stream, tx));

        subscriptions.insert(path.to_string(), Subscription { forwarder });
        tracing::debug!(path = %path, start_revision = ?start_revision, "Watching");

        Ok(WatchHandle {
            path: path.to_string(),
            events: rx,
        })
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        for (_, subscription) in self.subscriptions.get_mut().drain() {
            subscription.forwarder.abort();
        }
    }
}

async fn forward(path: String, mut stream: EventStream, tx: mpsc::Sender<WatchNotification>) {
    while let Some(item) = stream.recv().await {
        let notification = match item {
            Ok(event) => match event.kind {
                EventKind::Put => WatchNotification::Put(event.kv),
                EventKind::Delete => WatchNotification::Delete(event.kv),
            },
            Err(error) => {
                tracing::warn!(path = %path, error = %error, "Watch stream error");
                WatchNotification::Error {
                    path: path.clone(),
                    error,
                }
            }
        };
        if tx.send(notification).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FaultyStore;
    use crate::store::{InMemoryStore, KvStore};
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn setup() -> (Arc<InMemoryStore>, Watcher) {
        let store = Arc::new(InMemoryStore::new());
        let watcher = Watcher::new(store.clone());
        (store, watcher)
    }

    #[tokio::test]
    async fn test_double_watch_fails() {
        let (_store, watcher) = setup();
        assert_ok!(watcher.watch("/jobs/a").await);

        let err = watcher.watch("/jobs/a").await.unwrap_err();
        assert!(matches!(err, KeystoneError::AlreadyWatching(p) if p == "/jobs/a"));
    }

    #[tokio::test]
    async fn test_unwatch_without_watch_fails() {
        let (_store, watcher) = setup();
        let err = watcher.unwatch("/jobs/a").await.unwrap_err();
        assert!(matches!(err, KeystoneError::NoSuchWatcher(p) if p == "/jobs/a"));
    }

    #[tokio::test]
    async fn test_forwards_puts_and_deletes() {
        let (store, watcher) = setup();
        let mut handle = watcher.watch("/jobs/").await.unwrap();

        store.put("/jobs/1", b"{}".to_vec(), None).await.unwrap();
        store.delete("/jobs/1", false).await.unwrap();

        assert!(matches!(handle.recv().await, Some(WatchNotification::Put(kv)) if kv.key == "/jobs/1"));
        assert!(matches!(handle.recv().await, Some(WatchNotification::Delete(kv)) if kv.key == "/jobs/1"));
    }

    #[tokio::test]
    async fn test_unwatch_cancels_and_allows_rewatch() {
        let (_store, watcher) = setup();
        let mut handle = watcher.watch("/jobs/").await.unwrap();

        assert_ok!(watcher.unwatch("/jobs/").await);
        assert!(handle.recv().await.is_none());
        assert!(!watcher.is_watching("/jobs/").await);

        assert_ok!(watcher.watch("/jobs/").await);
        assert_eq!(watcher.paths().await, vec!["/jobs/".to_string()]);
    }

    #[tokio::test]
    async fn test_get_and_watch_delivers_later_writes_once() {
        let (store, watcher) = setup();
        store.put("/q/a", b"1".to_vec(), None).await.unwrap();

        let (snapshot, mut handle) = watcher.get_and_watch("/q/a").await.unwrap();
        assert_eq!(snapshot.first().unwrap().value, b"1");

        store.put("/q/a", b"2".to_vec(), None).await.unwrap();
        match handle.recv().await {
            Some(WatchNotification::Put(kv)) => assert_eq!(kv.value, b"2"),
            other => panic!("unexpected {:?}", other),
        }

        // The initial value is not replayed
        let next = tokio::time::timeout(std::time::Duration::from_millis(50), handle.recv()).await;
        assert_err!(next);
    }

    #[tokio::test]
    async fn test_stream_error_is_reported_and_watch_survives() {
        let store = Arc::new(FaultyStore {
            watch_errors: 1,
            ..FaultyStore::default()
        });
        let watcher = Watcher::new(store.clone());
        let mut handle = watcher.watch("/jobs/").await.unwrap();

        match handle.recv().await {
            Some(WatchNotification::Error { path, error }) => {
                assert_eq!(path, "/jobs/");
                assert!(error.is_retryable());
            }
            other => panic!("expected error, got {:?}", other),
        }

        store.put("/jobs/1", b"{}".to_vec(), None).await.unwrap();
        assert!(matches!(handle.recv().await, Some(WatchNotification::Put(kv)) if kv.key == "/jobs/1"));
        assert!(watcher.is_watching("/jobs/").await);
    }
}
