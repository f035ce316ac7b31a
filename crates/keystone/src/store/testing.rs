//! In-memory store with injectable faults, for tests.

use async_trait::async_trait;
use keystone_common::{KeystoneError, LeaseId, Result};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{EventStream, InMemoryStore, KvStore, LockHandle, RangeOptions, RangeResponse};

#[derive(Default)]
pub(crate) struct FaultyStore {
    pub inner: InMemoryStore,
    /// Locks whose name contains this fragment fail with a store error
    pub fail_locks_matching: Option<&'static str>,
    pub fail_unlock: bool,
    /// Latency added to every lock attempt
    pub lock_delay: Duration,
    /// Store errors each watch stream yields before its first event
    pub watch_errors: usize,
}

fn refused() -> KeystoneError {
    KeystoneError::Store("connection refused".into())
}

#[async_trait]
impl KvStore for FaultyStore {
    async fn range(&self, key: &str, options: RangeOptions) -> Result<RangeResponse> {
        self.inner.range(key, options).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64> {
        self.inner.put(key, value, lease).await
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<u64> {
        self.inner.delete(key, prefix).await
    }

    async fn watch(&self, prefix: &str, start_revision: Option<i64>) -> Result<EventStream> {
        let mut events = self.inner.watch(prefix, start_revision).await?;
        let errors = self.watch_errors;
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            for _ in 0..errors {
                if tx.send(Err(refused())).await.is_err() {
                    return;
                }
            }
            while let Some(item) = events.recv().await {
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId> {
        self.inner.lease_grant(ttl).await
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<bool> {
        self.inner.lease_keep_alive(lease).await
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<()> {
        self.inner.lease_revoke(lease).await
    }

    async fn lock(&self, name: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        if !self.lock_delay.is_zero() {
            tokio::time::sleep(self.lock_delay).await;
        }
        if self.fail_locks_matching.is_some_and(|f| name.contains(f)) {
            return Err(refused());
        }
        self.inner.lock(name, ttl).await
    }

    async fn unlock(&self, handle: &LockHandle) -> Result<()> {
        if self.fail_unlock {
            return Err(refused());
        }
        self.inner.unlock(handle).await
    }
}
