//! Key-value store seam.
//!
//! The coordination layer only needs a handful of primitives from the
//! consistent store underneath it: single-key and prefix reads with
//! revision metadata, puts optionally bound to a lease, deletes, prefix
//! watches that can start at a revision, TTL leases, and TTL locks.
//!
//! Backends:
//! - [`InMemoryStore`] - single-process store for tests and embedding
//! - [`RedisStore`] - Redis-backed store shared by a fleet

mod memory;
mod redis_backend;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::InMemoryStore;
pub use redis_backend::RedisStore;

use async_trait::async_trait;
use keystone_common::{EventKind, KeyValue, LeaseId, Result, SortOrder, SortTarget};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Shared handle to a store backend
pub type SharedStore = Arc<dyn KvStore>;

/// Events delivered by a store watch; errors do not end the stream
pub type EventStream = mpsc::Receiver<Result<StoreEvent>>;

/// Read options
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeOptions {
    /// Treat the key as a prefix
    pub prefix: bool,
    /// Ordering applied before `limit`; store order (by key) when unset
    pub sort: Option<(SortTarget, SortOrder)>,
    pub limit: Option<usize>,
}

impl RangeOptions {
    pub fn single() -> Self {
        Self::default()
    }

    pub fn prefix() -> Self {
        Self {
            prefix: true,
            ..Self::default()
        }
    }

    pub fn sorted(mut self, target: SortTarget, order: SortOrder) -> Self {
        self.sort = Some((target, order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Read result, stamped with the store revision it was served at
#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    pub revision: i64,
    pub kvs: Vec<KeyValue>,
}

impl RangeResponse {
    /// First record, for single-key reads
    pub fn first(self) -> Option<KeyValue> {
        self.kvs.into_iter().next()
    }
}

/// A change observed by a watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: EventKind,
    /// For deletes: the key, an empty value, and the deleting revision
    pub kv: KeyValue,
}

impl StoreEvent {
    pub fn revision(&self) -> i64 {
        self.kv.mod_revision
    }
}

/// Proof of holding a store lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub name: String,
    /// Owner token; release only succeeds for the owner
    pub token: String,
}

/// Primitives consumed from the consistent key-value store
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a key (or prefix). Missing keys yield an empty response, not an error.
    async fn range(&self, key: &str, options: RangeOptions) -> Result<RangeResponse>;

    /// Write a value, optionally attached to a lease. Returns the new revision.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64>;

    /// Delete a key (or prefix). Returns the number of keys removed.
    async fn delete(&self, key: &str, prefix: bool) -> Result<u64>;

    /// Watch every key under `prefix`, optionally replaying from `start_revision`
    async fn watch(&self, prefix: &str, start_revision: Option<i64>) -> Result<EventStream>;

    /// Create a TTL lease
    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId>;

    /// Refresh a lease. `Ok(false)` means the lease is gone.
    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<bool>;

    /// Drop a lease and every key attached to it
    async fn lease_revoke(&self, lease: LeaseId) -> Result<()>;

    /// Try to take a named lock; `Ok(None)` when someone else holds it
    async fn lock(&self, name: &str, ttl: Duration) -> Result<Option<LockHandle>>;

    /// Release a lock held through `handle`
    async fn unlock(&self, handle: &LockHandle) -> Result<()>;
}

/// Random owner token for locks
pub(crate) fn lock_token() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("{:016x}{:016x}", rng.random::<u64>(), rng.random::<u64>())
}
