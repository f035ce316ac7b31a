//! TTL-backed self-registration with transparent repair.
//!
//! A [`Leaser`] owns at most one lease. The registered value is written
//! through the lease and remembered locally; a background task keeps the
//! lease alive, and when the store reports it gone the lease is recreated
//! with the same TTL and path and the last known value. Loss is never
//! surfaced to the caller.

use keystone_common::constants::DEFAULT_KEEPALIVE_DIVISOR;
use keystone_common::{KeystoneError, LeaseId, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::codec;
use crate::store::{RangeOptions, SharedStore};

/// Leaser settings
#[derive(Debug, Clone)]
pub struct LeaserConfig {
    /// Keep-alives are sent every `ttl / keepalive_divisor`
    pub keepalive_divisor: u32,
}

impl Default for LeaserConfig {
    fn default() -> Self {
        Self {
            keepalive_divisor: DEFAULT_KEEPALIVE_DIVISOR,
        }
    }
}

/// Result of [`Leaser::create`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Created(LeaseId),
    /// A live lease already exists; nothing was written
    Conflict,
}

/// Result of [`Leaser::update`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Written,
    /// Remembered but not written yet; the next repair will write it
    Deferred(String),
    /// Nothing registered
    NoLease,
}

#[derive(Debug)]
struct ActiveLease {
    id: LeaseId,
    ttl: Duration,
    path: String,
    value: Value,
}

struct Shared {
    store: SharedStore,
    slot: Mutex<Option<ActiveLease>>,
    recreations: AtomicU64,
}

impl Shared {
    /// Grant a fresh lease and rewrite the last value through it
    async fn recreate(&self, active: &mut ActiveLease) -> Result<()> {
        let raw = codec::encode(&active.value)?;
        let lease = self.store.lease_grant(active.ttl).await?;
        if let Err(e) = self.store.put(&active.path, raw, Some(lease)).await {
            if let Err(revoke_err) = self.store.lease_revoke(lease).await {
                tracing::debug!(lease, error = %revoke_err, "Orphan lease revoke failed");
            }
            return Err(e);
        }

        tracing::info!(
            path = %active.path,
            old_lease = active.id,
            new_lease = lease,
            "Lease recreated"
        );
        active.id = lease;
        self.recreations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// One keep-alive round. Returns false once nothing is registered.
    async fn tick(&self) -> bool {
        let mut slot = self.slot.lock().await;
        let Some(active) = slot.as_mut() else {
            return false;
        };

        match self.store.lease_keep_alive(active.id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(path = %active.path, lease = active.id, "Lease lost");
                if let Err(e) = self.recreate(active).await {
                    tracing::warn!(path = %active.path, error = %e, "Lease recreation failed");
                }
            }
            Err(e) => {
                tracing::warn!(path = %active.path, lease = active.id, error = %e, "Keep-alive failed");
            }
        }
        true
    }
}

/// Self-registration manager holding a single lease
pub struct Leaser {
    shared: Arc<Shared>,
    config: LeaserConfig,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl Leaser {
    pub fn new(store: SharedStore) -> Self {
        Self::with_config(store, LeaserConfig::default())
    }

    pub fn with_config(store: SharedStore, config: LeaserConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                slot: Mutex::new(None),
                recreations: AtomicU64::new(0),
            }),
            config,
            keepalive: Mutex::new(None),
        }
    }

    /// Register `value` at `path` under a new `ttl` lease
    pub async fn create<T: Serialize + ?Sized>(
        &self,
        ttl: Duration,
        path: &str,
        value: &T,
    ) -> Result<LeaseOutcome> {
        let value = serde_json::to_value(value)?;
        let mut slot = self.shared.slot.lock().await;
        if let Some(active) = slot.as_ref() {
            tracing::debug!(path = %path, lease = active.id, "Cannot register twice");
            return Ok(LeaseOutcome::Conflict);
        }

        let store = &self.shared.store;
        let lease = store.lease_grant(ttl).await?;
        if let Err(e) = store.put(path, codec::encode(&value)?, Some(lease)).await {
            if let Err(revoke_err) = store.lease_revoke(lease).await {
                tracing::debug!(lease, error = %revoke_err, "Orphan lease revoke failed");
            }
            return Err(e);
        }

        *slot = Some(ActiveLease {
            id: lease,
            ttl,
            path: path.to_string(),
            value,
        });
        drop(slot);

        let interval = (ttl / self.config.keepalive_divisor.max(1)).max(Duration::from_millis(10));
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !shared.tick().await {
                    break;
                }
            }
        });
        if let Some(previous) = self.keepalive.lock().await.replace(task) {
            previous.abort();
        }

        tracing::info!(path = %path, lease, ttl = ?ttl, "Registered");
        Ok(LeaseOutcome::Created(lease))
    }

    /// Remember `value` and write it through the current lease.
    ///
    /// Write failures are not errors: the value is kept and written by the
    /// next repair. A lease found missing here is repaired immediately.
    pub async fn update<T: Serialize + ?Sized>(&self, value: &T) -> Result<UpdateOutcome> {
        let value = serde_json::to_value(value)?;
        let raw = codec::encode(&value)?;

        let mut slot = self.shared.slot.lock().await;
        let Some(active) = slot.as_mut() else {
            return Ok(UpdateOutcome::NoLease);
        };
        active.value = value;

        let written = self.shared.store.put(&active.path, raw, Some(active.id)).await;
        match written {
            Ok(_) => Ok(UpdateOutcome::Written),
            Err(KeystoneError::LeaseNotFound(_)) => {
                tracing::warn!(path = %active.path, lease = active.id, "Lease lost");
                match self.shared.recreate(active).await {
                    Ok(()) => Ok(UpdateOutcome::Written),
                    Err(e) => {
                        tracing::warn!(path = %active.path, error = %e, "Lease recreation failed");
                        Ok(UpdateOutcome::Deferred(e.to_string()))
                    }
                }
            }
            Err(e) => {
                tracing::warn!(path = %active.path, error = %e, "Lease update failed");
                Ok(UpdateOutcome::Deferred(e.to_string()))
            }
        }
    }

    /// Run one keep-alive round now
    pub async fn keep_alive(&self) -> bool {
        self.shared.tick().await
    }

    /// Read and decode a single path
    pub async fn get(&self, path: &str) -> Result<Option<Value>> {
        let kv = self
            .shared
            .store
            .range(path, RangeOptions::single())
            .await?
            .first();
        Ok(kv.map(|kv| codec::decode(&kv.value)))
    }

    /// Read and decode everything under `prefix`
    pub async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let response = self.shared.store.range(prefix, RangeOptions::prefix()).await?;
        Ok(response
            .kvs
            .into_iter()
            .map(|kv| {
                let value = codec::decode(&kv.value);
                (kv.key, value)
            })
            .collect())
    }

    /// Stop keeping the lease alive; the registration lapses after its TTL.
    /// Returns false when nothing was registered.
    pub async fn release(&self) -> bool {
        self.stop_keepalive().await;
        let released = self.shared.slot.lock().await.take();
        if let Some(active) = &released {
            tracing::info!(path = %active.path, lease = active.id, "Lease released");
        }
        released.is_some()
    }

    /// Revoke the lease now; the registered path disappears immediately.
    /// Returns false when nothing was registered.
    pub async fn revoke(&self) -> Result<bool> {
        self.stop_keepalive().await;
        let Some(active) = self.shared.slot.lock().await.take() else {
            return Ok(false);
        };
        self.shared.store.lease_revoke(active.id).await?;
        tracing::info!(path = %active.path, lease = active.id, "Lease revoked");
        Ok(true)
    }

    pub async fn is_live(&self) -> bool {
        self.shared.slot.lock().await.is_some()
    }

    /// Id of the current lease, which changes after a repair
    pub async fn lease_id(&self) -> Option<LeaseId> {
        self.shared.slot.lock().await.as_ref().map(|a| a.id)
    }

    /// How many times a lost lease has been recreated
    pub fn recreations(&self) -> u64 {
        self.shared.recreations.load(Ordering::Relaxed)
    }

    async fn stop_keepalive(&self) {
        if let Some(task) = self.keepalive.lock().await.take() {
            task.abort();
        }
    }
}

impl Drop for Leaser {
    fn drop(&mut self) {
        if let Some(task) = self.keepalive.get_mut().take() {
            task.abort();
        }
    }
}
