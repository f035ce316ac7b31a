//! "First writer wins" gate over the store's distributed lock.
//!
//! When several processes watch the same key, each one races to lock
//! `(kind, key)` on every notification; only the winner acts on it.
//! Losing is an ordinary outcome, reported as [`LockOutcome::Contended`].

use keystone_common::constants::{DEFAULT_LOCK_NAMESPACE, DEFAULT_LOCK_TTL_SECS};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::store::{LockHandle, SharedStore};

/// Which notification a lock gates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Change,
    Delete,
}

impl LockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Change => "change",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locker settings
#[derive(Debug, Clone)]
pub struct LockerConfig {
    /// Key namespace all locks live under
    pub namespace: String,
    /// How long an acquired lock stays exclusive
    pub ttl: Duration,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_LOCK_NAMESPACE.to_string(),
            ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
        }
    }
}

/// Result of [`Locker::acquire`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired(LockHandle),
    /// Another process holds the lock
    Contended,
    /// The store could not be asked; treated as a lost race
    Unavailable(String),
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    pub fn handle(&self) -> Option<&LockHandle> {
        match self {
            Self::Acquired(handle) => Some(handle),
            _ => None,
        }
    }
}

/// Result of [`Locker::release`]; local state is forgotten in every case
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotHeld,
    RemoteFailed(String),
}

struct HeldLock {
    handle: LockHandle,
    expires_at: Instant,
}

pub struct Locker {
    store: SharedStore,
    config: LockerConfig,
    held: Mutex<HashMap<String, HeldLock>>,
}

impl Locker {
    pub fn new(store: SharedStore) -> Self {
        Self::with_config(store, LockerConfig::default())
    }

    pub fn with_config(store: SharedStore, config: LockerConfig) -> Self {
        Self {
            store,
            config,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Composite lock name for `(kind, key)`
    pub fn lock_name(&self, kind: LockKind, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.namespace.trim_end_matches('/'),
            kind,
            key.trim_start_matches('/')
        )
    }

    /// Take the lock for `(kind, key)`, or reuse it if this process already holds it
    pub async fn acquire(&self, kind: LockKind, key: &str) -> LockOutcome {
        let name = self.lock_name(kind, key);
        let mut held = self.held.lock().await;

        // Taken before the round trip; the store's TTL starts no earlier
        let now = Instant::now();
        held.retain(|_, lock| lock.expires_at > now);
        if let Some(lock) = held.get(&name) {
            return LockOutcome::Acquired(lock.handle.clone());
        }

        match self.store.lock(&name, self.config.ttl).await {
            Ok(Some(handle)) => {
                tracing::debug!(lock = %name, "Lock acquired");
                held.insert(
                    name,
                    HeldLock {
                        handle: handle.clone(),
                        expires_at: now + self.config.ttl,
                    },
                );
                LockOutcome::Acquired(handle)
            }
            Ok(None) => {
                tracing::trace!(lock = %name, "Lock contended");
                LockOutcome::Contended
            }
            Err(e) => {
                tracing::warn!(lock = %name, error = %e, "Lock acquire failed");
                LockOutcome::Unavailable(e.to_string())
            }
        }
    }

    /// Forget the lock locally and release it remotely on a best-effort basis
    pub async fn release(&self, kind: LockKind, key: &str) -> ReleaseOutcome {
        let name = self.lock_name(kind, key);
        let Some(lock) = self.held.lock().await.remove(&name) else {
            return ReleaseOutcome::NotHeld;
        };

        match self.store.unlock(&lock.handle).await {
            Ok(()) => ReleaseOutcome::Released,
            Err(e) => {
                tracing::warn!(lock = %name, error = %e, "Lock release failed");
                ReleaseOutcome::RemoteFailed(e.to_string())
            }
        }
    }

    /// Names of locks this process currently believes it holds
    pub async fn held(&self) -> Vec<String> {
        let now = Instant::now();
        self.held
            .lock()
            .await
            .iter()
            .filter(|(_, l)| l.expires_at > now)
            .map(|(name, _)| name.clone())
            .collect()
    }
}
