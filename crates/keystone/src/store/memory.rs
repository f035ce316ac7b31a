//! In-process store backend.
//!
//! Models the store semantics the coordination layer relies on: a global
//! revision, per-key create/mod revisions and versions, TTL leases whose
//! expiry deletes attached keys, TTL locks, and a bounded history so
//! watches can start from a past revision. Expiry is evaluated lazily on
//! every call.

use async_trait::async_trait;
use keystone_common::constants::{DEFAULT_WATCH_BUFFER, MEMORY_HISTORY_CAPACITY};
use keystone_common::{EventKind, KeyValue, KeystoneError, LeaseId, Result, sort_and_limit};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::Instant;

use super::{EventStream, KvStore, LockHandle, RangeOptions, RangeResponse, StoreEvent, lock_token};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    create_revision: i64,
    mod_revision: i64,
    version: i64,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

#[derive(Debug)]
struct LockEntry {
    token: String,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    revision: i64,
    data: BTreeMap<String, Entry>,
    history: VecDeque<StoreEvent>,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease: LeaseId,
    locks: HashMap<String, LockEntry>,
}

/// Single-process [`KvStore`]; share it behind an `Arc` to model a fleet
pub struct InMemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<StoreEvent>,
    watch_buffer: usize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(MEMORY_HISTORY_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events,
            watch_buffer: DEFAULT_WATCH_BUFFER,
        }
    }

    /// Current store revision
    pub async fn revision(&self) -> i64 {
        self.state.lock().await.revision
    }

    /// Expire a lease immediately, as if its TTL had elapsed without a
    /// keep-alive. Returns false when the lease was already gone.
    pub async fn expire_lease(&self, lease: LeaseId) -> bool {
        let mut state = self.state.lock().await;
        self.drop_lease(&mut state, lease)
    }

    fn emit(&self, state: &mut State, event: StoreEvent) {
        if state.history.len() == MEMORY_HISTORY_CAPACITY {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn remove_key(&self, state: &mut State, key: &str) -> bool {
        let Some(entry) = state.data.remove(key) else {
            return false;
        };
        if let Some(lease) = entry.lease.and_then(|id| state.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
        state.revision += 1;
        let event = StoreEvent {
            kind: EventKind::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: Vec::new(),
                create_revision: entry.create_revision,
                mod_revision: state.revision,
                version: 0,
                lease: entry.lease,
            },
        };
        self.emit(state, event);
        true
    }

    fn drop_lease(&self, state: &mut State, lease: LeaseId) -> bool {
        let Some(entry) = state.leases.remove(&lease) else {
            return false;
        };
        for key in entry.keys {
            self.remove_key(state, &key);
        }
        true
    }

    fn expire(&self, state: &mut State) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            tracing::debug!(lease, "Lease expired");
            self.drop_lease(state, lease);
        }
        state.locks.retain(|_, l| l.deadline > now);
    }
}

fn to_kv(key: &str, entry: &Entry) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: entry.value.clone(),
        create_revision: entry.create_revision,
        mod_revision: entry.mod_revision,
        version: entry.version,
        lease: entry.lease,
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn range(&self, key: &str, options: RangeOptions) -> Result<RangeResponse> {
        let mut state = self.state.lock().await;
        self.expire(&mut state);

        let mut kvs: Vec<KeyValue> = if options.prefix {
            state
                .data
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, e)| to_kv(k, e))
                .collect()
        } else {
            state.data.get(key).map(|e| to_kv(key, e)).into_iter().collect()
        };

        match options.sort {
            Some((target, order)) => sort_and_limit(&mut kvs, target, order, options.limit),
            None => kvs.truncate(options.limit.unwrap_or(usize::MAX)),
        }

        Ok(RangeResponse {
            revision: state.revision,
            kvs,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64> {
        let mut state = self.state.lock().await;
        self.expire(&mut state);

        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(KeystoneError::LeaseNotFound(id));
            }
        }

        state.revision += 1;
        let revision = state.revision;
        let previous = state.data.get(key).cloned();

        if let Some(old) = previous.as_ref().and_then(|e| e.lease) {
            if Some(old) != lease {
                if let Some(l) = state.leases.get_mut(&old) {
                    l.keys.remove(key);
                }
            }
        }
        if let Some(l) = lease.and_then(|id| state.leases.get_mut(&id)) {
            l.keys.insert(key.to_string());
        }

        let entry = Entry {
            value,
            create_revision: previous.as_ref().map_or(revision, |e| e.create_revision),
            mod_revision: revision,
            version: previous.as_ref().map_or(1, |e| e.version + 1),
            lease,
        };
        let event = StoreEvent {
            kind: EventKind::Put,
            kv: to_kv(key, &entry),
        };
        state.data.insert(key.to_string(), entry);
        self.emit(&mut state, event);

        Ok(revision)
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<u64> {
        let mut state = self.state.lock().await;
        self.expire(&mut state);

        let keys: Vec<String> = if prefix {
            state
                .data
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, _)| k.clone())
                .collect()
        } else {
            vec![key.to_string()]
        };

        let mut deleted = 0;
        for k in keys {
            if self.remove_key(&mut state, &k) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn watch(&self, prefix: &str, start_revision: Option<i64>) -> Result<EventStream> {
        let (tx, rx) = mpsc::channel(self.watch_buffer);
        let prefix = prefix.to_string();

        // Subscribe under the state lock so replay and live delivery meet exactly
        let state = self.state.lock().await;
        let mut live = self.events.subscribe();
        let mut backlog = Vec::new();
        let mut compacted = false;

        if let Some(start) = start_revision {
            // History starts at revision 1 until the ring buffer wraps
            compacted = state
                .history
                .front()
                .is_some_and(|e| e.revision() > 1 && start < e.revision());
            backlog = state
                .history
                .iter()
                .filter(|e| e.revision() >= start && e.kv.key.starts_with(&prefix))
                .cloned()
                .collect();
        }
        drop(state);

        tokio::spawn(async move {
            if compacted {
                let err = KeystoneError::Store("requested revision has been compacted".into());
                if tx.send(Err(err)).await.is_err() {
                    return;
                }
            }
            for event in backlog {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            loop {
                let item = match live.recv().await {
                    Ok(event) if event.kv.key.starts_with(&prefix) => Ok(event),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(missed)) => Err(KeystoneError::Store(
                        format!("watch lagged, {} events dropped", missed),
                    )),
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId> {
        let mut state = self.state.lock().await;
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<bool> {
        let mut state = self.state.lock().await;
        self.expire(&mut state);
        match state.leases.get_mut(&lease) {
            Some(entry) => {
                entry.deadline = Instant::now() + entry.ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock().await;
        self.drop_lease(&mut state, lease);
        Ok(())
    }

    async fn lock(&self, name: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        let mut state = self.state.lock().await;
        self.expire(&mut state);
        if state.locks.contains_key(name) {
            return Ok(None);
        }
        let token = lock_token();
        state.locks.insert(
            name.to_string(),
            LockEntry {
                token: token.clone(),
                deadline: Instant::now() + ttl,
            },
        );
        Ok(Some(LockHandle {
            name: name.to_string(),
            token,
        }))
    }

    async fn unlock(&self, handle: &LockHandle) -> Result<()> {
        let mut state = self.state.lock().await;
        if state
            .locks
            .get(&handle.name)
            .is_some_and(|l| l.token == handle.token)
        {
            state.locks.remove(&handle.name);
        }
        Ok(())
    }
}
