//! # Keystone
//!
//! Coordination primitives over a revisioned key-value store.
//!
//! ## Architecture
//! ```text
//! EntityService ─┬─ PathTemplate   (fields <-> key)
//!                ├─ Watcher        (one subscription per path)
//!                ├─ Locker         (one winner per notification)
//!                └─ Leaser         (self-healing TTL registration)
//!                        ↓
//!                 KvStore (Redis | in-memory)
//! ```
//!
//! ## Modules
//! - `template` - Key templates with named placeholders
//! - `store` - The `KvStore` seam and its backends
//! - `watcher` - Deduplicated prefix watches
//! - `locker` - "First writer wins" notification gate
//! - `leaser` - TTL registration with transparent repair
//! - `service` - Per-entity façade tying the above together
//! - `config` - File/env configuration

pub mod codec;
pub mod config;
pub mod leaser;
pub mod locker;
pub mod service;
pub mod store;
pub mod template;
pub mod watcher;

pub use config::AppConfig;
pub use leaser::{LeaseOutcome, Leaser, LeaserConfig, UpdateOutcome};
pub use locker::{LockKind, LockOutcome, Locker, LockerConfig, ReleaseOutcome};
pub use service::{
    EntityEvent, EntityService, Entry, FieldSchema, ListOptions, Schema, ServiceSettings,
    Subscription, WatchOptions,
};
pub use store::{InMemoryStore, KvStore, RedisStore, SharedStore};
pub use template::PathTemplate;
pub use watcher::{WatchHandle, WatchNotification, Watcher};

pub use keystone_common::{Fields, KeystoneError, Result, fields};
