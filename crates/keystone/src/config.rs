//! Configuration management for Keystone.

use keystone_common::constants::{
    DEFAULT_KEEPALIVE_DIVISOR, DEFAULT_KEY_PREFIX, DEFAULT_LEASE_TTL_SECS, DEFAULT_LIST_LIMIT,
    DEFAULT_LOCK_NAMESPACE, DEFAULT_LOCK_TTL_SECS, DEFAULT_REDIS_URL, DEFAULT_WATCH_BUFFER,
};
use keystone_common::{KeystoneError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::leaser::LeaserConfig;
use crate::locker::LockerConfig;
use crate::service::ServiceSettings;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace for every Redis key the backend owns
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// This node's unique ID (auto-generated if not set)
    #[serde(default = "generate_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub locks: LockSettings,

    #[serde(default)]
    pub leases: LeaseSettings,

    #[serde(default)]
    pub list: ListSettings,

    #[serde(default)]
    pub watch: WatchSettings,
}

/// Lock configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LockSettings {
    /// Key namespace locks are created under
    #[serde(default = "default_lock_namespace")]
    pub namespace: String,

    /// Lock validity in seconds
    #[serde(default = "default_lock_ttl")]
    pub ttl_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            namespace: default_lock_namespace(),
            ttl_secs: default_lock_ttl(),
        }
    }
}

/// Lease configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LeaseSettings {
    /// TTL used by `announce` when none is given
    #[serde(default = "default_lease_ttl")]
    pub default_ttl_secs: u64,

    /// Keep-alives are sent every `ttl / keepalive_divisor`
    #[serde(default = "default_keepalive_divisor")]
    pub keepalive_divisor: u32,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_lease_ttl(),
            keepalive_divisor: default_keepalive_divisor(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListSettings {
    #[serde(default = "default_list_limit")]
    pub default_limit: usize,
}

impl Default for ListSettings {
    fn default() -> Self {
        Self {
            default_limit: default_list_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchSettings {
    /// Per-subscription channel capacity
    #[serde(default = "default_watch_buffer")]
    pub buffer: usize,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            buffer: default_watch_buffer(),
        }
    }
}

// Default value functions
fn default_redis_url() -> String { DEFAULT_REDIS_URL.to_string() }
fn default_key_prefix() -> String { DEFAULT_KEY_PREFIX.to_string() }
fn default_lock_namespace() -> String { DEFAULT_LOCK_NAMESPACE.to_string() }
fn default_lock_ttl() -> u64 { DEFAULT_LOCK_TTL_SECS }
fn default_lease_ttl() -> u64 { DEFAULT_LEASE_TTL_SECS }
fn default_keepalive_divisor() -> u32 { DEFAULT_KEEPALIVE_DIVISOR }
fn default_list_limit() -> usize { DEFAULT_LIST_LIMIT }
fn default_watch_buffer() -> usize { DEFAULT_WATCH_BUFFER }

fn generate_node_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("node-{:08x}", rng.random::<u32>())
}

impl AppConfig {
    /// Load configuration from file, falling back to defaults when the file
    /// does not exist
    pub fn load(config_path: &str) -> Result<Self> {
        if !Path::new(config_path).exists() {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| KeystoneError::Config(format!("{}: {}", config_path, e)))
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.leases.default_ttl_secs)
    }

    pub fn locker(&self) -> LockerConfig {
        LockerConfig {
            namespace: self.locks.namespace.clone(),
            ttl: Duration::from_secs(self.locks.ttl_secs),
        }
    }

    pub fn leaser(&self) -> LeaserConfig {
        LeaserConfig {
            keepalive_divisor: self.leases.keepalive_divisor,
        }
    }

    /// Settings for every `EntityService` built in this process
    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            locker: self.locker(),
            leaser: self.leaser(),
            watch_buffer: self.watch.buffer,
            list_limit: self.list.default_limit,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            node_id: generate_node_id(),
            locks: LockSettings::default(),
            leases: LeaseSettings::default(),
            list: ListSettings::default(),
            watch: WatchSettings::default(),
        }
    }
}
