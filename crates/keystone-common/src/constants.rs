//! Shared constants for Keystone components.

/// Default Redis connection URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default namespace for every key the Redis backend writes
pub const DEFAULT_KEY_PREFIX: &str = "keystone";

/// Path separator for template paths
pub const PATH_SEPARATOR: char = '/';

/// Namespace under which "single winner" locks are taken
pub const DEFAULT_LOCK_NAMESPACE: &str = "/locks";

/// Lock TTL in seconds (bounds staleness when a holder dies without releasing)
pub const DEFAULT_LOCK_TTL_SECS: u64 = 10;

/// Registration lease TTL in seconds
pub const DEFAULT_LEASE_TTL_SECS: u64 = 10;

/// Keep-alives are sent every `ttl / KEEPALIVE_DIVISOR`
pub const DEFAULT_KEEPALIVE_DIVISOR: u32 = 3;

/// Result cap for `list` when the caller does not give one
pub const DEFAULT_LIST_LIMIT: usize = 1000;

/// Buffered notifications per watch subscription
pub const DEFAULT_WATCH_BUFFER: usize = 256;

/// Events kept by the in-memory store for revision-anchored watches
pub const MEMORY_HISTORY_CAPACITY: usize = 10_000;

/// Approximate cap on the Redis event stream length
pub const EVENT_STREAM_MAXLEN: usize = 100_000;

/// Redis key suffixes (each is appended to the configured key prefix)
pub mod redis_keys {
    /// Global revision counter: {prefix}:rev
    pub const REVISION: &str = ":rev";

    /// Per-key record hash: {prefix}:kv:{key}
    pub const KV_PREFIX: &str = ":kv:";

    /// Lexicographic key index (sorted set): {prefix}:index
    pub const INDEX: &str = ":index";

    /// Change event stream: {prefix}:events
    pub const EVENTS: &str = ":events";

    /// Lease id sequence: {prefix}:lease:seq
    pub const LEASE_SEQ: &str = ":lease:seq";

    /// Lease liveness key: {prefix}:lease:{id}
    pub const LEASE_PREFIX: &str = ":lease:";

    /// Keys attached to a lease: {prefix}:lease:{id}:keys
    pub const LEASE_KEYS_SUFFIX: &str = ":keys";

    /// Lock ownership key: {prefix}:lock:{name}
    pub const LOCK_PREFIX: &str = ":lock:";
}

/// Well-known entity templates
pub mod templates {
    /// Self-announcing service instances
    pub const DISCOVERY: &str = "/discovery/{serviceName}/{instanceId}";

    /// Per-algorithm work queues
    pub const ALGORITHM_QUEUE: &str = "/algorithms/queue/{name}";

    /// Tasks of a running job
    pub const JOB_TASKS: &str = "/jobs/tasks/{jobId}/{taskId}";
}
