//! Redis-backed store.
//!
//! Layout (all keys under the configured prefix):
//! - `{p}:rev` global revision counter
//! - `{p}:kv:{key}` hash with `v` (value), `c` (create rev), `m` (mod rev),
//!   `ver` (version), `l` (lease id or empty)
//! - `{p}:index` sorted set of live keys, all at score 0 for lex ranges
//! - `{p}:events` stream; entry ids are `{revision}-0`
//! - `{p}:lease:{id}` lease liveness key holding its TTL in ms
//! - `{p}:lease:{id}:keys` set of keys attached to the lease
//! - `{p}:lock:{name}` lock owner token
//!
//! Every mutation is a Lua script, so a revision bump, the record update
//! and the stream append are atomic. Keys attached to a lease carry the
//! lease TTL themselves, so a lease that lapses without a revoke lets its
//! record hashes expire inside Redis. The index entry and the delete event
//! are settled later: ranges drop and announce such keys as they meet them,
//! and every watch sweeps its prefix every [`WATCH_SWEEP`].

use async_trait::async_trait;
use keystone_common::constants::{EVENT_STREAM_MAXLEN, redis_keys};
use keystone_common::{EventKind, KeyValue, KeystoneError, LeaseId, Result, sort_and_limit};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{EventStream, KvStore, LockHandle, RangeOptions, RangeResponse, StoreEvent, lock_token};

/// Shared removal routine; expects KEYS[1]=rev, KEYS[2]=index, KEYS[3]=events,
/// ARGV[1]=kv prefix, ARGV[2]=stream maxlen, ARGV[3]=lease prefix
const REMOVE_FN: &str = r#"
local function remove(k)
  local h = ARGV[1] .. k
  local rec = redis.call('HMGET', h, 'c', 'l')
  redis.call('ZREM', KEYS[2], k)
  if not rec[1] then
    return 0
  end
  local rev = redis.call('INCR', KEYS[1])
  redis.call('DEL', h)
  local lease = rec[2] or ''
  if lease ~= '' then
    redis.call('SREM', ARGV[3] .. lease .. ':keys', k)
  end
  redis.call('XADD', KEYS[3], 'MAXLEN', '~', ARGV[2], rev .. '-0',
    't', 'delete', 'k', k, 'v', '', 'c', rec[1], 'm', rev, 'ver', 0, 'l', lease)
  return 1
end
"#;

/// KEYS: rev, index, events. ARGV: kv prefix, maxlen, lease prefix, mode, key
const DELETE_BODY: &str = r#"
local keys
if ARGV[4] == 'prefix' then
  keys = redis.call('ZRANGEBYLEX', KEYS[2], '[' .. ARGV[5], '[' .. ARGV[5] .. '\255')
else
  keys = { ARGV[5] }
end
local deleted = 0
for _, k in ipairs(keys) do
  deleted = deleted + remove(k)
end
return deleted
"#;

/// KEYS: rev, index, events, lease key, lease keys set. ARGV: kv prefix, maxlen, lease prefix
const REVOKE_BODY: &str = r#"
for _, k in ipairs(redis.call('SMEMBERS', KEYS[5])) do
  remove(k)
end
redis.call('DEL', KEYS[4], KEYS[5])
return 1
"#;

/// KEYS: rev, kv hash, index, events, lease key, lease keys set.
/// ARGV: key, value, lease id or '', maxlen, lease prefix
const PUT_SCRIPT: &str = r#"
local lease = ARGV[3]
if lease ~= '' and redis.call('EXISTS', KEYS[5]) == 0 then
  return -1
end
local rev = redis.call('INCR', KEYS[1])
local create = redis.call('HGET', KEYS[2], 'c')
local old = redis.call('HGET', KEYS[2], 'l')
if old and old ~= '' and old ~= lease then
  redis.call('SREM', ARGV[5] .. old .. ':keys', ARGV[1])
end
if not create then
  create = rev
end
local ver = redis.call('HINCRBY', KEYS[2], 'ver', 1)
redis.call('HSET', KEYS[2], 'v', ARGV[2], 'c', create, 'm', rev, 'l', lease)
redis.call('PERSIST', KEYS[2])
if lease ~= '' then
  redis.call('SADD', KEYS[6], ARGV[1])
  local ttl = redis.call('PTTL', KEYS[5])
  if ttl > 0 then
    redis.call('PEXPIRE', KEYS[2], ttl)
    redis.call('PEXPIRE', KEYS[6], ttl)
  end
end
redis.call('ZADD', KEYS[3], 0, ARGV[1])
redis.call('XADD', KEYS[4], 'MAXLEN', '~', ARGV[4], rev .. '-0',
  't', 'put', 'k', ARGV[1], 'v', ARGV[2], 'c', create, 'm', rev, 'ver', ver, 'l', lease)
return rev
"#;

/// Index pruning for records whose hash expired with its lease; expects
/// KEYS[1]=rev, KEYS[2]=index, KEYS[3]=events, ARGV[1]=kv prefix, ARGV[2]=stream maxlen
const PRUNE_FN: &str = r#"
local function live(k)
  if redis.call('EXISTS', ARGV[1] .. k) == 1 then
    return true
  end
  if redis.call('ZREM', KEYS[2], k) == 1 then
    local rev = redis.call('INCR', KEYS[1])
    redis.call('XADD', KEYS[3], 'MAXLEN', '~', ARGV[2], rev .. '-0',
      't', 'delete', 'k', k, 'v', '', 'c', 0, 'm', rev, 'ver', 0, 'l', '')
  end
  return false
end
"#;

/// KEYS: rev, index, events. ARGV: kv prefix, maxlen, mode, key.
/// Returns a flat list: revision, then (key, value, create, mod, version, lease) per record.
const RANGE_BODY: &str = r#"
local out = {}
local keys
if ARGV[3] == 'prefix' then
  keys = redis.call('ZRANGEBYLEX', KEYS[2], '[' .. ARGV[4], '[' .. ARGV[4] .. '\255')
else
  keys = { ARGV[4] }
end
for _, k in ipairs(keys) do
  local rec = redis.call('HMGET', ARGV[1] .. k, 'v', 'c', 'm', 'ver', 'l')
  if live(k) and rec[2] then
    table.insert(out, k)
    table.insert(out, rec[1] or '')
    table.insert(out, rec[2])
    table.insert(out, rec[3] or rec[2])
    table.insert(out, rec[4] or '1')
    table.insert(out, rec[5] or '')
  end
end
table.insert(out, 1, tostring(redis.call('GET', KEYS[1]) or 0))
return out
"#;

/// KEYS: rev, index, events. ARGV: kv prefix, maxlen, key prefix.
/// Returns the number of expired keys removed from the index.
const SWEEP_BODY: &str = r#"
local pruned = 0
for _, k in ipairs(redis.call('ZRANGEBYLEX', KEYS[2], '[' .. ARGV[3], '[' .. ARGV[3] .. '\255')) do
  if not live(k) then
    pruned = pruned + 1
  end
end
return pruned
"#;

/// KEYS: lease key, lease keys set. ARGV: kv prefix
const KEEPALIVE_SCRIPT: &str = r#"
local ttl = redis.call('GET', KEYS[1])
if not ttl then
  return 0
end
redis.call('PEXPIRE', KEYS[1], ttl)
redis.call('PEXPIRE', KEYS[2], ttl)
for _, k in ipairs(redis.call('SMEMBERS', KEYS[2])) do
  redis.call('PEXPIRE', ARGV[1] .. k, ttl)
end
return 1
"#;

/// KEYS: lock key. ARGV: token
const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const RECORD_WIDTH: usize = 6;
const WATCH_BLOCK_MS: usize = 1000;
const WATCH_BATCH: usize = 128;
const WATCH_RETRY: Duration = Duration::from_secs(1);
const WATCH_SWEEP: Duration = Duration::from_secs(5);

fn store_err(e: redis::RedisError) -> KeystoneError {
    KeystoneError::Store(e.to_string())
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// [`KvStore`] over a shared Redis instance
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    prefix: String,
    watch_buffer: usize,
    put_script: Script,
    delete_script: Script,
    revoke_script: Script,
    range_script: Script,
    sweep_script: Script,
    keepalive_script: Script,
    unlock_script: Script,
}

impl RedisStore {
    /// Connect with an auto-reconnecting connection manager
    pub async fn connect(redis_url: &str, key_prefix: &str, watch_buffer: usize) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| KeystoneError::Config(format!("invalid Redis URL: {}", e)))?;

        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(store_err)?;

        tracing::debug!(url = %redis_url, prefix = %key_prefix, "Redis store connected");

        Ok(Self {
            client,
            conn,
            prefix: key_prefix.to_string(),
            watch_buffer,
            put_script: Script::new(PUT_SCRIPT),
            delete_script: Script::new(&format!("{}{}", REMOVE_FN, DELETE_BODY)),
            revoke_script: Script::new(&format!("{}{}", REMOVE_FN, REVOKE_BODY)),
            range_script: Script::new(&format!("{}{}", PRUNE_FN, RANGE_BODY)),
            sweep_script: Script::new(&format!("{}{}", PRUNE_FN, SWEEP_BODY)),
            keepalive_script: Script::new(KEEPALIVE_SCRIPT),
            unlock_script: Script::new(UNLOCK_SCRIPT),
        })
    }

    /// Round-trip a PING
    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        result.is_ok()
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    fn kv_prefix(&self) -> String {
        self.key(redis_keys::KV_PREFIX)
    }

    fn lease_prefix(&self) -> String {
        self.key(redis_keys::LEASE_PREFIX)
    }

    fn lease_key(&self, lease: LeaseId) -> String {
        format!("{}{}", self.lease_prefix(), lease)
    }

    fn lease_keys_set(&self, lease: LeaseId) -> String {
        format!("{}{}", self.lease_key(lease), redis_keys::LEASE_KEYS_SUFFIX)
    }
}

fn parse_int(raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| KeystoneError::Store("malformed integer in record".into()))
}

fn parse_lease(raw: &[u8]) -> Result<Option<LeaseId>> {
    if raw.is_empty() {
        Ok(None)
    } else {
        parse_int(raw).map(Some)
    }
}

fn parse_range(reply: Vec<Vec<u8>>) -> Result<RangeResponse> {
    let mut items = reply.into_iter();
    let revision = match items.next() {
        Some(raw) => parse_int(&raw)?,
        None => return Err(KeystoneError::Store("empty range reply".into())),
    };

    let rest: Vec<Vec<u8>> = items.collect();
    let mut kvs = Vec::with_capacity(rest.len() / RECORD_WIDTH);
    for record in rest.chunks_exact(RECORD_WIDTH) {
        kvs.push(KeyValue {
            key: String::from_utf8_lossy(&record[0]).into_owned(),
            value: record[1].clone(),
            create_revision: parse_int(&record[2])?,
            mod_revision: parse_int(&record[3])?,
            version: parse_int(&record[4])?,
            lease: parse_lease(&record[5])?,
        });
    }

    Ok(RangeResponse { revision, kvs })
}

fn parse_event(entry: &redis::streams::StreamId) -> Result<StoreEvent> {
    let field = |name: &str| -> Result<Vec<u8>> {
        entry
            .get::<Vec<u8>>(name)
            .ok_or_else(|| KeystoneError::Store(format!("event {} missing '{}'", entry.id, name)))
    };

    let kind = match field("t")?.as_slice() {
        b"put" => EventKind::Put,
        b"delete" => EventKind::Delete,
        other => {
            return Err(KeystoneError::Store(format!(
                "unknown event type '{}'",
                String::from_utf8_lossy(other)
            )));
        }
    };

    Ok(StoreEvent {
        kind,
        kv: KeyValue {
            key: String::from_utf8_lossy(&field("k")?).into_owned(),
            value: field("v")?,
            create_revision: parse_int(&field("c")?)?,
            mod_revision: parse_int(&field("m")?)?,
            version: parse_int(&field("ver")?)?,
            lease: parse_lease(&field("l")?)?,
        },
    })
}

#[async_trait]
impl KvStore for RedisStore {
    async fn range(&self, key: &str, options: RangeOptions) -> Result<RangeResponse> {
        let mut conn = self.conn.clone();
        let mode = if options.prefix { "prefix" } else { "key" };

        let reply: Vec<Vec<u8>> = self
            .range_script
            .key(self.key(redis_keys::REVISION))
            .key(self.key(redis_keys::INDEX))
            .key(self.key(redis_keys::EVENTS))
            .arg(self.kv_prefix())
            .arg(EVENT_STREAM_MAXLEN)
            .arg(mode)
            .arg(key)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        let mut response = parse_range(reply)?;
        match options.sort {
            Some((target, order)) => {
                sort_and_limit(&mut response.kvs, target, order, options.limit)
            }
            None => response.kvs.truncate(options.limit.unwrap_or(usize::MAX)),
        }
        Ok(response)
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64> {
        let mut conn = self.conn.clone();
        let lease_arg = lease.map(|l| l.to_string()).unwrap_or_default();
        let lease_id = lease.unwrap_or_default();

        let revision: i64 = self
            .put_script
            .key(self.key(redis_keys::REVISION))
            .key(format!("{}{}", self.kv_prefix(), key))
            .key(self.key(redis_keys::INDEX))
            .key(self.key(redis_keys::EVENTS))
            .key(self.lease_key(lease_id))
            .key(self.lease_keys_set(lease_id))
            .arg(key)
            .arg(value)
            .arg(lease_arg)
            .arg(EVENT_STREAM_MAXLEN)
            .arg(self.lease_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        if revision < 0 {
            return Err(KeystoneError::LeaseNotFound(lease_id));
        }
        Ok(revision)
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mode = if prefix { "prefix" } else { "key" };

        let deleted: u64 = self
            .delete_script
            .key(self.key(redis_keys::REVISION))
            .key(self.key(redis_keys::INDEX))
            .key(self.key(redis_keys::EVENTS))
            .arg(self.kv_prefix())
            .arg(EVENT_STREAM_MAXLEN)
            .arg(self.lease_prefix())
            .arg(mode)
            .arg(key)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        Ok(deleted)
    }

    async fn watch(&self, prefix: &str, start_revision: Option<i64>) -> Result<EventStream> {
        let mut conn = self.conn.clone();
        let from = match start_revision {
            Some(revision) => (revision - 1).max(0),
            None => {
                let current: Option<i64> = conn
                    .get(self.key(redis_keys::REVISION))
                    .await
                    .map_err(store_err)?;
                current.unwrap_or(0)
            }
        };

        // XREAD BLOCK parks the connection, so each watch gets its own
        let mut reader = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_err)?;

        let (tx, rx) = mpsc::channel(self.watch_buffer);
        let stream_key = self.key(redis_keys::EVENTS);
        let prefix = prefix.to_string();
        let sweep_script = self.sweep_script.clone();
        let revision_key = self.key(redis_keys::REVISION);
        let index_key = self.key(redis_keys::INDEX);
        let kv_prefix = self.kv_prefix();

        tokio::spawn(async move {
            let mut last_id = format!("{}-0", from);
            let options = StreamReadOptions::default()
                .block(WATCH_BLOCK_MS)
                .count(WATCH_BATCH);
            let mut last_sweep = Instant::now();

            while !tx.is_closed() {
                if last_sweep.elapsed() >= WATCH_SWEEP {
                    last_sweep = Instant::now();
                    // Deletes land on the stream and are read below
                    let swept: redis::RedisResult<u64> = sweep_script
                        .key(revision_key.as_str())
                        .key(index_key.as_str())
                        .key(stream_key.as_str())
                        .arg(kv_prefix.as_str())
                        .arg(EVENT_STREAM_MAXLEN)
                        .arg(prefix.as_str())
                        .invoke_async(&mut conn)
                        .await;
                    match swept {
                        Ok(0) => {}
                        Ok(pruned) => tracing::debug!(prefix = %prefix, pruned, "Swept expired keys"),
                        Err(e) => tracing::warn!(prefix = %prefix, error = %e, "Expiry sweep failed"),
                    }
                }

                let reply: redis::RedisResult<Option<StreamReadReply>> = reader
                    .xread_options(&[stream_key.as_str()], &[last_id.as_str()], &options)
                    .await;

                let reply = match reply {
                    Ok(reply) => reply.unwrap_or_default(),
                    Err(e) => {
                        if tx.send(Err(store_err(e))).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(WATCH_RETRY).await;
                        continue;
                    }
                };

                for entry in reply.keys.iter().flat_map(|k| k.ids.iter()) {
                    last_id = entry.id.clone();
                    let item = match parse_event(entry) {
                        Ok(event) if event.kv.key.starts_with(&prefix) => Ok(event),
                        Ok(_) => continue,
                        Err(e) => Err(e),
                    };
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId> {
        let mut conn = self.conn.clone();
        let id: LeaseId = conn
            .incr(self.key(redis_keys::LEASE_SEQ), 1)
            .await
            .map_err(store_err)?;

        let ms = ttl_millis(ttl);
        let _: () = redis::cmd("SET")
            .arg(self.lease_key(id))
            .arg(ms)
            .arg("PX")
            .arg(ms)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;

        Ok(id)
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let alive: i64 = self
            .keepalive_script
            .key(self.lease_key(lease))
            .key(self.lease_keys_set(lease))
            .arg(self.kv_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        Ok(alive == 1)
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .revoke_script
            .key(self.key(redis_keys::REVISION))
            .key(self.key(redis_keys::INDEX))
            .key(self.key(redis_keys::EVENTS))
            .key(self.lease_key(lease))
            .key(self.lease_keys_set(lease))
            .arg(self.kv_prefix())
            .arg(EVENT_STREAM_MAXLEN)
            .arg(self.lease_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        Ok(())
    }

    async fn lock(&self, name: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        let mut conn = self.conn.clone();
        let token = lock_token();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.key(&format!("{}{}", redis_keys::LOCK_PREFIX, name)))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;

        Ok(acquired.map(|_| LockHandle {
            name: name.to_string(),
            token,
        }))
    }

    async fn unlock(&self, handle: &LockHandle) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .unlock_script
            .key(self.key(&format!("{}{}", redis_keys::LOCK_PREFIX, handle.name)))
            .arg(&handle.token)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        Ok(())
    }
}
