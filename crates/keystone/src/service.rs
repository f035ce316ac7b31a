//! Entity service façade.
//!
//! An [`EntityService`] binds one compiled [`PathTemplate`] and one
//! [`Schema`] to the store, and exposes CRUD, listing, watching and
//! self-registration for that entity type. Entity definitions are plain
//! data: a template string plus a validator.

use keystone_common::constants::{DEFAULT_LIST_LIMIT, DEFAULT_WATCH_BUFFER};
use keystone_common::{Fields, KeystoneError, Result, SortOrder, SortTarget};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::codec;
use crate::leaser::{LeaseOutcome, Leaser, LeaserConfig, UpdateOutcome};
use crate::locker::{LockKind, Locker, LockerConfig};
use crate::store::{RangeOptions, SharedStore};
use crate::template::PathTemplate;
use crate::watcher::{WatchHandle, WatchNotification, Watcher};

/// Input validation for an entity type
pub trait Schema: Send + Sync {
    /// Validate a complete field set addressing one record
    fn validate(&self, fields: &Fields) -> Result<Fields>;

    /// Validate a partial field set addressing a subtree
    fn validate_query(&self, fields: &Fields) -> Result<Fields> {
        Ok(fields.clone())
    }
}

/// Schema requiring a fixed set of non-empty fields
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    required: Vec<String>,
}

impl FieldSchema {
    pub fn new<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
        }
    }

    /// Require every placeholder of `template`
    pub fn from_template(template: &PathTemplate) -> Self {
        Self::new(template.placeholders())
    }
}

impl Schema for FieldSchema {
    fn validate(&self, fields: &Fields) -> Result<Fields> {
        for name in &self.required {
            match fields.get(name) {
                Some(value) if !value.is_empty() => {}
                Some(_) => return Err(KeystoneError::validation(name, "must not be empty")),
                None => return Err(KeystoneError::validation(name, "is required")),
            }
        }
        self.validate_query(fields)
    }

    fn validate_query(&self, fields: &Fields) -> Result<Fields> {
        if let Some((name, _)) = fields.iter().find(|(_, v)| v.is_empty()) {
            return Err(KeystoneError::validation(name, "must not be empty"));
        }
        Ok(fields.clone())
    }
}

/// Listing options
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// Attribute to order by (default: modification revision)
    pub order: SortTarget,
    /// Direction (default: newest first)
    pub sort: SortOrder,
    /// Maximum number of records; the service's configured cap when unset
    pub limit: Option<usize>,
}

/// Watch options
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    /// Gate every notification behind the store lock so exactly one
    /// watcher across the fleet receives it
    pub lock: bool,
}

/// A decoded record
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: String,
    /// Fields recovered from the key
    pub fields: Fields,
    pub value: Value,
}

/// Application-level notification
#[derive(Debug)]
pub enum EntityEvent {
    Change(Entry),
    /// `value` is `Null` for deletes
    Delete(Entry),
    Error { path: String, error: KeystoneError },
}

/// Receiving end of an entity watch; closes when the path is unwatched
#[derive(Debug)]
pub struct Subscription {
    path: String,
    events: mpsc::Receiver<EntityEvent>,
}

impl Subscription {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn recv(&mut self) -> Option<EntityEvent> {
        self.events.recv().await
    }
}

/// Tunables shared by every service built from one configuration
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub locker: LockerConfig,
    pub leaser: LeaserConfig,
    pub watch_buffer: usize,
    pub list_limit: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            locker: LockerConfig::default(),
            leaser: LeaserConfig::default(),
            watch_buffer: DEFAULT_WATCH_BUFFER,
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }
}

/// Generic service for one entity type
pub struct EntityService<S = FieldSchema> {
    template: Arc<PathTemplate>,
    schema: S,
    store: SharedStore,
    watcher: Watcher,
    locker: Arc<Locker>,
    leaser: Leaser,
    settings: ServiceSettings,
}

impl EntityService<FieldSchema> {
    /// Service whose schema requires every template placeholder
    pub fn for_template(store: SharedStore, template: &str) -> Result<Self> {
        let template = PathTemplate::compile(template)?;
        let schema = FieldSchema::from_template(&template);
        Ok(Self::new(store, template, schema))
    }
}

impl<S: Schema> EntityService<S> {
    pub fn new(store: SharedStore, template: PathTemplate, schema: S) -> Self {
        Self::with_settings(store, template, schema, ServiceSettings::default())
    }

    pub fn with_settings(
        store: SharedStore,
        template: PathTemplate,
        schema: S,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            template: Arc::new(template),
            schema,
            watcher: Watcher::with_buffer(store.clone(), settings.watch_buffer),
            locker: Arc::new(Locker::with_config(store.clone(), settings.locker.clone())),
            leaser: Leaser::with_config(store.clone(), settings.leaser.clone()),
            store,
            settings,
        }
    }

    pub fn template(&self) -> &PathTemplate {
        &self.template
    }

    pub fn watcher(&self) -> &Watcher {
        &self.watcher
    }

    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    pub fn leaser(&self) -> &Leaser {
        &self.leaser
    }

    /// Path of one record
    pub fn path(&self, fields: &Fields) -> Result<String> {
        let fields = self.schema.validate(fields)?;
        self.template.format(&fields)
    }

    /// Path of the subtree addressed by a partial field set
    pub fn prefix(&self, fields: &Fields) -> Result<String> {
        let fields = self.schema.validate_query(fields)?;
        self.template.prefix(&fields)
    }

    pub async fn get(&self, fields: &Fields) -> Result<Option<Value>> {
        let path = self.path(fields)?;
        let kv = self.store.range(&path, RangeOptions::single()).await?.first();
        Ok(kv.map(|kv| codec::decode(&kv.value)))
    }

    /// Write `data` at the record path; returns the store revision
    pub async fn set<T: Serialize + ?Sized>(&self, fields: &Fields, data: &T) -> Result<i64> {
        let path = self.path(fields)?;
        let raw = codec::encode(data)?;
        let revision = self.store.put(&path, raw, None).await?;
        tracing::debug!(path = %path, revision, "Set");
        Ok(revision)
    }

    /// Returns false when the record did not exist
    pub async fn delete(&self, fields: &Fields) -> Result<bool> {
        let path = self.path(fields)?;
        Ok(self.store.delete(&path, false).await? > 0)
    }

    /// Delete every record under the subtree addressed by `query`
    pub async fn delete_all(&self, query: &Fields) -> Result<u64> {
        let prefix = self.prefix(query)?;
        let deleted = self.store.delete(&prefix, true).await?;
        tracing::debug!(prefix = %prefix, deleted, "Deleted subtree");
        Ok(deleted)
    }

    /// Records under the subtree addressed by `query`, ordered and capped
    pub async fn list(&self, query: &Fields, options: ListOptions) -> Result<Vec<Entry>> {
        let prefix = self.prefix(query)?;
        let limit = options.limit.unwrap_or(self.settings.list_limit);
        let response = self
            .store
            .range(
                &prefix,
                RangeOptions::prefix().sorted(options.order, options.sort).limit(limit),
            )
            .await?;

        Ok(response
            .kvs
            .into_iter()
            .map(|kv| Entry {
                fields: self.template.parse(&kv.key),
                value: codec::decode(&kv.value),
                key: kv.key,
            })
            .collect())
    }

    /// Watch the subtree addressed by `query`.
    ///
    /// A partial `query` watches everything below its last resolved field.
    /// A complete `query` watches that one record: the store watch is still
    /// a prefix watch, so events for longer keys sharing the path (`i1`
    /// and `i10`) are dropped here.
    pub async fn watch(&self, query: &Fields, options: WatchOptions) -> Result<Subscription> {
        let path = self.prefix(query)?;
        let exact = self.template.is_complete(query);
        let handle = self.watcher.watch(&path).await?;
        Ok(self.deliver(handle, options, exact))
    }

    /// Watch where exactly one instance across the fleet sees each change.
    /// Scoping follows [`EntityService::watch`].
    pub async fn single_watch(&self, query: &Fields) -> Result<Subscription> {
        self.watch(query, WatchOptions { lock: true }).await
    }

    /// Read one record and watch it from the read's revision onwards
    pub async fn get_and_watch(
        &self,
        fields: &Fields,
        options: WatchOptions,
    ) -> Result<(Option<Value>, Subscription)> {
        let path = self.path(fields)?;
        let (snapshot, handle) = self.watcher.get_and_watch(&path).await?;
        let current = snapshot.first().map(|kv| codec::decode(&kv.value));
        Ok((current, self.deliver(handle, options, true)))
    }

    pub async fn unwatch(&self, query: &Fields) -> Result<()> {
        let path = self.prefix(query)?;
        self.watcher.unwatch(&path).await
    }

    /// Announce this record under a TTL lease that is kept alive and
    /// recreated if lost
    pub async fn register<T: Serialize + ?Sized>(
        &self,
        fields: &Fields,
        data: &T,
        ttl: Duration,
    ) -> Result<LeaseOutcome> {
        let path = self.path(fields)?;
        self.leaser.create(ttl, &path, data).await
    }

    pub async fn update_registration<T: Serialize + ?Sized>(
        &self,
        data: &T,
    ) -> Result<UpdateOutcome> {
        self.leaser.update(data).await
    }

    /// Stop renewing; the record expires with its lease
    pub async fn release_registration(&self) -> bool {
        self.leaser.release().await
    }

    /// Remove the record now
    pub async fn revoke_registration(&self) -> Result<bool> {
        self.leaser.revoke().await
    }

    /// Spawn the task turning store notifications into entity events.
    /// With `exact`, only the watched key itself is delivered.
    fn deliver(&self, mut handle: WatchHandle, options: WatchOptions, exact: bool) -> Subscription {
        let (tx, rx) = mpsc::channel(self.settings.watch_buffer.max(1));
        let path = handle.path().to_string();
        let template = self.template.clone();
        let locker = options.lock.then(|| self.locker.clone());
        let watched = path.clone();

        tokio::spawn(async move {
            while let Some(notification) = handle.recv().await {
                let (kind, kv) = match notification {
                    WatchNotification::Put(kv) => (LockKind::Change, kv),
                    WatchNotification::Delete(kv) => (LockKind::Delete, kv),
                    WatchNotification::Error { path, error } => {
                        if tx.send(EntityEvent::Error { path, error }).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };
                if exact && kv.key != watched {
                    continue;
                }

                if let Some(locker) = &locker {
                    if !locker.acquire(kind, &kv.key).await.is_acquired() {
                        tracing::trace!(key = %kv.key, kind = %kind, "Another watcher won");
                        continue;
                    }
                }

                let entry = Entry {
                    fields: template.parse(&kv.key),
                    value: if kv.value.is_empty() {
                        Value::Null
                    } else {
                        codec::decode(&kv.value)
                    },
                    key: kv.key,
                };
                let event = match kind {
                    LockKind::Change => EntityEvent::Change(entry),
                    LockKind::Delete => EntityEvent::Delete(entry),
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Subscription { path, events: rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FaultyStore;
    use crate::store::{InMemoryStore, KvStore};
    use keystone_common::constants::templates;
    use keystone_common::fields;
    use serde_json::json;
    use tokio::time::timeout;

    const QUIET: Duration = Duration::from_millis(100);

    fn discovery(store: &Arc<InMemoryStore>) -> EntityService {
        EntityService::for_template(store.clone(), templates::DISCOVERY).unwrap()
    }

    fn instance(service: &str, id: &str) -> Fields {
        fields([("serviceName", service), ("instanceId", id)])
    }

    /// Drain whatever arrives before the stream goes quiet
    async fn drain(sub: &mut Subscription) -> Vec<EntityEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = timeout(QUIET, sub.recv()).await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_crud_round_trip() {
        let store = Arc::new(InMemoryStore::new());
        let service = discovery(&store);
        let key = instance("svc-A", "i1");

        assert_eq!(service.get(&key).await.unwrap(), None);
        service.set(&key, &json!({ "state": "up" })).await.unwrap();
        assert_eq!(service.get(&key).await.unwrap(), Some(json!({ "state": "up" })));

        assert!(service.delete(&key).await.unwrap());
        assert!(!service.delete(&key).await.unwrap());
        assert_eq!(service.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_validation_names_missing_field() {
        let store = Arc::new(InMemoryStore::new());
        let service = discovery(&store);

        let err = service.get(&fields([("serviceName", "svc-A")])).await.unwrap_err();
        assert!(matches!(err, KeystoneError::Validation { ref field, .. } if field == "instanceId"));

        let err = service
            .set(&instance("svc-A", ""), &json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, KeystoneError::Validation { .. }));
        assert_eq!(store.revision().await, 0);
    }

    #[tokio::test]
    async fn test_list_honors_order_sort_and_limit() {
        let store = Arc::new(InMemoryStore::new());
        let service = EntityService::for_template(store.clone(), templates::JOB_TASKS).unwrap();
        for task in ["t1", "t2", "t3", "t4", "t5"] {
            let key = fields([("jobId", "job-1"), ("taskId", task)]);
            service.set(&key, &json!({ "task": task })).await.unwrap();
        }
        // Touch t2 so it becomes the most recently modified
        service
            .set(&fields([("jobId", "job-1"), ("taskId", "t2")]), &json!({ "task": "t2", "retry": 1 }))
            .await
            .unwrap();

        let query = fields([("jobId", "job-1")]);
        let newest = service
            .list(&query, ListOptions { limit: Some(3), ..ListOptions::default() })
            .await
            .unwrap();
        let ids: Vec<_> = newest.iter().map(|e| e.fields["taskId"].as_str()).collect();
        assert_eq!(ids, vec!["t2", "t5", "t4"]);
        assert_eq!(newest[0].fields["jobId"], "job-1");

        let by_key = service
            .list(
                &query,
                ListOptions {
                    order: SortTarget::Key,
                    sort: SortOrder::Ascend,
                    limit: Some(3),
                },
            )
            .await
            .unwrap();
        let ids: Vec<_> = by_key.iter().map(|e| e.fields["taskId"].as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);

        let by_version = service
            .list(
                &query,
                ListOptions {
                    order: SortTarget::Version,
                    sort: SortOrder::Descend,
                    limit: Some(1),
                },
            )
            .await
            .unwrap();
        assert_eq!(by_version[0].value, json!({ "task": "t2", "retry": 1 }));
    }

    #[tokio::test]
    async fn test_watch_emits_change_and_delete() {
        let store = Arc::new(InMemoryStore::new());
        let service = discovery(&store);
        let mut sub = service
            .watch(&fields([("serviceName", "svc-A")]), WatchOptions::default())
            .await
            .unwrap();
        assert_eq!(sub.path(), "/discovery/svc-A/");

        let key = instance("svc-A", "i1");
        service.set(&key, &json!({ "v": 1 })).await.unwrap();
        service.delete(&key).await.unwrap();

        match sub.recv().await {
            Some(EntityEvent::Change(entry)) => {
                assert_eq!(entry.fields, key);
                assert_eq!(entry.value, json!({ "v": 1 }));
            }
            other => panic!("expected change, got {:?}", other),
        }
        match sub.recv().await {
            Some(EntityEvent::Delete(entry)) => {
                assert_eq!(entry.key, "/discovery/svc-A/i1");
                assert_eq!(entry.value, Value::Null);
            }
            other => panic!("expected delete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unwatch_closes_subscription() {
        let store = Arc::new(InMemoryStore::new());
        let service = discovery(&store);
        let query = fields([("serviceName", "svc-A")]);

        let mut sub = service.watch(&query, WatchOptions::default()).await.unwrap();
        let err = service.watch(&query, WatchOptions::default()).await.unwrap_err();
        assert!(matches!(err, KeystoneError::AlreadyWatching(_)));

        service.unwatch(&query).await.unwrap();
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            service.unwatch(&query).await.unwrap_err(),
            KeystoneError::NoSuchWatcher(_)
        ));
    }

    #[tokio::test]
    async fn test_single_watch_delivers_once_across_instances() {
        let store = Arc::new(InMemoryStore::new());
        let a = discovery(&store);
        let b = discovery(&store);
        let key = instance("svc-A", "i1");

        let mut sub_a = a.single_watch(&key).await.unwrap();
        let mut sub_b = b.single_watch(&key).await.unwrap();

        a.set(&key, &json!({ "v": 1 })).await.unwrap();

        let (events_a, events_b) = tokio::join!(drain(&mut sub_a), drain(&mut sub_b));
        let changes = events_a
            .iter()
            .chain(events_b.iter())
            .filter(|e| matches!(e, EntityEvent::Change(_)))
            .count();
        assert_eq!(changes, 1);
    }

    #[tokio::test]
    async fn test_plain_watch_fans_out_to_every_instance() {
        let store = Arc::new(InMemoryStore::new());
        let a = discovery(&store);
        let b = discovery(&store);
        let key = instance("svc-A", "i1");

        let mut sub_a = a.watch(&key, WatchOptions::default()).await.unwrap();
        let mut sub_b = b.watch(&key, WatchOptions::default()).await.unwrap();
        a.set(&key, &json!({ "v": 1 })).await.unwrap();

        let (events_a, events_b) = tokio::join!(drain(&mut sub_a), drain(&mut sub_b));
        assert_eq!(events_a.len() + events_b.len(), 2);
    }

    #[tokio::test]
    async fn test_get_and_watch_returns_current_value() {
        let store = Arc::new(InMemoryStore::new());
        let service = discovery(&store);
        let key = instance("svc-A", "i1");
        service.set(&key, &json!({ "v": 1 })).await.unwrap();

        let (current, mut sub) = service
            .get_and_watch(&key, WatchOptions::default())
            .await
            .unwrap();
        assert_eq!(current, Some(json!({ "v": 1 })));

        service.set(&key, &json!({ "v": 2 })).await.unwrap();
        let events = drain(&mut sub).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], EntityEvent::Change(e) if e.value == json!({ "v": 2 })));
    }

    #[tokio::test]
    async fn test_delete_all_clears_subtree() {
        let store = Arc::new(InMemoryStore::new());
        let service = discovery(&store);
        service.set(&instance("svc-A", "i1"), &json!(1)).await.unwrap();
        service.set(&instance("svc-A", "i2"), &json!(2)).await.unwrap();
        service.set(&instance("svc-B", "i1"), &json!(3)).await.unwrap();

        let deleted = service
            .delete_all(&fields([("serviceName", "svc-A")]))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(service.list(&Fields::new(), ListOptions::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_registration_lifecycle() {
        let store = Arc::new(InMemoryStore::new());
        let service = discovery(&store);
        let key = instance("svc-A", "i1");
        let ttl = Duration::from_secs(10);

        let outcome = service.register(&key, &json!({ "v": 1 }), ttl).await.unwrap();
        assert!(matches!(outcome, LeaseOutcome::Created(_)));
        assert_eq!(service.get(&key).await.unwrap(), Some(json!({ "v": 1 })));

        service.update_registration(&json!({ "v": 2 })).await.unwrap();
        assert_eq!(service.get(&key).await.unwrap(), Some(json!({ "v": 2 })));

        assert!(service.revoke_registration().await.unwrap());
        assert_eq!(service.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_registration_survives_lease_loss() {
        let store = Arc::new(InMemoryStore::new());
        let service = discovery(&store);
        let key = instance("svc-A", "i1");

        service
            .register(&key, &json!({ "v": 1 }), Duration::from_secs(10))
            .await
            .unwrap();
        let lease = service.leaser().lease_id().await.unwrap();
        store.expire_lease(lease).await;

        service.update_registration(&json!({ "v": 2 })).await.unwrap();
        assert_eq!(service.leaser().recreations(), 1);
        assert_eq!(service.get(&key).await.unwrap(), Some(json!({ "v": 2 })));

        let kv = store
            .range("/discovery/svc-A/i1", RangeOptions::single())
            .await
            .unwrap()
            .first()
            .unwrap();
        assert_ne!(kv.lease, Some(lease));
    }

    #[tokio::test]
    async fn test_subtree_excludes_siblings_sharing_a_prefix() {
        let store = Arc::new(InMemoryStore::new());
        let service = discovery(&store);
        service.set(&instance("svc-A", "i1"), &json!(1)).await.unwrap();
        service.set(&instance("svc-AB", "i9"), &json!(2)).await.unwrap();

        let query = fields([("serviceName", "svc-A")]);
        let listed = service.list(&query, ListOptions::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "/discovery/svc-A/i1");

        assert_eq!(service.delete_all(&query).await.unwrap(), 1);
        assert_eq!(service.get(&instance("svc-AB", "i9")).await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_subtree_watch_ignores_sibling_services() {
        let store = Arc::new(InMemoryStore::new());
        let service = discovery(&store);
        let mut sub = service
            .watch(&fields([("serviceName", "svc-A")]), WatchOptions::default())
            .await
            .unwrap();

        service.set(&instance("svc-AB", "i9"), &json!(1)).await.unwrap();
        service.set(&instance("svc-A", "i1"), &json!(2)).await.unwrap();

        let events = drain(&mut sub).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], EntityEvent::Change(e) if e.key == "/discovery/svc-A/i1"));
    }

    #[tokio::test]
    async fn test_full_key_watch_is_exact() {
        let store = Arc::new(InMemoryStore::new());
        let service = discovery(&store);
        let mut sub = service
            .watch(&instance("svc-A", "i1"), WatchOptions::default())
            .await
            .unwrap();

        service.set(&instance("svc-A", "i10"), &json!(10)).await.unwrap();
        service.set(&instance("svc-A", "i1"), &json!(1)).await.unwrap();

        let events = drain(&mut sub).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], EntityEvent::Change(e) if e.key == "/discovery/svc-A/i1"));
    }

    #[tokio::test]
    async fn test_list_defaults_to_configured_cap() {
        let store = Arc::new(InMemoryStore::new());
        let template = PathTemplate::compile(templates::DISCOVERY).unwrap();
        let schema = FieldSchema::from_template(&template);
        let settings = ServiceSettings {
            list_limit: 2,
            ..ServiceSettings::default()
        };
        let service = EntityService::with_settings(store.clone(), template, schema, settings);
        for id in ["i1", "i2", "i3"] {
            service.set(&instance("svc-A", id), &json!(id)).await.unwrap();
        }

        let capped = service.list(&Fields::new(), ListOptions::default()).await.unwrap();
        assert_eq!(capped.len(), 2);

        let explicit = ListOptions {
            limit: Some(3),
            ..ListOptions::default()
        };
        assert_eq!(service.list(&Fields::new(), explicit).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stream_error_reaches_subscriber_without_ending_watch() {
        let store = Arc::new(FaultyStore {
            watch_errors: 1,
            ..FaultyStore::default()
        });
        let service = EntityService::for_template(store.clone(), templates::DISCOVERY).unwrap();
        let query = fields([("serviceName", "svc-A")]);
        let mut sub = service.watch(&query, WatchOptions::default()).await.unwrap();

        match sub.recv().await {
            Some(EntityEvent::Error { path, .. }) => assert_eq!(path, "/discovery/svc-A/"),
            other => panic!("expected error, got {:?}", other),
        }

        service.set(&instance("svc-A", "i1"), &json!(1)).await.unwrap();
        assert!(matches!(sub.recv().await, Some(EntityEvent::Change(e)) if e.value == json!(1)));
        assert!(service.watcher().is_watching("/discovery/svc-A/").await);
    }
}
