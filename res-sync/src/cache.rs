//! Reference-counted store of live resources.
//!
//! Architecture:
//! ```text
//!   subscribe ──► get_or_subscribe ──► add_resources_and_subscribe ──┐
//!                                                                    │
//!   server event ──► handle_event ──┐                                ▼
//!                                   │    ┌────────────────────────────────┐
//!                                   └──► │ Store (one Mutex)               │
//!                                        │   rid → CacheItem               │
//!                                        │     direct / indirect counts    │
//!                                        │     Arc<RwLock<Replica>>        │
//!                                        │     Pending                     │
//!                                        └───────────────┬────────────────┘
//!                                                        │ ResourceEvent
//!                                                        ▼
//!                                              mpsc::UnboundedSender<ClientEvent>
//! ```
//!
//! The cache always holds exactly the resources reachable through hard
//! references from directly subscribed ones, plus those still loading.
//! Eviction runs a two-pass reachability analysis so that reference cycles
//! are collected once their last external subscriber is gone.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::{ClientEvent, ResourceEvent};
use crate::pending::Pending;
use crate::protocol::{ResError, ResourceSet};
use crate::registry::PatternRegistry;
use crate::resource::{self, ModelChange, Replica, ResourceHandle, ResourceKind};
use crate::sync::{self, EditOp};
use crate::value::{Fields, ResValue, ResourceRef};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("resource {rid} is cached as {cached}, received as {received}")]
    KindMismatch {
        rid: String,
        cached: ResourceKind,
        received: ResourceKind,
    },
    #[error("indirect reference count of {0} would become negative")]
    NegativeReferences(String),
    #[error("handler for {rid} failed: {error}")]
    Handler { rid: String, error: ResError },
    #[error("invalid {name} event for {rid}: {message}")]
    InvalidEvent {
        rid: String,
        name: String,
        message: String,
    },
    #[error("not subscribed: {0}")]
    NotSubscribed(String),
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
    #[error(transparent)]
    Resource(ResError),
}

impl CacheError {
    /// Consistency violations the cache cannot recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::KindMismatch { .. }
                | Self::NegativeReferences(_)
                | Self::MalformedSnapshot(_)
        )
    }
}

impl From<CacheError> for ResError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Resource(err) => err,
            CacheError::NotFound(rid) => ResError::not_found(&rid),
            other => ResError::internal(other.to_string()),
        }
    }
}

/// One cached resource.
struct CacheItem {
    kind: Option<ResourceKind>,
    replica: Option<Arc<RwLock<Replica>>>,
    loaded: bool,
    direct: u32,
    indirect: u32,
    /// Resolves once the initial data is applied
    pending: Pending,
    /// Set while a network subscribe for this resource is in flight
    subscribing: Option<Pending>,
    /// Subscribed before a disconnect and not yet resubscribed
    stale: bool,
}

impl CacheItem {
    fn new() -> Self {
        Self {
            kind: None,
            replica: None,
            loaded: false,
            direct: 0,
            indirect: 0,
            pending: Pending::new(),
            subscribing: None,
            stale: false,
        }
    }

    fn handle(&self, rid: &str) -> Option<ResourceHandle> {
        match (self.kind, &self.replica) {
            (Some(kind), Some(replica)) if self.loaded => {
                Some(ResourceHandle::new(rid.to_string(), kind, replica.clone()))
            }
            _ => None,
        }
    }

    fn hard_refs(&self) -> Vec<String> {
        self.replica
            .as_ref()
            .map(|r| resource::read(r).hard_refs())
            .unwrap_or_default()
    }
}

/// Side effects collected while mutating the store.
#[derive(Default)]
struct Output {
    events: Vec<ResourceEvent>,
    errors: Vec<CacheError>,
    /// Resources that lost a reference and may have become unreachable
    orphans: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unset,
    Delete,
    Keep,
}

struct RefState {
    /// References from outside the traversed set
    remaining: i64,
    mark: Mark,
}

struct Store {
    items: HashMap<String, CacheItem>,
}

impl Store {
    fn get_item(&self, rid: &str) -> Result<&CacheItem, CacheError> {
        self.items
            .get(rid)
            .ok_or_else(|| CacheError::NotFound(rid.to_string()))
    }

    fn get_item_mut(&mut self, rid: &str) -> Result<&mut CacheItem, CacheError> {
        self.items
            .get_mut(rid)
            .ok_or_else(|| CacheError::NotFound(rid.to_string()))
    }

    fn replica(&self, rid: &str) -> Result<Arc<RwLock<Replica>>, CacheError> {
        self.get_item(rid)?
            .replica
            .clone()
            .ok_or_else(|| CacheError::NotFound(rid.to_string()))
    }

    /// Convert one wire token into a local value.
    ///
    /// A hard reference must point to a resource that has a replica. Its
    /// indirect count is incremented only if `count_indirect` is set.
    fn parse_value(&mut self, token: &Value, count_indirect: bool) -> Result<ResValue, CacheError> {
        match token {
            Value::Null => Ok(ResValue::Null),
            Value::Bool(b) => Ok(ResValue::Bool(*b)),
            Value::Number(n) => Ok(ResValue::Number(n.clone())),
            Value::String(s) => Ok(ResValue::String(s.clone())),
            Value::Object(obj) => {
                if let Some(rid) = obj.get("rid") {
                    let rid = rid
                        .as_str()
                        .ok_or_else(|| CacheError::InvalidValue(token.to_string()))?;
                    if obj.get("soft").and_then(Value::as_bool).unwrap_or(false) {
                        return Ok(ResValue::SoftRef(rid.to_string()));
                    }
                    let item = self.get_item_mut(rid)?;
                    let (Some(kind), Some(replica)) = (item.kind, &item.replica) else {
                        return Err(CacheError::NotFound(rid.to_string()));
                    };
                    let reference = ResourceRef::new(rid.to_string(), kind, Arc::downgrade(replica));
                    if count_indirect {
                        item.indirect += 1;
                    }
                    return Ok(ResValue::Resource(reference));
                }
                if let Some(data) = obj.get("data") {
                    return Ok(ResValue::Data(data.clone()));
                }
                if obj.get("action").and_then(Value::as_str) == Some("delete") {
                    return Ok(ResValue::Delete);
                }
                Err(CacheError::InvalidValue(token.to_string()))
            }
            Value::Array(_) => Err(CacheError::InvalidValue(token.to_string())),
        }
    }

    /// Parse a value that may not be a deletion marker.
    fn parse_stored_value(&mut self, token: &Value, count_indirect: bool) -> Result<ResValue, CacheError> {
        match self.parse_value(token, count_indirect)? {
            ResValue::Delete => Err(CacheError::InvalidValue(token.to_string())),
            value => Ok(value),
        }
    }

    fn parse_fields(
        &mut self,
        tokens: &serde_json::Map<String, Value>,
        count_indirect: bool,
    ) -> Result<Fields, CacheError> {
        tokens
            .iter()
            .map(|(key, token)| {
                self.parse_stored_value(token, count_indirect)
                    .map(|value| (key.clone(), value))
            })
            .collect()
    }

    fn parse_values(&mut self, tokens: &[Value], count_indirect: bool) -> Result<Vec<ResValue>, CacheError> {
        tokens
            .iter()
            .map(|token| self.parse_stored_value(token, count_indirect))
            .collect()
    }

    fn add_indirect(&mut self, rid: &str) -> Result<(), CacheError> {
        self.get_item_mut(rid)?.indirect += 1;
        Ok(())
    }

    fn remove_indirect(&mut self, rid: &str) -> Result<&mut CacheItem, CacheError> {
        let item = self.get_item_mut(rid)?;
        if item.indirect == 0 {
            return Err(CacheError::NegativeReferences(rid.to_string()));
        }
        item.indirect -= 1;
        Ok(item)
    }

    fn release_reference(&mut self, rid: &str, out: &mut Output) -> Result<(), CacheError> {
        let item = self.remove_indirect(rid)?;
        if item.direct == 0 {
            out.orphans.push(rid.to_string());
        }
        Ok(())
    }

    /// Check every stored value of a batch, so that a rejected batch leaves
    /// the store untouched. Hard references must resolve to a resource in
    /// the batch or to one that already has a replica.
    fn validate(&self, set: &ResourceSet) -> Result<(), CacheError> {
        let tokens = set
            .models
            .values()
            .flat_map(|fields| fields.values())
            .chain(set.collections.values().flatten());
        for token in tokens {
            self.check_value(token, set)?;
        }
        Ok(())
    }

    fn check_value(&self, token: &Value, set: &ResourceSet) -> Result<(), CacheError> {
        let Value::Object(obj) = token else {
            return match token {
                Value::Array(_) => Err(CacheError::InvalidValue(token.to_string())),
                _ => Ok(()),
            };
        };
        if let Some(rid) = obj.get("rid") {
            let rid = rid
                .as_str()
                .ok_or_else(|| CacheError::InvalidValue(token.to_string()))?;
            let soft = obj.get("soft").and_then(Value::as_bool).unwrap_or(false);
            let known = set.contains(rid)
                || self.items.get(rid).is_some_and(|item| item.replica.is_some());
            return if soft || known {
                Ok(())
            } else {
                Err(CacheError::NotFound(rid.to_string()))
            };
        }
        if obj.contains_key("data") {
            return Ok(());
        }
        Err(CacheError::InvalidValue(token.to_string()))
    }

    /// Merge a snapshot batch, creating replicas for unknown resources and
    /// synchronizing already loaded ones. Returns the rids created.
    fn add_resources(
        &mut self,
        registry: &PatternRegistry,
        set: &ResourceSet,
        out: &mut Output,
    ) -> Result<Vec<String>, CacheError> {
        let mut incoming: Vec<(&String, ResourceKind)> = Vec::with_capacity(set.len());
        incoming.extend(set.models.keys().map(|rid| (rid, ResourceKind::Model)));
        incoming.extend(set.collections.keys().map(|rid| (rid, ResourceKind::Collection)));
        incoming.extend(set.errors.keys().map(|rid| (rid, ResourceKind::Error)));
        incoming.sort_by(|a, b| a.0.cmp(b.0));

        for (rid, kind) in &incoming {
            if let Some(item) = self.items.get(*rid) {
                match item.kind {
                    Some(cached) if item.loaded && cached != *kind => {
                        return Err(CacheError::KindMismatch {
                            rid: rid.to_string(),
                            cached,
                            received: *kind,
                        });
                    }
                    _ => {}
                }
            }
        }
        self.validate(set)?;

        // Every replica exists before any value is parsed, so references
        // within the batch resolve regardless of order.
        let mut created = Vec::new();
        let mut synced = Vec::new();
        for (rid, kind) in &incoming {
            let item = self.items.entry(rid.to_string()).or_insert_with(CacheItem::new);
            if item.loaded {
                synced.push((rid.to_string(), *kind));
                continue;
            }
            let replica = match kind {
                ResourceKind::Model => Replica::Model(registry.create_model(rid)),
                ResourceKind::Collection => Replica::Collection(registry.create_collection(rid)),
                ResourceKind::Error => Replica::Error(set.errors[*rid].clone()),
            };
            item.kind = Some(*kind);
            item.replica = Some(Arc::new(RwLock::new(replica)));
            created.push(rid.to_string());
        }

        for rid in &created {
            self.init_resource(rid, set, out)?;
        }
        for (rid, kind) in &synced {
            self.synchronize(rid, *kind, set, out)?;
        }
        Ok(created)
    }

    fn init_resource(&mut self, rid: &str, set: &ResourceSet, out: &mut Output) -> Result<(), CacheError> {
        let replica = self.replica(rid)?;
        let hooked = if let Some(tokens) = set.models.get(rid) {
            let fields = self.parse_fields(tokens, true)?;
            match &mut *resource::write(&replica) {
                Replica::Model(model) => {
                    *model.fields_mut() = fields;
                    model.on_init()
                }
                _ => Ok(()),
            }
        } else if let Some(tokens) = set.collections.get(rid) {
            let values = self.parse_values(tokens, true)?;
            match &mut *resource::write(&replica) {
                Replica::Collection(collection) => {
                    *collection.values_mut() = values;
                    collection.on_init()
                }
                _ => Ok(()),
            }
        } else {
            Ok(())
        };

        if let Err(error) = hooked {
            log::error!("Initializing {rid} failed: {error}");
            out.errors.push(CacheError::Handler {
                rid: rid.to_string(),
                error,
            });
        }
        self.get_item_mut(rid)?.loaded = true;
        Ok(())
    }

    /// Bring a loaded replica in line with its snapshot by replaying the
    /// difference as regular change, add and remove events.
    fn synchronize(
        &mut self,
        rid: &str,
        kind: ResourceKind,
        set: &ResourceSet,
        out: &mut Output,
    ) -> Result<(), CacheError> {
        let replica = self.replica(rid)?;
        match kind {
            ResourceKind::Model => {
                let fields = self.parse_fields(&set.models[rid], false)?;
                let changes = match &*resource::read(&replica) {
                    Replica::Model(model) => sync::diff_model(model.fields(), &fields),
                    _ => Fields::new(),
                };
                if !changes.is_empty() {
                    log::debug!("Resynchronizing model {rid}: {} changed fields", changes.len());
                    self.apply_change(rid, changes, out)?;
                }
            }
            ResourceKind::Collection => {
                let values = self.parse_values(&set.collections[rid], false)?;
                let ops = match &*resource::read(&replica) {
                    Replica::Collection(collection) => sync::diff_collection(collection.values(), &values),
                    _ => Vec::new(),
                };
                if !ops.is_empty() {
                    log::debug!("Resynchronizing collection {rid}: {} edits", ops.len());
                }
                for op in ops {
                    match op {
                        EditOp::Add { index, value } => self.apply_add(rid, index, value, out)?,
                        EditOp::Remove { index } => self.apply_remove(rid, index, out)?,
                    }
                }
            }
            ResourceKind::Error => {
                *resource::write(&replica) = Replica::Error(set.errors[rid].clone());
            }
        }
        Ok(())
    }

    fn invalid_event(rid: &str, name: &str, message: impl Into<String>) -> CacheError {
        CacheError::InvalidEvent {
            rid: rid.to_string(),
            name: name.to_string(),
            message: message.into(),
        }
    }

    fn apply_change(&mut self, rid: &str, changes: Fields, out: &mut Output) -> Result<(), CacheError> {
        let replica = self.replica(rid)?;
        let mut guard = resource::write(&replica);
        let Replica::Model(model) = &mut *guard else {
            return Err(Self::invalid_event(rid, "change", "resource is not a model"));
        };

        let mut change = ModelChange::default();
        let fields = model.fields_mut();
        for (key, value) in changes {
            let old = fields.get(&key).cloned().unwrap_or(ResValue::Delete);
            if old == value {
                continue;
            }
            if value.is_delete() {
                fields.remove(&key);
            } else {
                fields.insert(key.clone(), value.clone());
            }
            change.old_values.insert(key.clone(), old);
            change.new_values.insert(key, value);
        }
        if change.new_values.is_empty() {
            return Ok(());
        }

        for value in change.new_values.values() {
            if let Some(target) = value.hard_ref() {
                self.add_indirect(target)?;
            }
        }
        for value in change.old_values.values() {
            if let Some(target) = value.hard_ref() {
                self.release_reference(target, out)?;
            }
        }

        match model.on_change(change) {
            Ok(Some(change)) => out.events.push(ResourceEvent::Change {
                rid: rid.to_string(),
                new_values: change.new_values,
                old_values: change.old_values,
            }),
            Ok(None) => {}
            Err(error) => out.errors.push(CacheError::Handler {
                rid: rid.to_string(),
                error,
            }),
        }
        Ok(())
    }

    fn apply_add(&mut self, rid: &str, index: usize, value: ResValue, out: &mut Output) -> Result<(), CacheError> {
        let replica = self.replica(rid)?;
        let mut guard = resource::write(&replica);
        let Replica::Collection(collection) = &mut *guard else {
            return Err(Self::invalid_event(rid, "add", "resource is not a collection"));
        };
        let len = collection.values().len();
        if index > len {
            return Err(Self::invalid_event(rid, "add", format!("index {index} out of range 0..={len}")));
        }
        collection.values_mut().insert(index, value.clone());
        if let Some(target) = value.hard_ref() {
            self.add_indirect(target)?;
        }

        match collection.on_add(index, &value) {
            Ok(true) => out.events.push(ResourceEvent::Add {
                rid: rid.to_string(),
                index,
                value,
            }),
            Ok(false) => {}
            Err(error) => out.errors.push(CacheError::Handler {
                rid: rid.to_string(),
                error,
            }),
        }
        Ok(())
    }

    fn apply_remove(&mut self, rid: &str, index: usize, out: &mut Output) -> Result<(), CacheError> {
        let replica = self.replica(rid)?;
        let mut guard = resource::write(&replica);
        let Replica::Collection(collection) = &mut *guard else {
            return Err(Self::invalid_event(rid, "remove", "resource is not a collection"));
        };
        let len = collection.values().len();
        if index >= len {
            return Err(Self::invalid_event(rid, "remove", format!("index {index} out of range 0..{len}")));
        }
        let value = collection.values_mut().remove(index);
        if let Some(target) = value.hard_ref() {
            self.release_reference(target, out)?;
        }

        match collection.on_remove(index, &value) {
            Ok(true) => out.events.push(ResourceEvent::Remove {
                rid: rid.to_string(),
                index,
                value,
            }),
            Ok(false) => {}
            Err(error) => out.errors.push(CacheError::Handler {
                rid: rid.to_string(),
                error,
            }),
        }
        Ok(())
    }

    fn apply_custom(&mut self, rid: &str, name: &str, data: Option<Value>, out: &mut Output) -> Result<(), CacheError> {
        let replica = self.replica(rid)?;
        let deliver = match &mut *resource::write(&replica) {
            Replica::Model(model) => model.on_custom(name, data.as_ref()),
            Replica::Collection(collection) => collection.on_custom(name, data.as_ref()),
            Replica::Error(_) => Ok(false),
        };
        match deliver {
            Ok(true) => out.events.push(ResourceEvent::Custom {
                rid: rid.to_string(),
                name: name.to_string(),
                data,
            }),
            Ok(false) => {}
            Err(error) => out.errors.push(CacheError::Handler {
                rid: rid.to_string(),
                error,
            }),
        }
        Ok(())
    }

    /// Evict `rid` and everything reachable from it that no subscribed
    /// resource still reaches. Returns the evicted rids.
    fn try_delete(&mut self, rid: &str) -> Result<Vec<String>, CacheError> {
        let Some(item) = self.items.get(rid) else {
            return Ok(Vec::new());
        };
        if item.direct > 0 || !item.loaded {
            return Ok(Vec::new());
        }

        let mut refs = HashMap::new();
        refs.insert(
            rid.to_string(),
            RefState {
                remaining: i64::from(item.indirect),
                mark: Mark::Unset,
            },
        );
        for child in item.hard_refs() {
            self.seek_refs(&mut refs, &child);
        }
        self.mark_refs(&mut refs, rid, Mark::Delete);

        let mut doomed: Vec<String> = refs
            .into_iter()
            .filter(|(_, state)| state.mark == Mark::Delete)
            .map(|(rid, _)| rid)
            .collect();
        doomed.sort();

        for dead in &doomed {
            let children = self.get_item(dead)?.hard_refs();
            for child in children {
                self.remove_indirect(&child)?;
            }
        }
        for dead in &doomed {
            self.items.remove(dead);
            log::debug!("Evicted {dead}");
        }
        Ok(doomed)
    }

    /// First pass: count, for every resource reachable from the candidate,
    /// the references that come from outside the traversed set.
    fn seek_refs(&self, refs: &mut HashMap<String, RefState>, rid: &str) {
        let Some(item) = self.items.get(rid) else {
            return;
        };
        if item.direct > 0 {
            return;
        }
        if let Some(state) = refs.get_mut(rid) {
            state.remaining -= 1;
            return;
        }
        refs.insert(
            rid.to_string(),
            RefState {
                remaining: i64::from(item.indirect) - 1,
                mark: Mark::Unset,
            },
        );
        for child in item.hard_refs() {
            self.seek_refs(refs, &child);
        }
    }

    /// Second pass: propagate Delete from the candidate, flipping to Keep
    /// wherever an outside reference survives.
    fn mark_refs(&self, refs: &mut HashMap<String, RefState>, rid: &str, incoming: Mark) {
        let Some(item) = self.items.get(rid) else {
            return;
        };
        if item.direct > 0 {
            return;
        }
        let Some(state) = refs.get_mut(rid) else {
            return;
        };
        if state.mark == Mark::Keep {
            return;
        }
        let next = if incoming == Mark::Delete {
            if state.remaining > 0 {
                Mark::Keep
            } else if state.mark != Mark::Unset {
                return;
            } else {
                Mark::Delete
            }
        } else {
            Mark::Keep
        };
        state.mark = next;
        for child in item.hard_refs() {
            self.mark_refs(refs, &child, next);
        }
    }

    /// Evict whatever in `candidates` has become unreachable.
    fn collect(&mut self, candidates: Vec<String>) -> Result<(), CacheError> {
        for rid in candidates {
            let unsubscribed = self.items.get(&rid).is_some_and(|item| item.direct == 0);
            if unsubscribed {
                self.try_delete(&rid)?;
            }
        }
        Ok(())
    }
}

/// The resource cache.
pub struct ResourceCache {
    registry: RwLock<PatternRegistry>,
    store: Mutex<Store>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl ResourceCache {
    /// Create a cache reporting resource events and errors on `events`.
    pub fn new(events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self::with_registry(PatternRegistry::new(), events)
    }

    /// Create a cache using `registry` for replica factories.
    pub fn with_registry(registry: PatternRegistry, events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self {
            registry: RwLock::new(registry),
            store: Mutex::new(Store {
                items: HashMap::new(),
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a model factory for rids matching `pattern`.
    pub fn register_model_factory<F>(&self, pattern: &str, factory: F) -> Result<(), crate::pattern::PatternError>
    where
        F: Fn(&str) -> Box<dyn resource::ModelResource> + Send + Sync + 'static,
    {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_model(pattern, factory)
    }

    /// Register a collection factory for rids matching `pattern`.
    pub fn register_collection_factory<F>(&self, pattern: &str, factory: F) -> Result<(), crate::pattern::PatternError>
    where
        F: Fn(&str) -> Box<dyn resource::CollectionResource> + Send + Sync + 'static,
    {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_collection(pattern, factory)
    }

    /// Deliver collected events and errors, then evict orphans.
    fn flush(&self, store: &mut Store, out: Output) -> Result<(), CacheError> {
        for event in out.events {
            log::trace!("Resource event {} on {}", event.name(), event.rid());
            let _ = self.events.send(ClientEvent::Resource(event));
        }
        for error in out.errors {
            let _ = self.events.send(ClientEvent::CacheError(error));
        }
        store.collect(out.orphans)
    }

    fn merge(&self, store: &mut Store, set: &ResourceSet, rid: &str, subscribe: bool) -> Result<ResourceHandle, CacheError> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = Output::default();
        let created = store.add_resources(&registry, set, &mut out)?;

        for created_rid in &created {
            if let Some(item) = store.items.get(created_rid) {
                let outcome = match item.replica.as_deref().map(resource::read).as_deref() {
                    Some(Replica::Error(err)) => Err(err.clone()),
                    _ => Ok(()),
                };
                item.pending.resolve(outcome);
            }
        }

        let root = store
            .items
            .get_mut(rid)
            .filter(|item| item.loaded)
            .ok_or_else(|| CacheError::NotFound(rid.to_string()));
        let result = root.and_then(|item| {
            if let Some(Replica::Error(err)) = item.replica.as_deref().map(resource::read).as_deref() {
                return Err(CacheError::Resource(err.clone()));
            }
            if subscribe {
                item.direct += 1;
            }
            item.stale = false;
            item.handle(rid).ok_or_else(|| CacheError::NotFound(rid.to_string()))
        });

        out.orphans.extend(created);
        self.flush(store, out)?;
        result
    }

    /// Merge a snapshot batch and count one direct subscription on `rid`.
    ///
    /// Fails with [`CacheError::NotFound`] if `rid` is neither in the batch
    /// nor already loaded.
    pub fn add_resources_and_subscribe(&self, set: &ResourceSet, rid: &str) -> Result<ResourceHandle, CacheError> {
        let mut store = self.lock();
        self.merge(&mut store, set, rid, true)
    }

    /// Merge a snapshot batch for a stale resource without counting a new
    /// subscription.
    pub fn resubscribe(&self, set: &ResourceSet, rid: &str) -> Result<ResourceHandle, CacheError> {
        let mut store = self.lock();
        self.merge(&mut store, set, rid, false)
    }

    /// Get a loaded resource, subscribing through `subscribe` if needed.
    ///
    /// `subscribe` performs the network subscribe and returns the snapshot
    /// batch. It is called at most once for concurrent callers: later callers
    /// wait for the in-flight subscription and share its outcome.
    pub async fn get_or_subscribe<F, Fut>(&self, rid: &str, subscribe: F) -> Result<ResourceHandle, ResError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Value, ResError>>,
    {
        enum Step {
            Ready(Pending),
            Join(Pending),
            Send(Pending),
        }

        let step = {
            let mut store = self.lock();
            let item = store.items.entry(rid.to_string()).or_insert_with(CacheItem::new);
            if item.direct > 0 {
                item.direct += 1;
                Step::Ready(item.pending.clone())
            } else if let Some(inflight) = &item.subscribing {
                Step::Join(inflight.clone())
            } else {
                let inflight = Pending::new();
                item.subscribing = Some(inflight.clone());
                Step::Send(inflight)
            }
        };

        match step {
            Step::Ready(pending) => {
                pending.wait().await?;
            }
            Step::Join(inflight) => {
                inflight.wait().await?;
                let pending = {
                    let mut store = self.lock();
                    let item = store.get_item_mut(rid)?;
                    item.direct += 1;
                    item.pending.clone()
                };
                pending.wait().await?;
            }
            Step::Send(inflight) => {
                let result = match subscribe(rid.to_string()).await {
                    Ok(value) => serde_json::from_value::<ResourceSet>(value)
                        .map_err(|e| CacheError::MalformedSnapshot(e.to_string()))
                        .and_then(|set| self.add_resources_and_subscribe(&set, rid))
                        .map_err(|err| self.report(err)),
                    Err(err) => Err(err),
                };

                {
                    let mut store = self.lock();
                    if let Some(item) = store.items.get_mut(rid) {
                        item.subscribing = None;
                        if let Err(err) = &result {
                            if !item.loaded && item.direct == 0 && item.indirect == 0 {
                                item.pending.resolve(Err(err.clone()));
                                store.items.remove(rid);
                            }
                        }
                    }
                }
                inflight.resolve(result.as_ref().map(|_| ()).map_err(ResError::clone));
                return result;
            }
        }
        let store = self.lock();
        store.get_item(rid)?.handle(rid).ok_or_else(|| ResError::not_found(rid))
    }

    /// Drop one direct subscription. The last one sends `unsubscribe`
    /// (unless the resource is stale) and evicts what became unreachable.
    /// If the network unsubscribe fails the subscription is restored.
    pub async fn unsubscribe<F, Fut>(&self, rid: &str, unsubscribe: F) -> Result<(), ResError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<(), ResError>>,
    {
        let stale = {
            let mut store = self.lock();
            let item = store
                .items
                .get_mut(rid)
                .filter(|item| item.direct > 0)
                .ok_or_else(|| ResError::from(CacheError::NotSubscribed(rid.to_string())))?;
            item.direct -= 1;
            if item.direct > 0 {
                return Ok(());
            }
            item.stale
        };

        if !stale {
            if let Err(err) = unsubscribe(rid.to_string()).await {
                log::warn!("Unsubscribing {rid} failed: {err}");
                if let Some(item) = self.lock().items.get_mut(rid) {
                    item.direct += 1;
                }
                return Err(err);
            }
        }

        let mut store = self.lock();
        if let Some(item) = store.items.get_mut(rid) {
            if item.direct == 0 {
                item.stale = false;
                store.try_delete(rid).map_err(|err| self.report(err))?;
            }
        }
        Ok(())
    }

    /// Apply a server event to its resource.
    ///
    /// Returns the event as delivered to observers, or `None` if it was
    /// dropped or suppressed. Delivered events are also sent on the event
    /// channel. A failing replica hook is reported on the channel and never
    /// propagated.
    pub fn handle_event(
        &self,
        rid: &str,
        name: &str,
        data: Option<Value>,
    ) -> Result<Option<ResourceEvent>, CacheError> {
        let mut store = self.lock();
        let Some(item) = store.items.get(rid) else {
            log::debug!("Dropping {name} event for uncached resource {rid}");
            return Ok(None);
        };
        if !item.pending.is_resolved() || !item.loaded {
            log::warn!("Dropping {name} event for resource {rid} still loading");
            return Ok(None);
        }
        let kind = item.kind;

        let mut out = Output::default();
        let applied = if name == "unsubscribe" {
            let reason = data
                .as_ref()
                .and_then(|d| d.get("reason"))
                .and_then(|r| serde_json::from_value::<ResError>(r.clone()).ok())
                .unwrap_or_else(ResError::missing_reason);
            log::info!("Server unsubscribed {rid}: {reason}");
            self.unsubscribed(&mut store, rid, reason, &mut out)
        } else {
            self.apply_event(&mut store, rid, kind, name, data, &mut out)
        };

        // Resources merged for a rejected event must still be collected.
        let delivered = out.events.last().filter(|event| event.rid() == rid).cloned();
        self.flush(&mut store, out)?;
        applied?;
        Ok(delivered)
    }

    fn apply_event(
        &self,
        store: &mut Store,
        rid: &str,
        kind: Option<ResourceKind>,
        name: &str,
        data: Option<Value>,
        out: &mut Output,
    ) -> Result<(), CacheError> {
        let data_obj = data.as_ref().and_then(Value::as_object);

        // Events may carry the resources their values reference.
        if let Some(obj) = data_obj {
            if ["models", "collections", "errors"].iter().any(|k| obj.contains_key(*k)) {
                let set: ResourceSet = serde_json::from_value(Value::Object(obj.clone()))
                    .map_err(|e| Store::invalid_event(rid, name, e.to_string()))?;
                let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
                let created = store.add_resources(&registry, &set, out)?;
                for created_rid in &created {
                    if let Some(item) = store.items.get(created_rid) {
                        item.pending.resolve(Ok(()));
                    }
                }
                out.orphans.extend(created);
            }
        }

        match (kind, name) {
            (Some(ResourceKind::Model), "change") => {
                let tokens = data_obj
                    .and_then(|obj| obj.get("values"))
                    .and_then(Value::as_object)
                    .ok_or_else(|| Store::invalid_event(rid, name, "missing values"))?;
                let changes = tokens
                    .iter()
                    .map(|(key, token)| store.parse_value(token, false).map(|value| (key.clone(), value)))
                    .collect::<Result<Fields, CacheError>>()?;
                store.apply_change(rid, changes, out)
            }
            (Some(ResourceKind::Collection), "add") => {
                let index = data_obj
                    .and_then(|obj| obj.get("idx"))
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Store::invalid_event(rid, name, "missing idx"))?;
                let token = data_obj
                    .and_then(|obj| obj.get("value"))
                    .ok_or_else(|| Store::invalid_event(rid, name, "missing value"))?;
                let value = store.parse_stored_value(token, false)?;
                store.apply_add(rid, index as usize, value, out)
            }
            (Some(ResourceKind::Collection), "remove") => {
                let index = data_obj
                    .and_then(|obj| obj.get("idx"))
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Store::invalid_event(rid, name, "missing idx"))?;
                store.apply_remove(rid, index as usize, out)
            }
            (Some(ResourceKind::Error), _) => {
                log::debug!("Ignoring {name} event for error resource {rid}");
                Ok(())
            }
            _ => store.apply_custom(rid, name, data, out),
        }
    }

    fn unsubscribed(&self, store: &mut Store, rid: &str, reason: ResError, out: &mut Output) -> Result<(), CacheError> {
        if let Some(item) = store.items.get_mut(rid) {
            item.direct = 0;
            item.stale = false;
        }
        store.try_delete(rid)?;
        out.events.push(ResourceEvent::Unsubscribe {
            rid: rid.to_string(),
            reason,
        });
        Ok(())
    }

    /// Mark every directly subscribed resource stale. Returns how many.
    pub fn set_all_stale(&self) -> usize {
        let mut store = self.lock();
        let mut count = 0;
        for item in store.items.values_mut() {
            if item.loaded && item.direct > 0 {
                item.stale = true;
                count += 1;
            }
        }
        count
    }

    /// Resubscribe every stale resource through `subscribe`, reconciling each
    /// replica with its fresh snapshot. A resource whose resubscription fails
    /// is dropped as if the server had unsubscribed it.
    pub async fn subscribe_stale<F, Fut>(&self, subscribe: F)
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<Value, ResError>>,
    {
        let mut stale: Vec<String> = self
            .lock()
            .items
            .iter()
            .filter(|(_, item)| item.stale)
            .map(|(rid, _)| rid.clone())
            .collect();
        stale.sort();
        if stale.is_empty() {
            return;
        }
        log::info!("Resubscribing {} stale resources", stale.len());

        let subscribe = &subscribe;
        let tasks = stale.into_iter().map(|rid| async move {
            let result = match subscribe(rid.clone()).await {
                Ok(value) => serde_json::from_value::<ResourceSet>(value)
                    .map_err(|e| CacheError::MalformedSnapshot(e.to_string()))
                    .and_then(|set| self.resubscribe(&set, &rid))
                    .map(|_| ())
                    .map_err(|err| self.report(err)),
                Err(err) => Err(err),
            };
            if let Err(reason) = result {
                log::warn!("Resubscribing {rid} failed: {reason}");
                let mut store = self.lock();
                let mut out = Output::default();
                let dropped = self
                    .unsubscribed(&mut store, &rid, reason, &mut out)
                    .and_then(|()| self.flush(&mut store, out));
                if let Err(err) = dropped {
                    self.report(err);
                }
            }
        });
        futures_util::future::join_all(tasks).await;
    }

    /// Log and send `err` on the event channel, converting it for callers.
    fn report(&self, err: CacheError) -> ResError {
        if err.is_fatal() {
            log::error!("Cache consistency error: {err}");
        } else {
            log::warn!("Cache error: {err}");
        }
        let _ = self.events.send(ClientEvent::CacheError(err.clone()));
        err.into()
    }

    /// A loaded resource, or `None`.
    pub fn get(&self, rid: &str) -> Option<ResourceHandle> {
        self.lock().items.get(rid).and_then(|item| item.handle(rid))
    }

    /// A resource that must be cached.
    pub fn get_item(&self, rid: &str) -> Result<ResourceHandle, CacheError> {
        self.lock()
            .get_item(rid)?
            .handle(rid)
            .ok_or_else(|| CacheError::NotFound(rid.to_string()))
    }

    /// Rids of all loaded resources, sorted.
    pub fn rids(&self) -> Vec<String> {
        let mut rids: Vec<String> = self
            .lock()
            .items
            .iter()
            .filter(|(_, item)| item.loaded)
            .map(|(rid, _)| rid.clone())
            .collect();
        rids.sort();
        rids
    }

    /// Whether `rid` is loaded.
    pub fn contains(&self, rid: &str) -> bool {
        self.lock().items.get(rid).is_some_and(|item| item.loaded)
    }

    /// Number of loaded resources.
    pub fn len(&self) -> usize {
        self.lock().items.values().filter(|item| item.loaded).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(direct, indirect)` counts of a cached resource.
    pub fn counts(&self, rid: &str) -> Option<(u32, u32)> {
        self.lock().items.get(rid).map(|item| (item.direct, item.indirect))
    }

    /// Whether `rid` awaits resubscription after a reconnect.
    pub fn is_stale(&self, rid: &str) -> bool {
        self.lock().items.get(rid).is_some_and(|item| item.stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ModelResource, ResModel};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn new_cache() -> (ResourceCache, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ResourceCache::new(tx), rx)
    }

    fn set(value: Value) -> ResourceSet {
        serde_json::from_value(value).unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn resource_events(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ResourceEvent> {
        drain(rx)
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::Resource(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    async fn release(cache: &ResourceCache, rid: &str) {
        cache.unsubscribe(rid, |_| async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_cycle_is_evicted_with_last_subscriber() {
        let (cache, _rx) = new_cache();
        cache
            .add_resources_and_subscribe(
                &set(json!({"models": {
                    "a": {"next": {"rid": "b"}},
                    "b": {"next": {"rid": "a"}},
                }})),
                "a",
            )
            .unwrap();
        assert_eq!(cache.counts("a"), Some((1, 1)));
        assert_eq!(cache.counts("b"), Some((0, 1)));

        release(&cache, "a").await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_diamond_eviction_is_order_independent() {
        for first in ["a", "b"] {
            let (cache, _rx) = new_cache();
            cache
                .add_resources_and_subscribe(
                    &set(json!({"models": {
                        "a": {"l": {"rid": "b"}, "r": {"rid": "c"}},
                        "b": {"n": {"rid": "d"}},
                        "c": {"n": {"rid": "d"}},
                        "d": {"v": 1},
                    }})),
                    "a",
                )
                .unwrap();
            cache
                .add_resources_and_subscribe(&ResourceSet::default(), "b")
                .unwrap();
            assert_eq!(cache.counts("d"), Some((0, 2)));

            release(&cache, first).await;
            if first == "a" {
                assert_eq!(cache.rids(), vec!["b", "d"]);
                assert_eq!(cache.counts("b"), Some((1, 0)));
                assert_eq!(cache.counts("d"), Some((0, 1)));
            } else {
                assert_eq!(cache.rids(), vec!["a", "b", "c", "d"]);
            }

            release(&cache, if first == "a" { "b" } else { "a" }).await;
            assert!(cache.is_empty(), "release {first} first");
        }
    }

    #[test]
    fn test_negative_reference_count_is_fatal() {
        let mut store = Store {
            items: HashMap::new(),
        };
        store.items.insert("a".into(), CacheItem::new());
        let err = store.remove_indirect("a").map(|_| ()).unwrap_err();
        assert_eq!(err, CacheError::NegativeReferences("a".into()));
        assert!(err.is_fatal());
        assert!(!CacheError::InvalidValue("x".into()).is_fatal());
    }

    #[test]
    fn test_parse_value() {
        let (cache, _rx) = new_cache();
        cache
            .add_resources_and_subscribe(&set(json!({"models": {"b": {}}})), "b")
            .unwrap();
        let mut store = cache.lock();

        assert_eq!(store.parse_value(&json!(null), false).unwrap(), ResValue::Null);
        assert_eq!(store.parse_value(&json!(true), false).unwrap(), ResValue::Bool(true));
        assert_eq!(store.parse_value(&json!(2.5), false).unwrap().as_f64(), Some(2.5));
        assert_eq!(store.parse_value(&json!("s"), false).unwrap(), ResValue::from("s"));
        assert_eq!(
            store.parse_value(&json!({"data": [1]}), false).unwrap(),
            ResValue::Data(json!([1]))
        );
        assert_eq!(
            store.parse_value(&json!({"action": "delete"}), false).unwrap(),
            ResValue::Delete
        );
        assert_eq!(
            store.parse_value(&json!({"rid": "x", "soft": true}), false).unwrap(),
            ResValue::SoftRef("x".into())
        );

        let hard = store.parse_value(&json!({"rid": "b"}), true).unwrap();
        assert_eq!(hard.hard_ref(), Some("b"));
        assert_eq!(store.items["b"].indirect, 1);

        assert_eq!(
            store.parse_value(&json!({"rid": "missing"}), true),
            Err(CacheError::NotFound("missing".into()))
        );
        assert!(matches!(
            store.parse_value(&json!([1, 2]), false),
            Err(CacheError::InvalidValue(_))
        ));
        assert!(matches!(
            store.parse_value(&json!({"foo": 1}), false),
            Err(CacheError::InvalidValue(_))
        ));
        assert!(matches!(
            store.parse_stored_value(&json!({"action": "delete"}), false),
            Err(CacheError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_soft_references_are_not_counted() {
        let (cache, _rx) = new_cache();
        let a = cache
            .add_resources_and_subscribe(
                &set(json!({"models": {"a": {"s": {"rid": "b", "soft": true}}}})),
                "a",
            )
            .unwrap();
        assert_eq!(a.get("s"), Some(ResValue::SoftRef("b".into())));
        assert_eq!(cache.rids(), vec!["a"]);
        assert_eq!(cache.counts("b"), None);
    }

    #[test]
    fn test_unreferenced_extras_are_dropped() {
        let (cache, _rx) = new_cache();
        cache
            .add_resources_and_subscribe(&set(json!({"models": {"a": {}, "stray": {}}})), "a")
            .unwrap();
        assert_eq!(cache.rids(), vec!["a"]);
    }

    #[test]
    fn test_model_resync_emits_only_differences() {
        let (cache, mut rx) = new_cache();
        cache
            .add_resources_and_subscribe(&set(json!({"models": {"example": {"foo": "bar"}}})), "example")
            .unwrap();
        assert_eq!(cache.set_all_stale(), 1);
        assert!(cache.is_stale("example"));

        cache
            .resubscribe(&set(json!({"models": {"example": {"foo": "bar"}}})), "example")
            .unwrap();
        assert!(resource_events(&mut rx).is_empty());
        assert!(!cache.is_stale("example"));

        cache
            .resubscribe(&set(json!({"models": {"example": {"foo": "baz"}}})), "example")
            .unwrap();
        let events = resource_events(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ResourceEvent::Change {
                rid,
                new_values,
                old_values,
            } => {
                assert_eq!(rid, "example");
                assert_eq!(new_values["foo"], ResValue::from("baz"));
                assert_eq!(old_values["foo"], ResValue::from("bar"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cache.counts("example"), Some((1, 0)));
    }

    #[test]
    fn test_collection_resync_prepend() {
        let (cache, mut rx) = new_cache();
        cache
            .add_resources_and_subscribe(&set(json!({"collections": {"list": ["A", "B"]}})), "list")
            .unwrap();
        cache.set_all_stale();
        let list = cache
            .resubscribe(&set(json!({"collections": {"list": ["C", "A", "B"]}})), "list")
            .unwrap();

        assert_eq!(
            resource_events(&mut rx),
            vec![ResourceEvent::Add {
                rid: "list".into(),
                index: 0,
                value: ResValue::from("C"),
            }]
        );
        assert_eq!(
            list.values().unwrap(),
            vec![ResValue::from("C"), ResValue::from("A"), ResValue::from("B")]
        );
    }

    #[tokio::test]
    async fn test_concurrent_subscribers_share_one_request() {
        let (cache, _rx) = new_cache();
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        cache
            .register_model_factory("item.*", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::new(ResModel::new())
            })
            .unwrap();

        let requests = AtomicUsize::new(0);
        let subscribe = |rid: String| {
            requests.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::task::yield_now().await;
                Ok(json!({"models": {rid: {"n": 1}}}))
            }
        };
        let (first, second) = tokio::join!(
            cache.get_or_subscribe("item.1", subscribe),
            cache.get_or_subscribe("item.1", subscribe),
        );

        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(first.same_replica(&second));
        assert_eq!(requests.load(Ordering::SeqCst), 1);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(cache.counts("item.1"), Some((2, 0)));

        let third = cache
            .get_or_subscribe("item.1", |_| async { Err(ResError::internal("not sent")) })
            .await
            .unwrap();
        assert!(third.same_replica(&first));
        assert_eq!(cache.counts("item.1"), Some((3, 0)));
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_nothing_behind() {
        let (cache, _rx) = new_cache();
        let err = cache
            .get_or_subscribe("a", |_| async { Err(ResError::new("system.accessDenied", "no")) })
            .await
            .unwrap_err();
        assert_eq!(err.code, "system.accessDenied");
        assert_eq!(cache.counts("a"), None);

        let err = cache
            .get_or_subscribe("a", |_| async { Ok(json!({"models": {"other": {}}})) })
            .await
            .unwrap_err();
        assert_eq!(err, ResError::not_found("a"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_batch_leaves_counts_untouched() {
        let (cache, _rx) = new_cache();
        cache
            .add_resources_and_subscribe(&set(json!({"models": {"c": {}}})), "c")
            .unwrap();

        let err = cache
            .add_resources_and_subscribe(
                &set(json!({"models": {"a": {"x": {"rid": "c"}, "y": {"rid": "missing"}}}})),
                "a",
            )
            .unwrap_err();
        assert_eq!(err, CacheError::NotFound("missing".into()));
        assert_eq!(cache.counts("c"), Some((1, 0)));
        assert_eq!(cache.counts("a"), None);

        let err = cache
            .add_resources_and_subscribe(
                &set(json!({"models": {"a": {"x": {"rid": "c"}}}, "collections": {"l": [[1]]}})),
                "a",
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidValue(_)));
        assert_eq!(cache.counts("c"), Some((1, 0)));

        release(&cache, "c").await;
        assert!(cache.is_empty());
    }

    #[test]
    fn test_error_root_fails_subscribe() {
        let (cache, _rx) = new_cache();
        let err = cache
            .add_resources_and_subscribe(
                &set(json!({"errors": {"a": {"code": "system.notFound", "message": "Not found"}}})),
                "a",
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::Resource(ref e) if e.code == "system.notFound"));
        assert_eq!(cache.counts("a"), None);
    }

    #[test]
    fn test_kind_mismatch_is_fatal() {
        let (cache, _rx) = new_cache();
        cache
            .add_resources_and_subscribe(&set(json!({"models": {"a": {}}})), "a")
            .unwrap();
        let err = cache
            .add_resources_and_subscribe(&set(json!({"collections": {"a": []}})), "a")
            .unwrap_err();
        assert_eq!(
            err,
            CacheError::KindMismatch {
                rid: "a".into(),
                cached: ResourceKind::Model,
                received: ResourceKind::Collection,
            }
        );
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_failed_unsubscribe_restores_count() {
        let (cache, _rx) = new_cache();
        cache
            .add_resources_and_subscribe(&set(json!({"models": {"a": {}}})), "a")
            .unwrap();
        let err = cache
            .unsubscribe("a", |_| async { Err(ResError::internal("offline")) })
            .await
            .unwrap_err();
        assert_eq!(err.message, "offline");
        assert_eq!(cache.counts("a"), Some((1, 0)));

        release(&cache, "a").await;
        assert!(cache.is_empty());
        assert!(cache.unsubscribe("a", |_| async { Ok(()) }).await.is_err());
    }

    #[test]
    fn test_events_before_load_are_dropped() {
        let (cache, mut rx) = new_cache();
        cache.lock().items.insert("a".into(), CacheItem::new());
        assert_eq!(
            cache.handle_event("a", "change", Some(json!({"values": {"x": 1}}))),
            Ok(None)
        );
        assert_eq!(cache.handle_event("unknown", "custom", None), Ok(None));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_unsubscribe_event_uses_default_reason() {
        let (cache, _rx) = new_cache();
        cache
            .add_resources_and_subscribe(&set(json!({"models": {"a": {}}})), "a")
            .unwrap();
        let event = cache.handle_event("a", "unsubscribe", None).unwrap();
        assert_eq!(
            event,
            Some(ResourceEvent::Unsubscribe {
                rid: "a".into(),
                reason: ResError::missing_reason(),
            })
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_change_event_brings_and_releases_references() {
        let (cache, mut rx) = new_cache();
        cache
            .add_resources_and_subscribe(&set(json!({"models": {"a": {"x": 1}}})), "a")
            .unwrap();

        let event = cache
            .handle_event(
                "a",
                "change",
                Some(json!({
                    "values": {"ref": {"rid": "b"}},
                    "models": {"b": {"y": 2}},
                })),
            )
            .unwrap();
        assert!(matches!(event, Some(ResourceEvent::Change { .. })));
        assert_eq!(cache.counts("b"), Some((0, 1)));

        cache
            .handle_event("a", "change", Some(json!({"values": {"ref": {"action": "delete"}}})))
            .unwrap();
        assert_eq!(cache.rids(), vec!["a"]);
        assert!(!cache.get("a").unwrap().fields().unwrap().contains_key("ref"));
        assert_eq!(resource_events(&mut rx).len(), 2);
    }

    #[test]
    fn test_collection_events() {
        let (cache, _rx) = new_cache();
        let list = cache
            .add_resources_and_subscribe(&set(json!({"collections": {"list": ["A"]}})), "list")
            .unwrap();

        cache
            .handle_event("list", "add", Some(json!({"idx": 1, "value": "B"})))
            .unwrap();
        let removed = cache
            .handle_event("list", "remove", Some(json!({"idx": 0})))
            .unwrap();
        assert_eq!(
            removed,
            Some(ResourceEvent::Remove {
                rid: "list".into(),
                index: 0,
                value: ResValue::from("A"),
            })
        );
        assert_eq!(list.values().unwrap(), vec![ResValue::from("B")]);

        assert!(matches!(
            cache.handle_event("list", "add", Some(json!({"idx": 5, "value": "C"}))),
            Err(CacheError::InvalidEvent { .. })
        ));
        assert!(matches!(
            cache.handle_event("list", "remove", Some(json!({}))),
            Err(CacheError::InvalidEvent { .. })
        ));
    }

    #[test]
    fn test_rejected_event_drops_embedded_resources() {
        let (cache, _rx) = new_cache();
        cache
            .add_resources_and_subscribe(&set(json!({"collections": {"list": []}})), "list")
            .unwrap();

        let result = cache.handle_event(
            "list",
            "add",
            Some(json!({"idx": 5, "value": {"rid": "b"}, "models": {"b": {"x": 1}}})),
        );
        assert!(matches!(result, Err(CacheError::InvalidEvent { .. })));
        assert_eq!(cache.rids(), vec!["list"]);
        assert_eq!(cache.counts("b"), None);

        let result = cache.handle_event(
            "list",
            "add",
            Some(json!({"idx": 0, "value": [1], "models": {"c": {}}})),
        );
        assert!(matches!(result, Err(CacheError::InvalidValue(_))));
        assert_eq!(cache.rids(), vec!["list"]);
    }

    #[test]
    fn test_custom_event_passes_through() {
        let (cache, _rx) = new_cache();
        cache
            .add_resources_and_subscribe(&set(json!({"models": {"a": {}}})), "a")
            .unwrap();
        let event = cache.handle_event("a", "ping", Some(json!({"n": 1}))).unwrap();
        assert_eq!(
            event,
            Some(ResourceEvent::Custom {
                rid: "a".into(),
                name: "ping".into(),
                data: Some(json!({"n": 1})),
            })
        );
    }

    struct FailingInit {
        fields: Fields,
    }

    impl ModelResource for FailingInit {
        fn fields(&self) -> &Fields {
            &self.fields
        }
        fn fields_mut(&mut self) -> &mut Fields {
            &mut self.fields
        }
        fn on_init(&mut self) -> Result<(), ResError> {
            Err(ResError::internal("boom"))
        }
    }

    #[test]
    fn test_init_hook_failure_is_reported() {
        let (cache, mut rx) = new_cache();
        cache
            .register_model_factory("bad", |_| {
                Box::new(FailingInit {
                    fields: Fields::new(),
                })
            })
            .unwrap();
        let bad = cache
            .add_resources_and_subscribe(&set(json!({"models": {"bad": {"x": 1}}})), "bad")
            .unwrap();
        assert_eq!(bad.get("x"), Some(ResValue::from(1i64)));

        let errors: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::CacheError(err) => Some(err),
                _ => None,
            })
            .collect();
        assert_eq!(
            errors,
            vec![CacheError::Handler {
                rid: "bad".into(),
                error: ResError::internal("boom"),
            }]
        );
    }

    #[tokio::test]
    async fn test_failed_resubscribe_drops_resource() {
        let (cache, mut rx) = new_cache();
        cache
            .add_resources_and_subscribe(&set(json!({"models": {"a": {}}})), "a")
            .unwrap();
        cache
            .add_resources_and_subscribe(&set(json!({"models": {"b": {}}})), "b")
            .unwrap();
        drain(&mut rx);

        assert_eq!(cache.set_all_stale(), 2);
        cache
            .subscribe_stale(|rid| async move {
                if rid == "a" {
                    Ok(json!({"models": {"a": {"k": true}}}))
                } else {
                    Err(ResError::new("system.accessDenied", "Access denied"))
                }
            })
            .await;

        assert_eq!(cache.rids(), vec!["a"]);
        assert!(!cache.is_stale("a"));
        let events = resource_events(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| matches!(
            e,
            ResourceEvent::Unsubscribe { rid, reason } if rid == "b" && reason.code == "system.accessDenied"
        )));
        assert!(events.iter().any(|e| matches!(e, ResourceEvent::Change { rid, .. } if rid == "a")));
    }
}
