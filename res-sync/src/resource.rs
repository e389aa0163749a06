//! Local replicas of remote resources.
//!
//! A replica is created by a factory chosen through the pattern registry.
//! Applications supply their own types by implementing [`ModelResource`] or
//! [`CollectionResource`]; the cache mutates the storage they expose and then
//! calls their hooks, which may transform or suppress the delivered event.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

use crate::protocol::ResError;
use crate::value::{Fields, ResValue};

/// Kind of a cached resource. Fixed once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Model,
    Collection,
    Error,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Model => write!(f, "model"),
            Self::Collection => write!(f, "collection"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A change applied to a model: the changed fields before and after.
///
/// Added fields have [`ResValue::Delete`] as old value, removed fields have
/// it as new value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelChange {
    pub new_values: Fields,
    pub old_values: Fields,
}

pub trait ModelResource: Send + Sync {
    fn fields(&self) -> &Fields;

    fn fields_mut(&mut self) -> &mut Fields;

    /// Called once, after the initial fields have been stored.
    fn on_init(&mut self) -> Result<(), ResError> {
        Ok(())
    }

    /// Called after `change` was applied. Returning `None` suppresses it.
    fn on_change(&mut self, change: ModelChange) -> Result<Option<ModelChange>, ResError> {
        Ok(Some(change))
    }

    /// Called for custom events. Returning `false` suppresses it.
    fn on_custom(&mut self, _name: &str, _data: Option<&Value>) -> Result<bool, ResError> {
        Ok(true)
    }
}

pub trait CollectionResource: Send + Sync {
    fn values(&self) -> &[ResValue];

    fn values_mut(&mut self) -> &mut Vec<ResValue>;

    /// Called once, after the initial values have been stored.
    fn on_init(&mut self) -> Result<(), ResError> {
        Ok(())
    }

    /// Called after `value` was inserted at `index`. Returning `false` suppresses it.
    fn on_add(&mut self, _index: usize, _value: &ResValue) -> Result<bool, ResError> {
        Ok(true)
    }

    /// Called after `value` was removed from `index`. Returning `false` suppresses it.
    fn on_remove(&mut self, _index: usize, _value: &ResValue) -> Result<bool, ResError> {
        Ok(true)
    }

    fn on_custom(&mut self, _name: &str, _data: Option<&Value>) -> Result<bool, ResError> {
        Ok(true)
    }
}

/// Default model replica: a plain field map.
#[derive(Debug, Default)]
pub struct ResModel {
    fields: Fields,
}

impl ResModel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelResource for ResModel {
    fn fields(&self) -> &Fields {
        &self.fields
    }

    fn fields_mut(&mut self) -> &mut Fields {
        &mut self.fields
    }
}

/// Default collection replica: a plain value list.
#[derive(Debug, Default)]
pub struct ResCollection {
    values: Vec<ResValue>,
}

impl ResCollection {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CollectionResource for ResCollection {
    fn values(&self) -> &[ResValue] {
        &self.values
    }

    fn values_mut(&mut self) -> &mut Vec<ResValue> {
        &mut self.values
    }
}

/// Typed replica owned by a cache entry.
pub enum Replica {
    Model(Box<dyn ModelResource>),
    Collection(Box<dyn CollectionResource>),
    Error(ResError),
}

impl Replica {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Model(_) => ResourceKind::Model,
            Self::Collection(_) => ResourceKind::Collection,
            Self::Error(_) => ResourceKind::Error,
        }
    }

    /// Hard references held by this replica, one per value.
    pub(crate) fn hard_refs(&self) -> Vec<String> {
        let values: Box<dyn Iterator<Item = &ResValue> + '_> = match self {
            Self::Model(m) => Box::new(m.fields().values()),
            Self::Collection(c) => Box::new(c.values().iter()),
            Self::Error(_) => return Vec::new(),
        };
        values
            .filter_map(|v| v.hard_ref().map(str::to_string))
            .collect()
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Model(m) => f.debug_tuple("Model").field(m.fields()).finish(),
            Self::Collection(c) => f.debug_tuple("Collection").field(&c.values()).finish(),
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

pub(crate) fn read(replica: &RwLock<Replica>) -> RwLockReadGuard<'_, Replica> {
    replica.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write(replica: &RwLock<Replica>) -> RwLockWriteGuard<'_, Replica> {
    replica.write().unwrap_or_else(PoisonError::into_inner)
}

/// Application handle to a cached resource.
#[derive(Clone)]
pub struct ResourceHandle {
    rid: String,
    kind: ResourceKind,
    replica: Arc<RwLock<Replica>>,
}

impl ResourceHandle {
    pub(crate) fn new(rid: String, kind: ResourceKind, replica: Arc<RwLock<Replica>>) -> Self {
        Self { rid, kind, replica }
    }

    pub fn rid(&self) -> &str {
        &self.rid
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Snapshot of a model's fields.
    pub fn fields(&self) -> Option<Fields> {
        self.with_model(|m| m.fields().clone())
    }

    /// A single model field.
    pub fn get(&self, key: &str) -> Option<ResValue> {
        self.with_model(|m| m.fields().get(key).cloned()).flatten()
    }

    /// Snapshot of a collection's values.
    pub fn values(&self) -> Option<Vec<ResValue>> {
        self.with_collection(|c| c.values().to_vec())
    }

    /// The error, for error resources.
    pub fn error(&self) -> Option<ResError> {
        match &*read(&self.replica) {
            Replica::Error(err) => Some(err.clone()),
            _ => None,
        }
    }

    pub fn with_model<R>(&self, f: impl FnOnce(&dyn ModelResource) -> R) -> Option<R> {
        match &*read(&self.replica) {
            Replica::Model(m) => Some(f(m.as_ref())),
            _ => None,
        }
    }

    pub fn with_collection<R>(&self, f: impl FnOnce(&dyn CollectionResource) -> R) -> Option<R> {
        match &*read(&self.replica) {
            Replica::Collection(c) => Some(f(c.as_ref())),
            _ => None,
        }
    }

    /// Whether both handles point to the same replica instance.
    pub fn same_replica(&self, other: &ResourceHandle) -> bool {
        Arc::ptr_eq(&self.replica, &other.replica)
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("rid", &self.rid)
            .field("kind", &self.kind)
            .finish()
    }
}
