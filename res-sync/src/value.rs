//! Local values parsed from wire tokens.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{RwLock, Weak};

use serde_json::{Number, Value};

use crate::resource::{Replica, ResourceHandle, ResourceKind};

/// Named fields of a model.
pub type Fields = BTreeMap<String, ResValue>;

/// A hard reference to another cached resource.
///
/// Holds the replica weakly: the cache entry owns it, and reference
/// cycles between replicas must not keep each other alive.
#[derive(Clone)]
pub struct ResourceRef {
    rid: String,
    kind: ResourceKind,
    replica: Weak<RwLock<Replica>>,
}

impl ResourceRef {
    pub(crate) fn new(rid: String, kind: ResourceKind, replica: Weak<RwLock<Replica>>) -> Self {
        Self { rid, kind, replica }
    }

    pub fn rid(&self) -> &str {
        &self.rid
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// The referenced resource, if it is still alive.
    pub fn upgrade(&self) -> Option<ResourceHandle> {
        self.replica
            .upgrade()
            .map(|replica| ResourceHandle::new(self.rid.clone(), self.kind, replica))
    }
}

impl PartialEq for ResourceRef {
    fn eq(&self, other: &Self) -> bool {
        self.rid == other.rid
    }
}

impl fmt::Debug for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRef")
            .field("rid", &self.rid)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A field or collection value.
#[derive(Debug, Clone, PartialEq)]
pub enum ResValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// Counted reference keeping the referenced resource cached.
    Resource(ResourceRef),
    /// Uncounted reference, identification only.
    SoftRef(String),
    /// Opaque JSON passed through unchanged.
    Data(Value),
    /// Field deletion marker, only valid inside change events.
    Delete,
}

impl ResValue {
    /// The rid of a hard reference.
    pub fn hard_ref(&self) -> Option<&str> {
        match self {
            ResValue::Resource(r) => Some(r.rid()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ResValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ResValue::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ResValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, ResValue::Delete)
    }

    /// Convert back to the wire representation.
    pub fn to_json(&self) -> Value {
        match self {
            ResValue::Null => Value::Null,
            ResValue::Bool(b) => Value::Bool(*b),
            ResValue::Number(n) => Value::Number(n.clone()),
            ResValue::String(s) => Value::String(s.clone()),
            ResValue::Resource(r) => serde_json::json!({ "rid": r.rid() }),
            ResValue::SoftRef(rid) => serde_json::json!({ "rid": rid, "soft": true }),
            ResValue::Data(data) => serde_json::json!({ "data": data }),
            ResValue::Delete => serde_json::json!({ "action": "delete" }),
        }
    }
}

impl From<&str> for ResValue {
    fn from(s: &str) -> Self {
        ResValue::String(s.to_string())
    }
}

impl From<String> for ResValue {
    fn from(s: String) -> Self {
        ResValue::String(s)
    }
}

impl From<bool> for ResValue {
    fn from(b: bool) -> Self {
        ResValue::Bool(b)
    }
}

impl From<i64> for ResValue {
    fn from(n: i64) -> Self {
        ResValue::Number(n.into())
    }
}
