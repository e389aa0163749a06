//! Events delivered to the application.

use serde_json::Value;

use crate::cache::CacheError;
use crate::protocol::{ProtocolError, ResError};
use crate::value::{Fields, ResValue};

/// A change observed on a cached resource, either pushed live by the
/// server or generated while resynchronizing a stale replica.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    Change {
        rid: String,
        new_values: Fields,
        old_values: Fields,
    },
    Add {
        rid: String,
        index: usize,
        value: ResValue,
    },
    Remove {
        rid: String,
        index: usize,
        value: ResValue,
    },
    Unsubscribe {
        rid: String,
        reason: ResError,
    },
    Custom {
        rid: String,
        name: String,
        data: Option<Value>,
    },
}

impl ResourceEvent {
    pub fn rid(&self) -> &str {
        match self {
            Self::Change { rid, .. }
            | Self::Add { rid, .. }
            | Self::Remove { rid, .. }
            | Self::Unsubscribe { rid, .. }
            | Self::Custom { rid, .. } => rid,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Change { .. } => "change",
            Self::Add { .. } => "add",
            Self::Remove { .. } => "remove",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Custom { name, .. } => name,
        }
    }
}

/// Everything the client reports through its event channel.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection established (including after a reconnect)
    Connected,
    /// Connection lost
    Disconnected,
    Resource(ResourceEvent),
    /// A resource's replica or hooks failed, or the cache hit an inconsistency
    CacheError(CacheError),
    ProtocolError(ProtocolError),
}
