//! JSON wire protocol.
//!
//! ```text
//! request   {"id": 7, "method": "subscribe.users.42", "params": ...}
//! response  {"id": 7, "result": ...}  |  {"id": 7, "error": {"code", "message", "data"?}}
//! event     {"event": "users.42.change", "data": ...}
//! ```
//!
//! Resource values inside results and events:
//!
//! ```text
//! {"rid": "users.42"}              hard reference
//! {"rid": "users.42", "soft": true} soft reference
//! {"data": <any>}                  opaque data
//! {"action": "delete"}             field deletion (change events only)
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const CODE_NOT_FOUND: &str = "system.notFound";
pub const CODE_INTERNAL_ERROR: &str = "system.internalError";
pub const CODE_CONNECTION_CLOSED: &str = "system.connectionClosed";
pub const CODE_MISSING_REASON: &str = "system.missingReason";
pub const CODE_ACCESS_DENIED: &str = "system.accessDenied";

/// Application error object, as carried by error responses,
/// unsubscribe reasons and error resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn not_found(rid: &str) -> Self {
        Self::new(CODE_NOT_FOUND, format!("Resource not found: {rid}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CODE_INTERNAL_ERROR, message)
    }

    pub fn connection_closed() -> Self {
        Self::new(CODE_CONNECTION_CLOSED, "Connection closed")
    }

    pub fn missing_reason() -> Self {
        Self::new(CODE_MISSING_REASON, "Unsubscribed without a reason")
    }

    pub fn is_connection_closed(&self) -> bool {
        self.code == CODE_CONNECTION_CLOSED
    }
}

impl fmt::Display for ResError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ResError {}

/// Protocol-level failures. These never resolve an unrelated request;
/// they are reported through the client's event channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("response for unknown request id {0}")]
    UnknownRequest(u64),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("version handshake failed: {0}")]
    Handshake(ResError),
}

/// Outgoing request.
#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl Request<'_> {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Response to a request, already split into its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub outcome: Result<Value, ResError>,
}

/// Unsolicited event pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingEvent {
    pub rid: String,
    pub name: String,
    pub data: Option<Value>,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Response(Response),
    /// A response whose error object could not be decoded. The request it
    /// answers still has to be completed.
    InvalidResponse { id: u64, reason: String },
    Event(IncomingEvent),
}

impl Message {
    /// Classify and decode an inbound text message.
    ///
    /// A message with an `id` is a response, one with an `event` field is an
    /// event. The event name is everything after the last `.`.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::MalformedMessage("not an object".into()));
        };

        if let Some(id) = obj.get("id") {
            let id = id
                .as_u64()
                .ok_or_else(|| ProtocolError::MalformedMessage(format!("invalid id: {id}")))?;
            let outcome = match obj.remove("error") {
                Some(err) if !err.is_null() => match serde_json::from_value::<ResError>(err) {
                    Ok(err) => Err(err),
                    Err(e) => {
                        return Ok(Message::InvalidResponse {
                            id,
                            reason: e.to_string(),
                        })
                    }
                },
                _ => Ok(obj.remove("result").unwrap_or(Value::Null)),
            };
            return Ok(Message::Response(Response { id, outcome }));
        }

        if let Some(event) = obj.get("event") {
            let event = event
                .as_str()
                .ok_or_else(|| ProtocolError::MalformedMessage("event is not a string".into()))?;
            let (rid, name) = event
                .rsplit_once('.')
                .filter(|(rid, name)| !rid.is_empty() && !name.is_empty())
                .ok_or_else(|| ProtocolError::MalformedMessage(format!("invalid event: {event}")))?;
            let (rid, name) = (rid.to_string(), name.to_string());
            return Ok(Message::Event(IncomingEvent {
                rid,
                name,
                data: obj.remove("data"),
            }));
        }

        Err(ProtocolError::MalformedMessage(
            "neither a response nor an event".into(),
        ))
    }
}

/// A batch of resource snapshots, as found in subscribe results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSet {
    #[serde(default)]
    pub models: HashMap<String, serde_json::Map<String, Value>>,
    #[serde(default)]
    pub collections: HashMap<String, Vec<Value>>,
    #[serde(default)]
    pub errors: HashMap<String, ResError>,
}

impl ResourceSet {
    pub fn contains(&self, rid: &str) -> bool {
        self.models.contains_key(rid)
            || self.collections.contains_key(rid)
            || self.errors.contains_key(rid)
    }

    pub fn len(&self) -> usize {
        self.models.len() + self.collections.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
