//! # res-sync — Live resource client with a reference-counted cache
//!
//! Subscribes to models and collections on a resource server and keeps local
//! replicas in sync with the events the server pushes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON over WebSocket   ┌─────────────┐
//! │ ResClient   │ ◄─────────────────────► │ Server      │
//! └──────┬──────┘                         └─────────────┘
//!        │ subscribe / call / auth
//!        ▼
//! ┌────────────────────┐  responses   ┌──────────────────┐
//! │ RequestMultiplexer │ ───────────► │ pending requests │
//! └──────┬─────────────┘              └──────────────────┘
//!        │ events
//!        ▼
//! ┌────────────────────┐  factories   ┌──────────────────┐
//! │ ResourceCache      │ ◄─────────── │ PatternRegistry  │
//! │ (replicas, counts) │              └──────────────────┘
//! └──────┬─────────────┘
//!        │ ResourceEvent
//!        ▼
//!   application (ClientEvent channel)
//! ```
//!
//! ## Modules
//!
//! - [`pattern`] — Wildcard pattern trie over dot-separated resource IDs
//! - [`registry`] — Replica factories per resource kind
//! - [`value`] — Field and collection values
//! - [`resource`] — Replica traits, default replicas and handles
//! - [`pending`] — Single-resolution completion
//! - [`cache`] — Resource cache with reachability-based eviction
//! - [`sync`] — Stale replica reconciliation
//! - [`protocol`] — JSON wire protocol and error objects
//! - [`rpc`] — Request/response multiplexer
//! - [`transport`] — Message channels and the WebSocket transport
//! - [`event`] — Events delivered to the application
//! - [`client`] — Connection lifecycle and requests
//! - [`config`] — Client configuration

pub mod cache;
pub mod client;
pub mod config;
pub mod event;
pub mod pattern;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod resource;
pub mod rpc;
pub mod sync;
pub mod transport;
pub mod value;

// Re-exports for convenience
pub use cache::{CacheError, ResourceCache};
pub use client::{CallResult, ConnectionState, ResClient};
pub use config::ClientConfig;
pub use event::{ClientEvent, ResourceEvent};
pub use pattern::{PatternError, PatternMap};
pub use pending::Pending;
pub use protocol::{IncomingEvent, ProtocolError, ResError, ResourceSet};
pub use registry::PatternRegistry;
pub use resource::{
    CollectionResource, ModelChange, ModelResource, Replica, ResCollection, ResModel,
    ResourceHandle, ResourceKind,
};
pub use rpc::RequestMultiplexer;
pub use sync::{diff_collection, diff_model, EditOp};
pub use transport::{Channel, Transport, WsTransport};
pub use value::{Fields, ResValue, ResourceRef};
