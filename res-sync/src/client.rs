//! Client facade: connection lifecycle and resource requests.
//!
//! Provides:
//! - Connect, version handshake, disconnect and automatic reconnect
//! - Subscribe / unsubscribe with local subscription counting
//! - Call and auth requests returning a payload or a new resource
//! - Resynchronization of stale resources after a reconnect
//!
//! One supervisor task per client owns the inbound side of the connection.
//! It dispatches responses to waiting requests, feeds events into the cache,
//! and reconnects when the connection drops.

use std::sync::{Arc, PoisonError, RwLock as StdRwLock};

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, RwLock};

use crate::cache::ResourceCache;
use crate::config::ClientConfig;
use crate::event::ClientEvent;
use crate::pattern::PatternError;
use crate::protocol::{ProtocolError, ResError, ResourceSet};
use crate::resource::{CollectionResource, ModelResource, ResourceHandle};
use crate::rpc::RequestMultiplexer;
use crate::transport::{Transport, WsTransport};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Outcome of a call or auth request.
#[derive(Debug, Clone)]
pub enum CallResult {
    /// Plain result payload
    Payload(Value),
    /// The request created or returned a resource, now subscribed
    Resource(ResourceHandle),
}

impl CallResult {
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Payload(value) => Some(value),
            Self::Resource(_) => None,
        }
    }

    pub fn resource(&self) -> Option<&ResourceHandle> {
        match self {
            Self::Resource(handle) => Some(handle),
            Self::Payload(_) => None,
        }
    }
}

struct Inner<T> {
    config: ClientConfig,
    transport: T,
    cache: ResourceCache,
    /// Multiplexer of the live connection
    rpc: StdRwLock<Option<Arc<RequestMultiplexer>>>,
    state: RwLock<ConnectionState>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    /// Set by `disconnect` to stop the supervisor
    closing: watch::Sender<bool>,
}

/// The resource client.
pub struct ResClient<T: Transport> {
    inner: Arc<Inner<T>>,
    event_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
}

impl ResClient<WsTransport> {
    /// Client connecting over WebSocket to `config.url`.
    pub fn with_websocket(config: ClientConfig) -> Self {
        let transport = WsTransport::new(config.url.clone());
        Self::new(config, transport)
    }
}

impl<T: Transport> ResClient<T> {
    pub fn new(config: ClientConfig, transport: T) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (closing, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                cache: ResourceCache::new(event_tx.clone()),
                rpc: StdRwLock::new(None),
                state: RwLock::new(ConnectionState::Disconnected),
                event_tx,
                closing,
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.inner.cache
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    /// Connect, perform the version handshake and resubscribe anything stale.
    ///
    /// Returns once the handshake and resubscriptions are done. Does nothing
    /// if already connected or connecting.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        {
            let mut state = self.inner.state.write().await;
            if *state != ConnectionState::Disconnected {
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }
        self.inner.closing.send_replace(false);

        let (rpc, incoming) = match self.inner.open().await {
            Ok(connection) => connection,
            Err(e) => {
                log::warn!("Connecting to {} failed: {e}", self.inner.config.url);
                *self.inner.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        tokio::spawn(self.inner.clone().supervise(rpc.clone(), incoming));
        self.inner.after_connect(rpc).await;
        Ok(())
    }

    /// Close the connection and stop reconnecting. Outstanding requests fail
    /// with `system.connectionClosed`; subscriptions become stale and are
    /// resubscribed on the next `connect`.
    pub fn disconnect(&self) {
        self.inner.shutdown();
    }

    /// Subscribe to `rid`, returning its handle once loaded.
    pub async fn subscribe(&self, rid: &str) -> Result<ResourceHandle, ResError> {
        let rpc = self.inner.current_rpc();
        self.inner
            .cache
            .get_or_subscribe(rid, |rid| async move {
                match rpc {
                    Some(rpc) => rpc.call(&format!("subscribe.{rid}"), None).await,
                    None => Err(ResError::connection_closed()),
                }
            })
            .await
    }

    /// Drop one subscription to `rid`.
    pub async fn unsubscribe(&self, rid: &str) -> Result<(), ResError> {
        let rpc = self.inner.current_rpc();
        self.inner
            .cache
            .unsubscribe(rid, |rid| async move {
                match rpc {
                    Some(rpc) => rpc.call(&format!("unsubscribe.{rid}"), None).await.map(|_| ()),
                    None => Err(ResError::connection_closed()),
                }
            })
            .await
    }

    /// Call `method` on `rid`.
    pub async fn call(&self, rid: &str, method: &str, params: Option<Value>) -> Result<CallResult, ResError> {
        self.inner.request("call", rid, method, params).await
    }

    /// Authenticate through `method` on `rid`.
    pub async fn auth(&self, rid: &str, method: &str, params: Option<Value>) -> Result<CallResult, ResError> {
        self.inner.request("auth", rid, method, params).await
    }

    /// A loaded resource, without subscribing.
    pub fn get(&self, rid: &str) -> Option<ResourceHandle> {
        self.inner.cache.get(rid)
    }

    pub fn register_model_factory<F>(&self, pattern: &str, factory: F) -> Result<(), PatternError>
    where
        F: Fn(&str) -> Box<dyn ModelResource> + Send + Sync + 'static,
    {
        self.inner.cache.register_model_factory(pattern, factory)
    }

    pub fn register_collection_factory<F>(&self, pattern: &str, factory: F) -> Result<(), PatternError>
    where
        F: Fn(&str) -> Box<dyn CollectionResource> + Send + Sync + 'static,
    {
        self.inner.cache.register_collection_factory(pattern, factory)
    }
}

impl<T: Transport> Drop for ResClient<T> {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

/// Resolves once `closing` is set.
async fn closed(closing: &mut watch::Receiver<bool>) {
    let _ = closing.wait_for(|closing| *closing).await;
}

impl<T: Transport> Inner<T> {
    fn current_rpc(&self) -> Option<Arc<RequestMultiplexer>> {
        self.rpc.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_rpc(&self, rpc: Option<Arc<RequestMultiplexer>>) -> Option<Arc<RequestMultiplexer>> {
        std::mem::replace(&mut *self.rpc.write().unwrap_or_else(PoisonError::into_inner), rpc)
    }

    /// Open a transport connection and make it the live one.
    async fn open(&self) -> Result<(Arc<RequestMultiplexer>, mpsc::UnboundedReceiver<String>), ProtocolError> {
        let channel = self.transport.connect().await?;
        let rpc = Arc::new(RequestMultiplexer::new(channel.outgoing));
        self.set_rpc(Some(rpc.clone()));
        *self.state.write().await = ConnectionState::Connected;
        log::info!("Connected to {}", self.config.url);
        let _ = self.event_tx.send(ClientEvent::Connected);
        Ok((rpc, channel.incoming))
    }

    async fn after_connect(&self, rpc: Arc<RequestMultiplexer>) {
        let params = json!({ "protocol": self.config.protocol_version });
        match rpc.call("version", Some(params)).await {
            Ok(result) => log::debug!(
                "Server protocol version {}",
                result.get("protocol").and_then(Value::as_str).unwrap_or("unknown")
            ),
            Err(err) => {
                log::warn!("Version handshake failed: {err}");
                let _ = self.event_tx.send(ClientEvent::ProtocolError(ProtocolError::Handshake(err)));
            }
        }

        self.cache
            .subscribe_stale(|rid| {
                let rpc = rpc.clone();
                async move { rpc.call(&format!("subscribe.{rid}"), None).await }
            })
            .await;
    }

    /// Dispatch inbound messages until the connection drops, then reconnect
    /// unless disabled or shutting down.
    async fn supervise(
        self: Arc<Self>,
        mut rpc: Arc<RequestMultiplexer>,
        mut incoming: mpsc::UnboundedReceiver<String>,
    ) {
        let mut closing = self.closing.subscribe();
        loop {
            loop {
                tokio::select! {
                    message = incoming.recv() => match message {
                        Some(text) => self.dispatch(&rpc, &text),
                        None => break,
                    },
                    _ = closed(&mut closing) => break,
                }
            }
            self.connection_lost(&rpc).await;

            if !self.config.auto_reconnect || *closing.borrow() {
                return;
            }
            *self.state.write().await = ConnectionState::Reconnecting;

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
                    _ = closed(&mut closing) => {
                        *self.state.write().await = ConnectionState::Disconnected;
                        return;
                    }
                }
                match self.open().await {
                    Ok((new_rpc, new_incoming)) => {
                        rpc = new_rpc;
                        incoming = new_incoming;
                        break;
                    }
                    Err(e) => log::warn!("Reconnecting to {} failed: {e}", self.config.url),
                }
            }

            let inner = Arc::clone(&self);
            let live = rpc.clone();
            tokio::spawn(async move { inner.after_connect(live).await });
        }
    }

    fn dispatch(&self, rpc: &RequestMultiplexer, text: &str) {
        match rpc.handle_message(text) {
            Ok(Some(event)) => {
                if let Err(err) = self.cache.handle_event(&event.rid, &event.name, event.data) {
                    log::error!("Handling {}.{} failed: {err}", event.rid, event.name);
                    let _ = self.event_tx.send(ClientEvent::CacheError(err));
                }
            }
            Ok(None) => {}
            Err(err) => {
                log::warn!("Protocol error: {err}");
                let _ = self.event_tx.send(ClientEvent::ProtocolError(err));
            }
        }
    }

    async fn connection_lost(&self, rpc: &Arc<RequestMultiplexer>) {
        let stale = self.cache.set_all_stale();
        rpc.dispose();
        {
            let mut current = self.rpc.write().unwrap_or_else(PoisonError::into_inner);
            if current.as_ref().is_some_and(|live| Arc::ptr_eq(live, rpc)) {
                *current = None;
            }
        }
        *self.state.write().await = ConnectionState::Disconnected;
        log::info!("Disconnected from {}, {stale} subscriptions stale", self.config.url);
        let _ = self.event_tx.send(ClientEvent::Disconnected);
    }

    fn shutdown(&self) {
        self.closing.send_replace(true);
        if let Some(rpc) = self.set_rpc(None) {
            rpc.dispose();
        }
    }

    async fn request(
        &self,
        action: &str,
        rid: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<CallResult, ResError> {
        let rpc = self.current_rpc().ok_or_else(ResError::connection_closed)?;
        let result = rpc.call(&format!("{action}.{rid}.{method}"), params).await?;
        self.call_result(result)
    }

    /// Resource responses carry `rid` plus the resources to merge.
    fn call_result(&self, result: Value) -> Result<CallResult, ResError> {
        let Some(rid) = result.get("rid").and_then(Value::as_str).map(str::to_string) else {
            return Ok(CallResult::Payload(
                result.get("payload").cloned().unwrap_or(Value::Null),
            ));
        };
        let set: ResourceSet = serde_json::from_value(result)
            .map_err(|e| ResError::internal(format!("malformed resource response: {e}")))?;
        let handle = self.cache.add_resources_and_subscribe(&set, &rid)?;
        Ok(CallResult::Resource(handle))
    }
}
