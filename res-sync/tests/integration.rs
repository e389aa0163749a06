//! End-to-end tests driving a client against an in-memory server.
//!
//! The transport hands the server side of every connection to the test,
//! which plays the server by reading requests and writing responses and
//! events.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use res_sync::{
    CallResult, Channel, ClientConfig, ClientEvent, ConnectionState, ProtocolError, ResClient,
    ResValue, ResourceEvent, Transport,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(2);

struct MemoryTransport {
    servers: mpsc::UnboundedSender<Channel>,
    refuse: Arc<AtomicBool>,
}

impl Transport for MemoryTransport {
    fn connect(&self) -> impl Future<Output = Result<Channel, ProtocolError>> + Send {
        let result = if self.refuse.load(Ordering::SeqCst) {
            Err(ProtocolError::Transport("refused".into()))
        } else {
            let (client, server) = Channel::pair();
            self.servers
                .send(server)
                .map(|_| client)
                .map_err(|_| ProtocolError::Transport("no server".into()))
        };
        async move { result }
    }
}

/// Server side of one connection.
struct Server {
    channel: Channel,
}

impl Server {
    /// Next request, asserting its method.
    async fn expect(&mut self, method: &str) -> (u64, Option<Value>) {
        let (id, got, params) = self.next_request().await;
        assert_eq!(got, method);
        (id, params)
    }

    async fn next_request(&mut self) -> (u64, String, Option<Value>) {
        let text = timeout(WAIT, self.channel.incoming.recv())
            .await
            .expect("request within timeout")
            .expect("connection open");
        let request: Value = serde_json::from_str(&text).unwrap();
        (
            request["id"].as_u64().unwrap(),
            request["method"].as_str().unwrap().to_string(),
            request.get("params").cloned(),
        )
    }

    fn reply(&self, id: u64, result: Value) {
        self.send(json!({"id": id, "result": result}));
    }

    fn reply_error(&self, id: u64, code: &str, message: &str) {
        self.send(json!({"id": id, "error": {"code": code, "message": message}}));
    }

    fn event(&self, event: &str, data: Value) {
        self.send(json!({"event": event, "data": data}));
    }

    fn send(&self, message: Value) {
        self.channel.outgoing.send(message.to_string()).unwrap();
    }
}

struct Harness {
    client: ResClient<MemoryTransport>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    servers: mpsc::UnboundedReceiver<Channel>,
    refuse: Arc<AtomicBool>,
}

impl Harness {
    fn new(auto_reconnect: bool) -> Self {
        let (tx, servers) = mpsc::unbounded_channel();
        let refuse = Arc::new(AtomicBool::new(false));
        let config = ClientConfig {
            auto_reconnect,
            reconnect_delay_ms: 10,
            ..ClientConfig::default()
        };
        let mut client = ResClient::new(
            config,
            MemoryTransport {
                servers: tx,
                refuse: refuse.clone(),
            },
        );
        let events = client.take_event_rx().unwrap();
        Self {
            client,
            events,
            servers,
            refuse,
        }
    }

    /// Accept the next connection and answer its version handshake.
    async fn accept(servers: &mut mpsc::UnboundedReceiver<Channel>) -> Server {
        let channel = timeout(WAIT, servers.recv())
            .await
            .expect("connection within timeout")
            .unwrap();
        let mut server = Server { channel };
        let (id, params) = server.expect("version").await;
        assert_eq!(params, Some(json!({"protocol": "1.2.1"})));
        server.reply(id, json!({"protocol": "1.2.1"}));
        server
    }

    async fn connect(&mut self) -> Server {
        let (connected, server) = tokio::join!(self.client.connect(), Self::accept(&mut self.servers));
        connected.unwrap();
        server
    }

    async fn next_event(&mut self) -> ClientEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("event within timeout")
            .unwrap()
    }

    async fn next_resource_event(&mut self) -> ResourceEvent {
        loop {
            if let ClientEvent::Resource(event) = self.next_event().await {
                return event;
            }
        }
    }

    async fn wait_for(&mut self, wanted: fn(&ClientEvent) -> bool) {
        loop {
            if wanted(&self.next_event().await) {
                return;
            }
        }
    }
}

#[tokio::test]
async fn test_connect_sends_version_handshake() {
    let mut h = Harness::new(false);
    let _server = h.connect().await;
    assert!(matches!(h.next_event().await, ClientEvent::Connected));
    assert_eq!(h.client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_subscribe_event_unsubscribe() {
    let mut h = Harness::new(false);
    let mut server = h.connect().await;

    let (model, ()) = tokio::join!(h.client.subscribe("example.model"), async {
        let (id, params) = server.expect("subscribe.example.model").await;
        assert_eq!(params, None);
        server.reply(id, json!({"models": {"example.model": {"message": "Hello"}}}));
    });
    let model = model.unwrap();
    assert_eq!(model.get("message"), Some(ResValue::from("Hello")));

    server.event("example.model.change", json!({"values": {"message": "Hi"}}));
    match h.next_resource_event().await {
        ResourceEvent::Change {
            rid,
            new_values,
            old_values,
        } => {
            assert_eq!(rid, "example.model");
            assert_eq!(new_values["message"], ResValue::from("Hi"));
            assert_eq!(old_values["message"], ResValue::from("Hello"));
        }
        other => panic!("Expected change event, got {other:?}"),
    }
    assert_eq!(model.get("message"), Some(ResValue::from("Hi")));

    let (unsubscribed, ()) = tokio::join!(h.client.unsubscribe("example.model"), async {
        let (id, _) = server.expect("unsubscribe.example.model").await;
        server.reply(id, Value::Null);
    });
    unsubscribed.unwrap();
    assert!(h.client.get("example.model").is_none());
}

#[tokio::test]
async fn test_concurrent_subscribes_send_one_request() {
    let mut h = Harness::new(false);
    let mut server = h.connect().await;

    let (a, b, ()) = tokio::join!(
        h.client.subscribe("example.list"),
        h.client.subscribe("example.list"),
        async {
            let (id, _) = server.expect("subscribe.example.list").await;
            server.reply(id, json!({"collections": {"example.list": [1, 2]}}));
        }
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.same_replica(&b));
    assert_eq!(h.client.cache().counts("example.list"), Some((2, 0)));

    // The first unsubscribe is local only
    h.client.unsubscribe("example.list").await.unwrap();
    assert!(server.channel.incoming.try_recv().is_err());

    let (last, ()) = tokio::join!(h.client.unsubscribe("example.list"), async {
        let (id, _) = server.expect("unsubscribe.example.list").await;
        server.reply(id, Value::Null);
    });
    last.unwrap();
    assert!(h.client.cache().is_empty());
}

#[tokio::test]
async fn test_subscribe_error_response() {
    let mut h = Harness::new(false);
    let mut server = h.connect().await;

    let (result, ()) = tokio::join!(h.client.subscribe("example.missing"), async {
        let (id, _) = server.expect("subscribe.example.missing").await;
        server.reply_error(id, "system.notFound", "Not found");
    });
    let err = result.unwrap_err();
    assert_eq!(err.code, "system.notFound");
    assert_eq!(err.message, "Not found");
    assert!(h.client.cache().is_empty());
}

#[tokio::test]
async fn test_call_and_auth_results() {
    let mut h = Harness::new(false);
    let mut server = h.connect().await;

    let (called, ()) = tokio::join!(
        h.client.call("example.model", "set", Some(json!({"message": "x"}))),
        async {
            let (id, params) = server.expect("call.example.model.set").await;
            assert_eq!(params, Some(json!({"message": "x"})));
            server.reply(id, json!({"payload": {"ok": true}}));
        }
    );
    assert_eq!(called.unwrap().payload(), Some(&json!({"ok": true})));

    let (authed, ()) = tokio::join!(h.client.auth("example.auth", "login", None), async {
        let (id, _) = server.expect("auth.example.auth.login").await;
        server.reply(
            id,
            json!({
                "rid": "example.session",
                "models": {"example.session": {"user": "ann"}},
            }),
        );
    });
    match authed.unwrap() {
        CallResult::Resource(session) => {
            assert_eq!(session.rid(), "example.session");
            assert_eq!(session.get("user"), Some(ResValue::from("ann")));
        }
        other => panic!("Expected resource, got {other:?}"),
    }
    assert_eq!(h.client.cache().counts("example.session"), Some((1, 0)));
}

#[tokio::test]
async fn test_server_unsubscribe_carries_reason() {
    let mut h = Harness::new(false);
    let mut server = h.connect().await;

    let (model, ()) = tokio::join!(h.client.subscribe("example.model"), async {
        let (id, _) = server.expect("subscribe.example.model").await;
        server.reply(id, json!({"models": {"example.model": {}}}));
    });
    model.unwrap();

    server.event(
        "example.model.unsubscribe",
        json!({"reason": {"code": "system.accessDenied", "message": "Access denied"}}),
    );
    match h.next_resource_event().await {
        ResourceEvent::Unsubscribe { rid, reason } => {
            assert_eq!(rid, "example.model");
            assert_eq!(reason.code, "system.accessDenied");
        }
        other => panic!("Expected unsubscribe event, got {other:?}"),
    }
    assert!(h.client.get("example.model").is_none());
}

#[tokio::test]
async fn test_malformed_message_is_reported() {
    let mut h = Harness::new(false);
    let server = h.connect().await;

    server.channel.outgoing.send("garbage".into()).unwrap();
    h.wait_for(|e| matches!(e, ClientEvent::ProtocolError(ProtocolError::MalformedMessage(_))))
        .await;

    server.send(json!({"id": 999, "result": null}));
    h.wait_for(|e| matches!(e, ClientEvent::ProtocolError(ProtocolError::UnknownRequest(999))))
        .await;
}

#[tokio::test]
async fn test_disconnect_fails_outstanding_requests() {
    let mut h = Harness::new(false);
    let mut server = h.connect().await;

    let (result, ()) = tokio::join!(h.client.call("example.model", "slow", None), async move {
        server.expect("call.example.model.slow").await;
        drop(server);
    });
    assert!(result.unwrap_err().is_connection_closed());

    h.wait_for(|e| matches!(e, ClientEvent::Disconnected)).await;
    assert_eq!(h.client.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_reconnect_resynchronizes_stale_resources() {
    let mut h = Harness::new(true);
    let mut server = h.connect().await;

    let (model, ()) = tokio::join!(h.client.subscribe("example.model"), async {
        let (id, _) = server.expect("subscribe.example.model").await;
        server.reply(id, json!({"models": {"example.model": {"foo": "bar"}}}));
    });
    let model = model.unwrap();
    let (list, ()) = tokio::join!(h.client.subscribe("example.list"), async {
        let (id, _) = server.expect("subscribe.example.list").await;
        server.reply(id, json!({"collections": {"example.list": ["A", "B"]}}));
    });
    let list = list.unwrap();

    h.refuse.store(true, Ordering::SeqCst);
    drop(server);
    h.wait_for(|e| matches!(e, ClientEvent::Disconnected)).await;
    assert!(h.client.cache().is_stale("example.model"));
    assert!(h.client.cache().is_stale("example.list"));

    h.refuse.store(false, Ordering::SeqCst);
    let mut server = Harness::accept(&mut h.servers).await;
    for _ in 0..2 {
        let (id, method, _) = server.next_request().await;
        match method.as_str() {
            "subscribe.example.model" => {
                server.reply(id, json!({"models": {"example.model": {"foo": "baz"}}}))
            }
            "subscribe.example.list" => {
                server.reply(id, json!({"collections": {"example.list": ["C", "A", "B"]}}))
            }
            other => panic!("unexpected request {other}"),
        }
    }

    let mut resynced = vec![h.next_resource_event().await, h.next_resource_event().await];
    resynced.sort_by(|a, b| a.rid().cmp(b.rid()));
    assert_eq!(
        resynced[0],
        ResourceEvent::Add {
            rid: "example.list".into(),
            index: 0,
            value: ResValue::from("C"),
        }
    );
    assert!(matches!(&resynced[1], ResourceEvent::Change { rid, .. } if rid == "example.model"));

    assert_eq!(model.get("foo"), Some(ResValue::from("baz")));
    assert_eq!(list.values().unwrap().len(), 3);
    assert!(!h.client.cache().is_stale("example.model"));
    assert_eq!(h.client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_explicit_disconnect_stops_reconnecting() {
    let mut h = Harness::new(true);
    let _server = h.connect().await;

    h.client.disconnect();
    h.wait_for(|e| matches!(e, ClientEvent::Disconnected)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.servers.try_recv().is_err());
    assert_eq!(h.client.connection_state().await, ConnectionState::Disconnected);
}
