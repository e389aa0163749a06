//! Request/response correlation over one connection.
//!
//! Each request gets the next id and a pending record holding its callback.
//! The callback fires exactly once: with the response, with a send failure,
//! or with `system.connectionClosed` when the multiplexer is disposed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{IncomingEvent, Message, ProtocolError, Request, ResError, Response};

type Callback = Box<dyn FnOnce(Result<Value, ResError>) + Send>;

struct PendingRequest {
    method: String,
    callback: Callback,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RequestMultiplexer {
    /// Writer side of the connection. `None` once disposed.
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Outstanding requests by id. `None` once disposed.
    requests: Mutex<Option<HashMap<u64, PendingRequest>>>,
    next_id: AtomicU64,
}

impl RequestMultiplexer {
    pub fn new(outgoing: mpsc::UnboundedSender<String>) -> Self {
        Self {
            outgoing: Mutex::new(Some(outgoing)),
            requests: Mutex::new(Some(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Send a request and register `callback` for its outcome.
    ///
    /// Returns the request id, or `None` if the request could not be
    /// registered, in which case `callback` has already been called.
    pub fn request<F>(&self, method: &str, params: Option<Value>, callback: F) -> Option<u64>
    where
        F: FnOnce(Result<Value, ResError>) + Send + 'static,
    {
        let mut requests = lock(&self.requests);
        if requests.is_none() {
            drop(requests);
            callback(Err(ResError::connection_closed()));
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let encoded = match (Request {
            id,
            method,
            params: params.as_ref(),
        })
        .encode()
        {
            Ok(encoded) => encoded,
            Err(err) => {
                drop(requests);
                callback(Err(ResError::internal(err.to_string())));
                return None;
            }
        };
        if let Some(table) = requests.as_mut() {
            table.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    callback: Box::new(callback),
                },
            );
        }
        drop(requests);

        log::trace!("-> {encoded}");
        let sent = lock(&self.outgoing)
            .as_ref()
            .is_some_and(|tx| tx.send(encoded).is_ok());
        if !sent {
            let failed = lock(&self.requests).as_mut().and_then(|table| table.remove(&id));
            if let Some(request) = failed {
                log::warn!("Sending {} failed: connection closed", request.method);
                (request.callback)(Err(ResError::connection_closed()));
            }
        }
        Some(id)
    }

    /// Send a request and wait for its outcome.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, ResError> {
        let (tx, rx) = oneshot::channel();
        self.request(method, params, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.unwrap_or_else(|_| Err(ResError::connection_closed()))
    }

    /// Dispatch one inbound message.
    ///
    /// Responses complete their request and yield `None`. Events are returned
    /// to the caller for routing.
    pub fn handle_message(&self, text: &str) -> Result<Option<IncomingEvent>, ProtocolError> {
        log::trace!("<- {text}");
        match Message::decode(text)? {
            Message::Response(Response { id, outcome }) => {
                let request = lock(&self.requests).as_mut().and_then(|table| table.remove(&id));
                let Some(request) = request else {
                    return Err(ProtocolError::UnknownRequest(id));
                };
                if let Err(err) = &outcome {
                    log::debug!("Request {id} ({}) failed: {err}", request.method);
                }
                (request.callback)(outcome);
                Ok(None)
            }
            Message::InvalidResponse { id, reason } => {
                let request = lock(&self.requests).as_mut().and_then(|table| table.remove(&id));
                if let Some(request) = request {
                    log::warn!("Request {id} ({}) got an invalid response: {reason}", request.method);
                    (request.callback)(Err(ResError::internal(format!("invalid response: {reason}"))));
                }
                Err(ProtocolError::MalformedMessage(reason))
            }
            Message::Event(event) => Ok(Some(event)),
        }
    }

    /// Resolve every outstanding request with `system.connectionClosed` and
    /// release the connection. Later requests fail immediately.
    pub fn dispose(&self) {
        let table = lock(&self.requests).take();
        if let Some(table) = table {
            let mut outstanding: Vec<(u64, PendingRequest)> = table.into_iter().collect();
            outstanding.sort_by_key(|(id, _)| *id);
            if !outstanding.is_empty() {
                log::info!("Closing {} outstanding requests", outstanding.len());
            }
            for (_, request) in outstanding {
                (request.callback)(Err(ResError::connection_closed()));
            }
        }
        lock(&self.outgoing).take();
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.requests).is_none()
    }

    /// Number of requests awaiting a response.
    pub fn outstanding(&self) -> usize {
        lock(&self.requests).as_ref().map_or(0, HashMap::len)
    }
}

impl Drop for RequestMultiplexer {
    fn drop(&mut self) {
        self.dispose();
    }
}
