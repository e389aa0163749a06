//! Message channel abstraction and the WebSocket transport.
//!
//! A connected [`Channel`] is a pair of unbounded queues of whole text
//! messages. The connection is gone once `incoming` yields `None`; dropping
//! every `outgoing` sender closes it from our side.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::ProtocolError;

/// One established connection.
pub struct Channel {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

impl Channel {
    /// Two connected in-memory channels: whatever one side sends the other
    /// receives.
    pub fn pair() -> (Channel, Channel) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Channel {
                outgoing: a_tx,
                incoming: b_rx,
            },
            Channel {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }
}

/// Opens connections to the server.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<Channel, ProtocolError>> + Send;
}

/// WebSocket transport using text frames.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    fn connect(&self) -> impl Future<Output = Result<Channel, ProtocolError>> + Send {
        let url = self.url.clone();
        async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| ProtocolError::Transport(e.to_string()))?;
            log::info!("Connected to {url}");
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

            // Writer task: forward outgoing messages until every sender is gone
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = ws_writer.send(WsMessage::Text(text.into())).await {
                        log::warn!("WebSocket send failed: {e}");
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            // Reader task: forward text frames until the socket closes
            tokio::spawn(async move {
                while let Some(frame) = ws_reader.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => {
                            if in_tx.send(text.as_str().to_owned()).is_err() {
                                break;
                            }
                        }
                        Ok(WsMessage::Close(_)) => break,
                        Err(e) => {
                            log::warn!("WebSocket read failed: {e}");
                            break;
                        }
                        _ => {}
                    }
                }
                log::debug!("WebSocket reader finished");
            });

            Ok(Channel {
                outgoing: out_tx,
                incoming: in_rx,
            })
        }
    }
}
