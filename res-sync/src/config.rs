//! Client configuration.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Server WebSocket URL
    pub url: String,
    /// Protocol version announced in the `version` handshake
    pub protocol_version: String,
    /// Reconnect automatically after losing the connection
    pub auto_reconnect: bool,
    /// Delay between reconnect attempts in milliseconds
    pub reconnect_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            protocol_version: "1.2.1".to_string(),
            auto_reconnect: true,
            reconnect_delay_ms: 3000,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
