//! Commands posted to the worker by foreground pages.

use crate::clients::ClientId;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Commands the worker understands.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// Add these URLs to the current cache.
    #[serde(rename = "CACHE_ASSETS")]
    CacheAssets { urls: Vec<String> },
}

impl WorkerMessage {
    /// Parse a posted value. Anything unrecognized yields `None`.
    pub fn parse(data: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }
}

/// Reply sent back over the message port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReply {
    pub success: bool,
}

/// One end of a reply channel handed over with a message.
#[derive(Debug)]
pub struct MessagePort(oneshot::Sender<serde_json::Value>);

impl MessagePort {
    /// Create a port and the receiver the sending page keeps.
    pub fn channel() -> (Self, oneshot::Receiver<serde_json::Value>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Send a value. Returns false if the page stopped listening.
    pub fn post_message(self, data: serde_json::Value) -> bool {
        self.0.send(data).is_ok()
    }
}

/// A message event.
#[derive(Debug)]
pub struct MessageEvent {
    pub data: serde_json::Value,
    pub source: Option<ClientId>,
    pub ports: Vec<MessagePort>,
}

impl MessageEvent {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            source: None,
            ports: Vec::new(),
        }
    }

    /// Attach a reply port; returns the receiving end.
    pub fn with_reply(mut self) -> (Self, oneshot::Receiver<serde_json::Value>) {
        let (port, rx) = MessagePort::channel();
        self.ports.push(port);
        (self, rx)
    }

    /// Reply on the first port, if there is one.
    pub fn reply(mut self, reply: MessageReply) -> bool {
        if self.ports.is_empty() {
            return false;
        }
        let port = self.ports.remove(0);
        match serde_json::to_value(reply) {
            Ok(value) => port.post_message(value),
            Err(_) => false,
        }
    }
}
