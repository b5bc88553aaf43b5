//! Channels module - connector boundary to chat platforms
//!
//! Connectors deliver agent output to humans. The runtime only needs to send
//! text to a target and, optionally, show a typing indicator; wire protocols
//! live in the connector implementations.
//!
//! ```text
//! ┌──────────┐  send_message(target, msg)  ┌────────────────────┐
//! │  Agent   │ ──────────────────────────▶ │ ConnectorRegistry  │
//! └──────────┘                             │  "telegram" ─▶ ... │
//!                                          │  "slack"    ─▶ ... │
//!                                          └────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use agentvisor::channels::{ConnectorRegistry, LogConnector, OutgoingMessage};
//!
//! # tokio_test::block_on(async {
//! let registry = ConnectorRegistry::new();
//! registry.register("log", Arc::new(LogConnector)).await;
//!
//! let connector = registry.get("log").await.unwrap();
//! connector.send_message("chat-1", OutgoingMessage::text("hello")).await.unwrap();
//! # })
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::Result;

/// A message sent through a connector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    pub text: String,
    pub files: Vec<String>,
    pub reply_to_message_id: Option<String>,
}

impl OutgoingMessage {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn reply_to(mut self, message_id: Option<String>) -> Self {
        self.reply_to_message_id = message_id;
        self
    }
}

/// Stops a typing indicator when dropped or called.
pub type StopTyping = Box<dyn FnOnce() + Send>;

/// Chat platform adapter.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Send a message to `target_id` (a chat/channel id on the platform).
    async fn send_message(&self, target_id: &str, message: OutgoingMessage) -> Result<()>;

    /// Start a typing indicator; returns a callback that stops it.
    async fn start_typing(&self, _target_id: &str) -> Option<StopTyping> {
        None
    }
}

/// Connector that only logs what it would send.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogConnector;

#[async_trait]
impl Connector for LogConnector {
    async fn send_message(&self, target_id: &str, message: OutgoingMessage) -> Result<()> {
        info!(target_id = %target_id, text = %message.text, "Connector message");
        Ok(())
    }
}

/// Connectors keyed by name (the `connector` field of a user descriptor).
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: Arc<RwLock<HashMap<String, Arc<dyn Connector>>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: &str, connector: Arc<dyn Connector>) {
        let mut connectors = self.connectors.write().await;
        connectors.insert(name.to_string(), connector);
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let mut connectors = self.connectors.write().await;
        connectors.remove(name).is_some()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Connector>> {
        let connectors = self.connectors.read().await;
        connectors.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let connectors = self.connectors.read().await;
        let mut names: Vec<String> = connectors.keys().cloned().collect();
        names.sort();
        names
    }
}
