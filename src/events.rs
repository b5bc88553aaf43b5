//! Process-wide event notifications for external observers.
//!
//! Dashboards and streaming endpoints subscribe here. Nothing inside the
//! runtime reacts to these events; control flow goes through direct calls and
//! the signal bus.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::utils::clock::{Clock, SystemClock};

const DEFAULT_CAPACITY: usize = 256;

/// A named event with a JSON payload.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EngineEvent {
    pub name: String,
    pub payload: serde_json::Value,
    pub at: i64,
}

/// Broadcast emitter. Emitting with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Emit `name` with `payload`.
    ///
    /// # Example
    /// ```
    /// use agentvisor::events::EventBus;
    ///
    /// # tokio_test::block_on(async {
    /// let bus = EventBus::new();
    /// let mut rx = bus.subscribe();
    /// bus.emit("agent.created", serde_json::json!({"agentId": "a1"}));
    /// let event = rx.recv().await.unwrap();
    /// assert_eq!(event.name, "agent.created");
    /// # })
    /// ```
    pub fn emit(&self, name: &str, payload: serde_json::Value) {
        let event = EngineEvent {
            name: name.to_string(),
            payload,
            at: SystemClock.now_ms(),
        };
        let _ = self.sender.send(event);
    }
}
