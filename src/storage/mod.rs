//! Durable storage boundary.
//!
//! Storage is the authoritative copy of agent identity, state and history,
//! signal subscriptions, the signal event log and delayed entries. In-memory
//! registries are caches rebuilt from it on start.
//!
//! Two implementations ship with the crate:
//! - [`FileStorage`]: JSON/JSONL files under a data directory
//! - [`MemoryStorage`]: process-local maps, used by tests and dry runs

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;

use crate::agent::types::{AgentRecord, AgentState};
use crate::error::Result;
use crate::session::HistoryRecord;
use crate::signals::{DelayedSignal, Signal, SignalSubscription};

#[async_trait]
pub trait Storage: Send + Sync {
    // Agents
    async fn agent_record_write(&self, record: &AgentRecord) -> Result<()>;
    async fn agent_record_read(&self, agent_id: &str) -> Result<Option<AgentRecord>>;
    async fn agent_records_list(&self) -> Result<Vec<AgentRecord>>;
    async fn agent_state_write(&self, agent_id: &str, state: &AgentState) -> Result<()>;
    async fn agent_state_read(&self, agent_id: &str) -> Result<Option<AgentState>>;

    // History
    async fn history_append(&self, agent_id: &str, record: &HistoryRecord) -> Result<()>;
    async fn history_load(&self, agent_id: &str) -> Result<Vec<HistoryRecord>>;

    // Lookup index (descriptor keys, owning accounts)
    async fn index_get(&self, key: &str) -> Result<Option<String>>;
    async fn index_put(&self, key: &str, value: &str) -> Result<()>;

    // Signals
    async fn signal_append(&self, signal: &Signal) -> Result<()>;
    /// Most recent signals, oldest first.
    async fn signals_recent(&self, limit: usize) -> Result<Vec<Signal>>;
    async fn subscriptions_load(&self) -> Result<Vec<SignalSubscription>>;
    async fn subscriptions_save(&self, subscriptions: &[SignalSubscription]) -> Result<()>;

    // Delayed entries
    async fn delayed_load(&self) -> Result<Vec<DelayedSignal>>;
    async fn delayed_save(&self, entries: &[DelayedSignal]) -> Result<()>;
}
