//! In-process storage.
//!
//! Sharing one `Arc<MemoryStorage>` between two supervisors simulates a
//! process restart without touching the filesystem.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::Storage;
use crate::agent::types::{AgentRecord, AgentState};
use crate::error::Result;
use crate::session::HistoryRecord;
use crate::signals::{DelayedSignal, Signal, SignalSubscription};

#[derive(Default)]
struct Tables {
    records: HashMap<String, AgentRecord>,
    states: HashMap<String, AgentState>,
    history: HashMap<String, Vec<HistoryRecord>>,
    index: HashMap<String, String>,
    signals: Vec<Signal>,
    subscriptions: Vec<SignalSubscription>,
    delayed: Vec<DelayedSignal>,
}

/// Map-backed [`Storage`].
#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn agent_record_write(&self, record: &AgentRecord) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn agent_record_read(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        Ok(self.tables.lock().await.records.get(agent_id).cloned())
    }

    async fn agent_records_list(&self) -> Result<Vec<AgentRecord>> {
        let tables = self.tables.lock().await;
        let mut records: Vec<AgentRecord> = tables.records.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn agent_state_write(&self, agent_id: &str, state: &AgentState) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.states.insert(agent_id.to_string(), state.clone());
        Ok(())
    }

    async fn agent_state_read(&self, agent_id: &str) -> Result<Option<AgentState>> {
        Ok(self.tables.lock().await.states.get(agent_id).cloned())
    }

    async fn history_append(&self, agent_id: &str, record: &HistoryRecord) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables
            .history
            .entry(agent_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn history_load(&self, agent_id: &str) -> Result<Vec<HistoryRecord>> {
        Ok(self
            .tables
            .lock()
            .await
            .history
            .get(agent_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn index_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.tables.lock().await.index.get(key).cloned())
    }

    async fn index_put(&self, key: &str, value: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.index.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn signal_append(&self, signal: &Signal) -> Result<()> {
        self.tables.lock().await.signals.push(signal.clone());
        Ok(())
    }

    async fn signals_recent(&self, limit: usize) -> Result<Vec<Signal>> {
        let tables = self.tables.lock().await;
        let start = tables.signals.len().saturating_sub(limit);
        Ok(tables.signals[start..].to_vec())
    }

    async fn subscriptions_load(&self) -> Result<Vec<SignalSubscription>> {
        Ok(self.tables.lock().await.subscriptions.clone())
    }

    async fn subscriptions_save(&self, subscriptions: &[SignalSubscription]) -> Result<()> {
        self.tables.lock().await.subscriptions = subscriptions.to_vec();
        Ok(())
    }

    async fn delayed_load(&self) -> Result<Vec<DelayedSignal>> {
        Ok(self.tables.lock().await.delayed.clone())
    }

    async fn delayed_save(&self, entries: &[DelayedSignal]) -> Result<()> {
        self.tables.lock().await.delayed = entries.to_vec();
        Ok(())
    }
}
