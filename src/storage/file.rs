//! File-backed storage.
//!
//! Layout under the data directory:
//!
//! ```text
//! index.json                      lookup index
//! agents/<id>/agent.json          AgentRecord
//! agents/<id>/state.json          AgentState
//! agents/<id>/history.jsonl       HistoryRecord per line
//! signals/events.jsonl            Signal per line
//! signals/subscriptions.json      {version, subscriptions}
//! signals/delayed.json            {version, entries}
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use super::Storage;
use crate::agent::types::{AgentRecord, AgentState};
use crate::error::Result;
use crate::session::HistoryRecord;
use crate::signals::{DelayedSignal, Signal, SignalSubscription};

#[derive(Debug, Serialize, Deserialize)]
struct SubscriptionStore {
    version: u32,
    subscriptions: Vec<SignalSubscription>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DelayedStore {
    version: u32,
    entries: Vec<DelayedSignal>,
}

/// JSON/JSONL storage rooted at a directory.
pub struct FileStorage {
    root: PathBuf,
    index_lock: Mutex<()>,
}

impl FileStorage {
    /// Create storage rooted at `root`, creating the directory if needed.
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            index_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.root.join("agents").join(sanitize_key(agent_id))
    }

    fn signals_dir(&self) -> PathBuf {
        self.root.join("signals")
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    async fn read_index(&self) -> Result<BTreeMap<String, String>> {
        Ok(read_json(&self.index_path()).await?.unwrap_or_default())
    }
}

/// Percent-encode characters that are unsafe in file names.
///
/// - "user:slack:U1" → "user%3Aslack%3AU1"
/// - "a/b" → "a%2Fb"
fn sanitize_key(key: &str) -> String {
    let mut result = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '/' => result.push_str("%2F"),
            '\\' => result.push_str("%5C"),
            ':' => result.push_str("%3A"),
            '*' => result.push_str("%2A"),
            '?' => result.push_str("%3F"),
            '"' => result.push_str("%22"),
            '<' => result.push_str("%3C"),
            '>' => result.push_str("%3E"),
            '|' => result.push_str("%7C"),
            '%' => result.push_str("%25"),
            c => result.push(c),
        }
    }
    result
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(None);
    }
    let content = tokio::fs::read_to_string(path).await?;
    Ok(Some(serde_json::from_str(&content)?))
}

/// Write through a temp file and rename.
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Parse a JSONL file, skipping blank or unreadable lines.
async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(Vec::new());
    }
    let content = tokio::fs::read_to_string(path).await?;
    let mut records = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str(trimmed) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), line = number + 1, "Skipping unreadable record: {}", e),
        }
    }
    Ok(records)
}

#[async_trait]
impl Storage for FileStorage {
    async fn agent_record_write(&self, record: &AgentRecord) -> Result<()> {
        write_json(&self.agent_dir(&record.id).join("agent.json"), record).await
    }

    async fn agent_record_read(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        read_json(&self.agent_dir(agent_id).join("agent.json")).await
    }

    async fn agent_records_list(&self) -> Result<Vec<AgentRecord>> {
        let agents_dir = self.root.join("agents");
        if !tokio::fs::try_exists(&agents_dir).await? {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&agents_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join("agent.json");
            match read_json::<AgentRecord>(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), "Skipping unreadable agent record: {}", e),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn agent_state_write(&self, agent_id: &str, state: &AgentState) -> Result<()> {
        write_json(&self.agent_dir(agent_id).join("state.json"), state).await
    }

    async fn agent_state_read(&self, agent_id: &str) -> Result<Option<AgentState>> {
        read_json(&self.agent_dir(agent_id).join("state.json")).await
    }

    async fn history_append(&self, agent_id: &str, record: &HistoryRecord) -> Result<()> {
        append_line(&self.agent_dir(agent_id).join("history.jsonl"), record).await
    }

    async fn history_load(&self, agent_id: &str) -> Result<Vec<HistoryRecord>> {
        read_lines(&self.agent_dir(agent_id).join("history.jsonl")).await
    }

    async fn index_get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.index_lock.lock().await;
        Ok(self.read_index().await?.get(key).cloned())
    }

    async fn index_put(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        index.insert(key.to_string(), value.to_string());
        write_json(&self.index_path(), &index).await
    }

    async fn signal_append(&self, signal: &Signal) -> Result<()> {
        append_line(&self.signals_dir().join("events.jsonl"), signal).await
    }

    async fn signals_recent(&self, limit: usize) -> Result<Vec<Signal>> {
        let mut signals: Vec<Signal> = read_lines(&self.signals_dir().join("events.jsonl")).await?;
        if signals.len() > limit {
            signals.drain(..signals.len() - limit);
        }
        Ok(signals)
    }

    async fn subscriptions_load(&self) -> Result<Vec<SignalSubscription>> {
        let store: Option<SubscriptionStore> =
            read_json(&self.signals_dir().join("subscriptions.json")).await?;
        Ok(store.map(|s| s.subscriptions).unwrap_or_default())
    }

    async fn subscriptions_save(&self, subscriptions: &[SignalSubscription]) -> Result<()> {
        let store = SubscriptionStore {
            version: 1,
            subscriptions: subscriptions.to_vec(),
        };
        write_json(&self.signals_dir().join("subscriptions.json"), &store).await
    }

    async fn delayed_load(&self) -> Result<Vec<DelayedSignal>> {
        let store: Option<DelayedStore> = read_json(&self.signals_dir().join("delayed.json")).await?;
        Ok(store.map(|s| s.entries).unwrap_or_default())
    }

    async fn delayed_save(&self, entries: &[DelayedSignal]) -> Result<()> {
        let store = DelayedStore {
            version: 1,
            entries: entries.to_vec(),
        };
        write_json(&self.signals_dir().join("delayed.json"), &store).await
    }
}
