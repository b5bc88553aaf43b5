//! Append-side of an agent's history.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::session::HistoryRecord;
use crate::storage::Storage;
use crate::utils::clock::Clock;

/// Writes history records for one agent.
///
/// Timestamps handed out by [`HistoryLog::stamp`] strictly increase, so a
/// record written after another always sorts after it even within the same
/// millisecond.
pub struct HistoryLog {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    agent_id: String,
    last_at: AtomicI64,
}

impl HistoryLog {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, agent_id: &str) -> Self {
        Self {
            storage,
            clock,
            agent_id: agent_id.to_string(),
            last_at: AtomicI64::new(i64::MIN),
        }
    }

    /// Next record timestamp.
    pub fn stamp(&self) -> i64 {
        let now = self.clock.now_ms();
        let previous = self
            .last_at
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or(now);
        now.max(previous.saturating_add(1))
    }

    /// Append `record`. Failures are logged; in-memory progress continues.
    pub async fn append(&self, record: HistoryRecord) {
        if let Err(e) = self.storage.history_append(&self.agent_id, &record).await {
            warn!(agent_id = %self.agent_id, "Failed to append history record: {}", e);
        }
    }

    pub async fn load(&self) -> crate::error::Result<Vec<HistoryRecord>> {
        self.storage.history_load(&self.agent_id).await
    }
}
