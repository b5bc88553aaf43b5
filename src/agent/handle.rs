//! Supervisor-side view of a running agent.
//!
//! The agent loop owns the [`AgentState`](super::types::AgentState). The
//! handle only carries what the supervisor needs to route items and apply
//! lifecycle transitions: the inbox, the in-memory lifecycle flag, and the
//! cancellation token of the call in flight.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::inbox::Inbox;
use super::types::{AgentRecord, Lifecycle};
use crate::error::{Result, VisorError};

#[derive(Debug, Default)]
struct Status {
    lifecycle: Lifecycle,
    /// An item is being handled
    processing: bool,
    /// Evicted while processing; dies when the current item completes
    terminating: bool,
    /// Loop ended on a dequeue failure
    stopped: bool,
    /// Supervisor shutdown in progress
    closing: bool,
}

/// What a poison pill does to the agent right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionAction {
    AlreadyDead,
    /// Idle; the caller must finish the death
    DieNow,
    /// Busy; the loop applies death after the current item
    Deferred,
}

/// Summary row for listings.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgentSummary {
    pub id: String,
    pub kind: String,
    pub label: String,
    pub user_id: String,
    pub lifecycle: Lifecycle,
    pub pending: usize,
}

#[derive(Debug)]
pub struct AgentHandle {
    pub id: String,
    pub record: AgentRecord,
    pub inbox: Arc<Inbox>,
    status: Mutex<Status>,
    cancel: Mutex<Option<CancellationToken>>,
    /// Serializes wake, sleep and death transitions of this agent
    pub(crate) transition: tokio::sync::Mutex<()>,
}

impl AgentHandle {
    pub fn new(record: AgentRecord, lifecycle: Lifecycle) -> Self {
        Self {
            id: record.id.clone(),
            inbox: Arc::new(Inbox::new(&record.id)),
            record,
            status: Mutex::new(Status {
                lifecycle,
                ..Default::default()
            }),
            cancel: Mutex::new(None),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.status().lifecycle
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.status().lifecycle = lifecycle;
    }

    pub fn is_terminating(&self) -> bool {
        self.status().terminating
    }

    pub(crate) fn mark_stopped(&self) {
        self.status().stopped = true;
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.status().closing
    }

    pub(crate) fn mark_closing(&self) {
        self.status().closing = true;
    }

    /// Fails when new items must be rejected.
    pub fn accepts_posts(&self) -> Result<()> {
        let status = self.status();
        if status.lifecycle == Lifecycle::Dead || status.terminating {
            return Err(VisorError::AgentDead(self.id.clone()));
        }
        if status.stopped || status.closing {
            return Err(VisorError::InboxClosed(self.id.clone()));
        }
        Ok(())
    }

    /// Called by the loop after dequeuing. Returns false if the agent died.
    pub(crate) fn begin_item(&self) -> bool {
        let mut status = self.status();
        if status.lifecycle == Lifecycle::Dead {
            return false;
        }
        status.processing = true;
        true
    }

    /// Called by the loop after an item. Returns true if a deferred death
    /// must be applied now.
    pub(crate) fn end_item(&self) -> bool {
        let mut status = self.status();
        status.processing = false;
        if status.terminating && status.lifecycle != Lifecycle::Dead {
            status.lifecycle = Lifecycle::Dead;
            return true;
        }
        false
    }

    /// Decide how a poison pill applies.
    pub(crate) fn evict(&self) -> EvictionAction {
        let mut status = self.status();
        if status.lifecycle == Lifecycle::Dead {
            EvictionAction::AlreadyDead
        } else if status.processing {
            status.terminating = true;
            EvictionAction::Deferred
        } else {
            status.lifecycle = Lifecycle::Dead;
            EvictionAction::DieNow
        }
    }

    pub(crate) fn set_cancel(&self, token: Option<CancellationToken>) {
        *self.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = token;
    }

    /// Cancel the inference or compaction call in flight.
    pub fn abort(&self) -> bool {
        match self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            id: self.id.clone(),
            kind: self.record.descriptor.kind().to_string(),
            label: self.record.descriptor.label(),
            user_id: self.record.user_id.clone(),
            lifecycle: self.lifecycle(),
            pending: self.inbox.size(),
        }
    }
}
