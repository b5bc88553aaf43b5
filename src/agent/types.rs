//! Agent data model: descriptors, persisted state, inbox items and results.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::providers::{TokenSnapshot, Usage};
use crate::session::Message;
use crate::signals::Signal;

/// Why an agent exists. Immutable once the agent is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentDescriptor {
    /// Bound to one external user on one connector channel
    User {
        connector: String,
        user_id: String,
        channel_id: String,
    },
    Cron {
        id: String,
    },
    Task {
        id: String,
    },
    System {
        tag: String,
    },
    Subagent {
        id: String,
        parent_agent_id: String,
        name: String,
    },
    App {
        id: String,
        parent_agent_id: String,
        name: String,
        app_id: String,
    },
    Permanent {
        id: String,
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        system_prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace_dir: Option<String>,
    },
    MemoryAgent {
        id: String,
    },
    Subuser {
        id: String,
        name: String,
    },
}

impl AgentDescriptor {
    /// Stable kind name, matching the serialized tag.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentDescriptor::User { .. } => "user",
            AgentDescriptor::Cron { .. } => "cron",
            AgentDescriptor::Task { .. } => "task",
            AgentDescriptor::System { .. } => "system",
            AgentDescriptor::Subagent { .. } => "subagent",
            AgentDescriptor::App { .. } => "app",
            AgentDescriptor::Permanent { .. } => "permanent",
            AgentDescriptor::MemoryAgent { .. } => "memory-agent",
            AgentDescriptor::Subuser { .. } => "subuser",
        }
    }

    /// Only spawned workers are killed after sitting asleep too long.
    pub fn is_evictable(&self) -> bool {
        matches!(
            self,
            AgentDescriptor::Subagent { .. } | AgentDescriptor::App { .. }
        )
    }

    /// Foreground agents talk to a human; everything else is background.
    pub fn is_foreground(&self) -> bool {
        matches!(
            self,
            AgentDescriptor::User { .. } | AgentDescriptor::Subuser { .. }
        )
    }

    pub fn parent_agent_id(&self) -> Option<&str> {
        match self {
            AgentDescriptor::Subagent {
                parent_agent_id, ..
            }
            | AgentDescriptor::App {
                parent_agent_id, ..
            } => Some(parent_agent_id),
            _ => None,
        }
    }

    /// Agent id carried by the descriptor itself. `user` descriptors have
    /// none and are resolved through the descriptor index.
    pub fn stable_id(&self) -> Option<String> {
        match self {
            AgentDescriptor::User { .. } => None,
            AgentDescriptor::System { tag } => Some(format!("system-{}", tag)),
            AgentDescriptor::Cron { id }
            | AgentDescriptor::Task { id }
            | AgentDescriptor::MemoryAgent { id }
            | AgentDescriptor::Subagent { id, .. }
            | AgentDescriptor::App { id, .. }
            | AgentDescriptor::Permanent { id, .. }
            | AgentDescriptor::Subuser { id, .. } => Some(id.clone()),
        }
    }

    /// Index key used to find the agent of a connector user.
    pub fn lookup_key(&self) -> Option<String> {
        match self {
            AgentDescriptor::User {
                connector,
                user_id,
                channel_id,
            } => Some(format!("user:{}:{}:{}", connector, user_id, channel_id)),
            _ => None,
        }
    }

    /// Human-facing name used in notices.
    pub fn label(&self) -> String {
        match self {
            AgentDescriptor::User {
                connector, user_id, ..
            } => format!("{}:{}", connector, user_id),
            AgentDescriptor::Cron { id } | AgentDescriptor::Task { id } => id.clone(),
            AgentDescriptor::System { tag } => tag.clone(),
            AgentDescriptor::Subagent { name, .. }
            | AgentDescriptor::App { name, .. }
            | AgentDescriptor::Permanent { name, .. }
            | AgentDescriptor::Subuser { name, .. } => name.clone(),
            AgentDescriptor::MemoryAgent { .. } => "memory".to_string(),
        }
    }

    /// Connector and chat id for foreground delivery.
    pub fn connector_target(&self) -> Option<(&str, &str)> {
        match self {
            AgentDescriptor::User {
                connector,
                channel_id,
                ..
            } => Some((connector, channel_id)),
            _ => None,
        }
    }

    /// Permissions a freshly created agent starts with.
    pub fn default_permissions(&self, agent_dir: &Path) -> Permissions {
        let workspace = agent_dir.join("workspace").to_string_lossy().to_string();
        let base = Permissions {
            working_dir: workspace.clone(),
            write_dirs: vec![workspace],
            network: false,
            events: false,
        };
        match self {
            AgentDescriptor::User { .. } | AgentDescriptor::Subuser { .. } => base,
            AgentDescriptor::Permanent { workspace_dir, .. } => match workspace_dir {
                Some(dir) => Permissions {
                    working_dir: dir.clone(),
                    write_dirs: vec![dir.clone()],
                    network: true,
                    events: false,
                },
                None => Permissions {
                    network: true,
                    ..base
                },
            },
            AgentDescriptor::System { .. } => Permissions {
                network: true,
                events: true,
                ..base
            },
            AgentDescriptor::Cron { .. } | AgentDescriptor::Task { .. } => Permissions {
                network: true,
                ..base
            },
            AgentDescriptor::Subagent { .. }
            | AgentDescriptor::App { .. }
            | AgentDescriptor::MemoryAgent { .. } => base,
        }
    }
}

/// Filesystem and capability grants of an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Permissions {
    pub working_dir: String,
    #[serde(default)]
    pub write_dirs: Vec<String>,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub events: bool,
}

/// Lifecycle of an agent. `Dead` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    #[default]
    Active,
    Sleeping,
    Dead,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Active => write!(f, "active"),
            Lifecycle::Sleeping => write!(f, "sleeping"),
            Lifecycle::Dead => write!(f, "dead"),
        }
    }
}

/// `stats[provider][model]` accumulated usage.
pub type TokenStats = BTreeMap<String, BTreeMap<String, Usage>>;

/// Persisted mutable state of an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentState {
    #[serde(default)]
    pub context: Vec<Message>,
    pub inference_session_id: String,
    pub permissions: Permissions,
    #[serde(default)]
    pub tokens: Option<TokenSnapshot>,
    #[serde(default)]
    pub stats: TokenStats,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    pub created_at: i64,
    pub updated_at: i64,
    /// When the agent last fell asleep; cleared on wake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slept_at: Option<i64>,
}

impl AgentState {
    pub fn new(permissions: Permissions, inference_session_id: String, now: i64) -> Self {
        Self {
            context: Vec::new(),
            inference_session_id,
            permissions,
            tokens: None,
            stats: TokenStats::new(),
            lifecycle: Lifecycle::Active,
            created_at: now,
            updated_at: now,
            slept_at: None,
        }
    }

    /// Merge one response's usage into the stats table.
    pub fn record_usage(&mut self, snapshot: &TokenSnapshot) {
        self.stats
            .entry(snapshot.provider.clone())
            .or_default()
            .entry(snapshot.model.clone())
            .or_default()
            .add(&snapshot.size);
        self.tokens = Some(snapshot.clone());
    }
}

/// Persisted identity of an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRecord {
    pub id: String,
    /// Owning account
    pub user_id: String,
    pub descriptor: AgentDescriptor,
    pub created_at: i64,
}

/// Connector-side context of an inbound message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// A unit of work for an agent.
#[derive(Debug, Clone, PartialEq)]
pub enum InboxItem {
    Message {
        text: String,
        files: Vec<String>,
        context: MessageContext,
    },
    SystemMessage {
        text: String,
        origin: String,
        /// Append to history without running inference
        silent: bool,
        context: MessageContext,
    },
    Signal {
        signal: Signal,
        subscription_pattern: String,
    },
    Reset {
        message: Option<String>,
        context: Option<MessageContext>,
    },
    Compact {
        context: Option<MessageContext>,
    },
    Restore,
}

impl InboxItem {
    pub fn message(text: &str) -> Self {
        InboxItem::Message {
            text: text.to_string(),
            files: Vec::new(),
            context: MessageContext::default(),
        }
    }

    pub fn system_message(text: &str, origin: &str, silent: bool) -> Self {
        InboxItem::SystemMessage {
            text: text.to_string(),
            origin: origin.to_string(),
            silent,
            context: MessageContext::default(),
        }
    }

    pub fn reset(message: Option<&str>) -> Self {
        InboxItem::Reset {
            message: message.map(str::to_string),
            context: None,
        }
    }

    pub fn compact() -> Self {
        InboxItem::Compact { context: None }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboxItem::Message { .. } => "message",
            InboxItem::SystemMessage { .. } => "system_message",
            InboxItem::Signal { .. } => "signal",
            InboxItem::Reset { .. } => "reset",
            InboxItem::Compact { .. } => "compact",
            InboxItem::Restore => "restore",
        }
    }
}

/// Why a manual compaction did not change the context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompactionFailure {
    Empty,
    NoProvider,
    EmptySummary,
    Aborted,
    Failed,
}

impl CompactionFailure {
    /// User-facing result text.
    pub fn text(&self) -> &'static str {
        match self {
            CompactionFailure::Empty => "Nothing to compact yet.",
            CompactionFailure::NoProvider => {
                "Compaction unavailable: no inference provider configured."
            }
            CompactionFailure::EmptySummary => {
                "Compaction produced an empty summary; context unchanged."
            }
            CompactionFailure::Aborted => "Compaction aborted.",
            CompactionFailure::Failed => "Compaction failed.",
        }
    }
}

/// Outcome of a handled inbox item.
#[derive(Debug, Clone, PartialEq)]
pub enum InboxResult {
    Message {
        response_text: Option<String>,
    },
    SystemMessage {
        response_text: Option<String>,
    },
    Signal {
        delivered: bool,
        response_text: Option<String>,
    },
    Reset {
        ok: bool,
    },
    Compact {
        ok: bool,
        reason: Option<CompactionFailure>,
        text: String,
    },
    Restore {
        ok: bool,
    },
}

impl InboxResult {
    /// Response text, if the item produced one.
    pub fn response_text(&self) -> Option<&str> {
        match self {
            InboxResult::Message { response_text }
            | InboxResult::SystemMessage { response_text }
            | InboxResult::Signal { response_text, .. } => response_text.as_deref(),
            InboxResult::Compact { text, .. } => Some(text),
            InboxResult::Reset { .. } | InboxResult::Restore { .. } => None,
        }
    }
}
