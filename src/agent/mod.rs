//! Agent module - per-agent actors and the conversation turn
//!
//! Every agent is a single task draining its own [`Inbox`]. Items are handled
//! strictly in order; a message turn checks the context budget, compacts if
//! needed, then runs the inference/tool loop.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐ post  ┌─────────┐ next ┌─────────┐      ┌────────────────┐
//! │ Supervisor │──────▶│  Inbox  │─────▶│  Agent  │─────▶│ InferenceRouter│
//! └────────────┘       └─────────┘      │  actor  │      └────────────────┘
//!       ▲                               │         │─────▶ ToolExecutor
//!       │    sleep / death transitions  │         │─────▶ HistoryLog
//!       └───────────────────────────────└─────────┘
//! ```
//!
//! The agent loop owns its [`AgentState`]. The supervisor only sees the
//! [`AgentHandle`]: inbox, lifecycle flag and abort token.

pub mod actor;
pub mod compaction;
pub mod context_monitor;
pub mod handle;
pub mod history_log;
pub mod inbox;
pub mod tool_loop;
pub mod types;

pub use actor::{Agent, AgentRuntime, EMERGENCY_RESET_MESSAGE};
pub use context_monitor::{CharsPerTokenEstimator, CompactionStatus, ContextMonitor, Severity, TokenEstimator};
pub use handle::{AgentHandle, AgentSummary, EvictionAction};
pub use history_log::HistoryLog;
pub use inbox::{CompletionHandle, Inbox, InboxEntry};
pub use tool_loop::ToolLoop;
pub use types::{
    AgentDescriptor, AgentRecord, AgentState, CompactionFailure, InboxItem, InboxResult, Lifecycle,
    MessageContext, Permissions,
};
