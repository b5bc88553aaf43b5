//! Persisted agent history.
//!
//! Every agent keeps an append-only log of [`HistoryRecord`]s. The in-memory
//! context is a cache of that log: on restart it is rebuilt with
//! [`context_from_history`], and tool calls that never received a result are
//! found with [`pending_tool_calls`] so they can be closed out.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::providers::TokenSnapshot;
use crate::session::{Message, ToolCall};

/// Why a tool call was closed without running to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallTermination {
    /// The process died while the call was in flight
    SessionCrashed,
    /// The call was cancelled through its cancellation token
    Aborted,
}

impl ToolCallTermination {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallTermination::SessionCrashed => "session_crashed",
            ToolCallTermination::Aborted => "aborted",
        }
    }
}

/// One line of an agent's history log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryRecord {
    Start {
        at: i64,
    },
    Reset {
        at: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    UserMessage {
        at: i64,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        files: Vec<String>,
    },
    AssistantMessage {
        at: i64,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        #[serde(default)]
        tokens: Option<TokenSnapshot>,
    },
    ToolResult {
        at: i64,
        tool_call_id: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    Note {
        at: i64,
        text: String,
    },
}

impl HistoryRecord {
    /// Timestamp of the record in unix milliseconds.
    pub fn at(&self) -> i64 {
        match self {
            HistoryRecord::Start { at }
            | HistoryRecord::Reset { at, .. }
            | HistoryRecord::UserMessage { at, .. }
            | HistoryRecord::AssistantMessage { at, .. }
            | HistoryRecord::ToolResult { at, .. }
            | HistoryRecord::Note { at, .. } => *at,
        }
    }

    /// Synthetic error result closing out `call`.
    pub fn terminated_tool_call(call: &ToolCall, reason: ToolCallTermination, at: i64) -> Self {
        HistoryRecord::ToolResult {
            at,
            tool_call_id: call.id.clone(),
            output: format!(
                "Tool call {} ({}) did not complete: {}",
                call.name,
                call.id,
                reason.as_str()
            ),
            is_error: true,
        }
    }
}

/// Rebuild context messages from history.
///
/// A `start` or `reset` record clears everything before it; a reset with a
/// non-empty message leaves a reset marker behind. Notes never reach the
/// context.
///
/// # Example
/// ```
/// use agentvisor::session::history::{context_from_history, HistoryRecord};
///
/// let records = vec![
///     HistoryRecord::UserMessage { at: 1, text: "old".into(), files: vec![] },
///     HistoryRecord::Reset { at: 2, message: Some("fresh start".into()) },
///     HistoryRecord::UserMessage { at: 3, text: "new".into(), files: vec![] },
/// ];
/// let context = context_from_history(&records);
/// assert_eq!(context.len(), 2);
/// assert!(context[0].is_reset_marker());
/// assert_eq!(context[1].content, "new");
/// ```
pub fn context_from_history(records: &[HistoryRecord]) -> Vec<Message> {
    let mut messages = Vec::new();
    for record in records {
        match record {
            HistoryRecord::Start { .. } => messages.clear(),
            HistoryRecord::Reset { message, .. } => {
                messages.clear();
                if let Some(text) = message.as_deref().filter(|t| !t.trim().is_empty()) {
                    messages.push(Message::reset_marker(text));
                }
            }
            HistoryRecord::UserMessage { text, files, .. } => {
                messages.push(Message::user_turn(text, files))
            }
            HistoryRecord::AssistantMessage {
                text, tool_calls, ..
            } => {
                if tool_calls.is_empty() {
                    messages.push(Message::assistant(text));
                } else {
                    messages.push(Message::assistant_with_tools(text, tool_calls.clone()));
                }
            }
            HistoryRecord::ToolResult {
                tool_call_id,
                output,
                ..
            } => messages.push(Message::tool_result(tool_call_id, output)),
            HistoryRecord::Note { .. } => {}
        }
    }
    messages
}

/// Tool calls issued since the last reset that never received a result.
pub fn pending_tool_calls(records: &[HistoryRecord]) -> Vec<ToolCall> {
    let start = records
        .iter()
        .rposition(|r| matches!(r, HistoryRecord::Start { .. } | HistoryRecord::Reset { .. }))
        .map(|i| i + 1)
        .unwrap_or(0);
    let window = &records[start..];

    let answered: HashSet<&str> = window
        .iter()
        .filter_map(|r| match r {
            HistoryRecord::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect();

    window
        .iter()
        .filter_map(|r| match r {
            HistoryRecord::AssistantMessage { tool_calls, .. } => Some(tool_calls),
            _ => None,
        })
        .flatten()
        .filter(|call| !answered.contains(call.id.as_str()))
        .cloned()
        .collect()
}
