//! Session module - context messages and the persisted history they replay from
//!
//! # Example
//!
//! ```
//! use agentvisor::session::{history::HistoryRecord, context_from_history, Role};
//!
//! let records = vec![HistoryRecord::UserMessage { at: 1, text: "Hello!".into(), files: vec![] }];
//! let context = context_from_history(&records);
//! assert_eq!(context[0].role, Role::User);
//! ```

pub mod history;
pub mod types;

pub use history::{context_from_history, pending_tool_calls, HistoryRecord, ToolCallTermination};
pub use types::{Message, Role, ToolCall, RESET_MARKER_PREFIX};
