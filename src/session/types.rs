//! Context message types
//!
//! An agent's working context is an ordered list of [`Message`]s that is
//! handed to the inference collaborator on every turn.

use serde::{Deserialize, Serialize};

/// Text prefix that marks a synthetic reset turn in the context.
pub const RESET_MARKER_PREFIX: &str = "[session reset]";

/// A single message in an agent's context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// The role of the message sender
    pub role: Role,
    /// The text content of the message
    pub content: String,
    /// Tool calls made by the assistant (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// ID of the tool call this message is responding to (for tool results)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn with_role(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create a new user message.
    ///
    /// # Example
    /// ```
    /// use agentvisor::session::{Message, Role};
    ///
    /// let msg = Message::user("Hello, assistant!");
    /// assert_eq!(msg.role, Role::User);
    /// ```
    pub fn user(content: &str) -> Self {
        Self::with_role(Role::User, content)
    }

    /// A user turn; attached files are listed after the text.
    pub fn user_turn(text: &str, files: &[String]) -> Self {
        if files.is_empty() {
            Self::user(text)
        } else {
            Self::user(&format!("{}\n\n[files]\n{}", text, files.join("\n")))
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn system(content: &str) -> Self {
        Self::with_role(Role::System, content)
    }

    /// Create an assistant message carrying tool calls.
    pub fn assistant_with_tools(content: &str, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(tool_calls),
            ..Self::with_role(Role::Assistant, content)
        }
    }

    /// Create a tool result answering `tool_call_id`.
    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.to_string()),
            ..Self::with_role(Role::Tool, content)
        }
    }

    /// Synthetic turn left in the context after a reset or compaction.
    ///
    /// # Example
    /// ```
    /// use agentvisor::session::Message;
    ///
    /// let marker = Message::reset_marker("Session context compacted.");
    /// assert!(marker.is_reset_marker());
    /// assert!(marker.content.ends_with("Session context compacted."));
    /// ```
    pub fn reset_marker(text: &str) -> Self {
        Self::user(&format!("{} {}", RESET_MARKER_PREFIX, text.trim()))
    }

    /// Check if this message is a reset marker.
    pub fn is_reset_marker(&self) -> bool {
        self.role == Role::User && self.content.starts_with(RESET_MARKER_PREFIX)
    }

    /// Check if this message has tool calls.
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls
            .as_ref()
            .map(|tc| !tc.is_empty())
            .unwrap_or(false)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A tool call requested by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Unique identifier for this tool call
    pub id: String,
    /// Name of the tool to call
    pub name: String,
    /// JSON-encoded arguments for the tool
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: &str, name: &str, arguments: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }
}
