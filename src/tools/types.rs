//! Tool types
//!
//! Tools are the functions the model can call during a message turn. Each
//! call runs with a [`ToolContext`] naming the calling agent so tools can act
//! on its behalf (signal source, subscription owner).

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::types::Permissions;
use crate::error::Result;

/// Result of a tool call as fed back to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// A callable tool.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use serde_json::Value;
/// use agentvisor::tools::{Tool, ToolContext, ToolOutput};
/// use agentvisor::error::Result;
///
/// struct Echo;
///
/// #[async_trait]
/// impl Tool for Echo {
///     fn name(&self) -> &str { "echo" }
///     fn description(&self) -> &str { "Echo the text argument" }
///     fn parameters(&self) -> Value {
///         serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
///     }
///     async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
///         Ok(ToolOutput::ok(args["text"].as_str().unwrap_or_default()))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model uses to call the tool.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments.
    fn parameters(&self) -> Value;

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// Identity of the agent a tool runs for.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub agent_id: String,
    /// Owning account of the agent
    pub user_id: Option<String>,
    pub permissions: Permissions,
}

impl ToolContext {
    pub fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }
}
