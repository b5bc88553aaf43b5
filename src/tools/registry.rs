//! Tool registry
//!
//! Holds the tools available to agents and implements [`ToolExecutor`] so
//! the tool loop can run calls by name.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info};

use crate::error::Result;
use crate::providers::ToolDefinition;

use super::{Tool, ToolContext, ToolOutput};

/// Runs tool calls issued by the model.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Definitions advertised to the model.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Run `name` with raw JSON `arguments`. Unknown tools and unparsable
    /// arguments produce an error output, not an `Err`.
    async fn execute(&self, name: &str, arguments: &str, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// Name-indexed tool set.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool`, replacing any tool of the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        info!(tool = %name, "Registering tool");
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.parameters()))
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    async fn execute(&self, name: &str, arguments: &str, ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(tool) = self.tools.get(name) else {
            return Ok(ToolOutput::error(format!("Tool not found: {}", name)));
        };
        let args: Value = if arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(arguments) {
                Ok(args) => args,
                Err(e) => {
                    return Ok(ToolOutput::error(format!(
                        "Invalid arguments for {}: {}",
                        name, e
                    )))
                }
            }
        };

        let start = Instant::now();
        match tool.execute(args, ctx).await {
            Ok(output) => {
                info!(
                    tool = name,
                    agent_id = %ctx.agent_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Tool executed successfully"
                );
                Ok(output)
            }
            Err(e) => {
                error!(
                    tool = name,
                    agent_id = %ctx.agent_id,
                    error = %e,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Tool execution failed"
                );
                Err(e)
            }
        }
    }
}
