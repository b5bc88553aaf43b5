//! Signal tools
//!
//! Let agents generate signals and manage their own subscriptions. The
//! calling agent is always the signal source and the subscription owner.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolOutput};
use crate::error::Result;
use crate::signals::{SignalGenerateInput, SignalSource, SignalSubscribeInput, Signals};

fn string_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// `signal_generate`: emit a signal from the calling agent.
pub struct SignalGenerateTool {
    signals: Arc<Signals>,
}

impl SignalGenerateTool {
    pub fn new(signals: Arc<Signals>) -> Self {
        Self { signals }
    }
}

#[async_trait]
impl Tool for SignalGenerateTool {
    fn name(&self) -> &str {
        "signal_generate"
    }

    fn description(&self) -> &str {
        "Generate a signal. Agents subscribed to a matching pattern receive it; you never receive your own signals."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type": {
                    "type": "string",
                    "description": "Colon-separated signal type, e.g. build:alpha:done"
                },
                "data": {
                    "description": "Optional JSON payload"
                }
            },
            "required": ["type"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(signal_type) = string_arg(&args, "type") else {
            return Ok(ToolOutput::error("Missing required argument: type"));
        };
        let mut input = SignalGenerateInput::new(
            signal_type,
            SignalSource::agent(&ctx.agent_id, ctx.user_id.as_deref()),
        );
        if let Some(data) = args.get("data").filter(|d| !d.is_null()) {
            input = input.with_data(data.clone());
        }
        let signal = self.signals.generate(input).await?;
        Ok(ToolOutput::ok(format!(
            "Signal generated: {} ({})",
            signal.signal_type, signal.id
        )))
    }
}

/// `signal_subscribe`: subscribe the calling agent to a pattern.
pub struct SignalSubscribeTool {
    signals: Arc<Signals>,
}

impl SignalSubscribeTool {
    pub fn new(signals: Arc<Signals>) -> Self {
        Self { signals }
    }
}

#[async_trait]
impl Tool for SignalSubscribeTool {
    fn name(&self) -> &str {
        "signal_subscribe"
    }

    fn description(&self) -> &str {
        "Subscribe to signals matching a pattern. `*` matches exactly one segment. Silent subscriptions are recorded without waking you up."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string" },
                "silent": { "type": "boolean", "default": true }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(pattern) = string_arg(&args, "pattern") else {
            return Ok(ToolOutput::error("Missing required argument: pattern"));
        };
        let mut input = SignalSubscribeInput::new(&ctx.agent_id, pattern);
        input.user_id = ctx.user_id.clone();
        if let Some(silent) = args.get("silent").and_then(Value::as_bool) {
            input = input.silent(silent);
        }
        match self.signals.subscribe(input).await {
            Ok(subscription) => Ok(ToolOutput::ok(format!(
                "Subscribed to {} ({})",
                subscription.pattern,
                if subscription.silent { "silent" } else { "wakes agent" }
            ))),
            Err(crate::error::VisorError::InvalidInput(msg)) => Ok(ToolOutput::error(msg)),
            Err(e) => Err(e),
        }
    }
}

/// `signal_unsubscribe`: remove one of the calling agent's subscriptions.
pub struct SignalUnsubscribeTool {
    signals: Arc<Signals>,
}

impl SignalUnsubscribeTool {
    pub fn new(signals: Arc<Signals>) -> Self {
        Self { signals }
    }
}

#[async_trait]
impl Tool for SignalUnsubscribeTool {
    fn name(&self) -> &str {
        "signal_unsubscribe"
    }

    fn description(&self) -> &str {
        "Remove a signal subscription."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "pattern": { "type": "string" } },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(pattern) = string_arg(&args, "pattern") else {
            return Ok(ToolOutput::error("Missing required argument: pattern"));
        };
        if self.signals.unsubscribe(&ctx.agent_id, pattern).await? {
            Ok(ToolOutput::ok(format!("Unsubscribed from {}", pattern)))
        } else {
            Ok(ToolOutput::error(format!("No subscription for {}", pattern)))
        }
    }
}
