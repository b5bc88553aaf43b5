//! Inference and tool-call loop for one message turn.
//!
//! Each round sends the context to the router; tool calls in the reply are
//! run in order and their results appended before the next round. Every step
//! is written to history as it happens so a crash leaves a replayable log.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::history_log::HistoryLog;
use super::inbox::Inbox;
use crate::error::{Result, VisorError};
use crate::providers::{
    is_context_overflow_message, InferenceContext, InferenceOptions, InferenceRouter, TokenSnapshot,
};
use crate::session::{HistoryRecord, Message, ToolCall, ToolCallTermination};
use crate::tools::{ToolContext, ToolExecutor, ToolOutput};

/// Collaborators and limits of a turn.
pub struct ToolLoop<'a> {
    pub router: &'a dyn InferenceRouter,
    pub tools: &'a dyn ToolExecutor,
    pub tool_context: &'a ToolContext,
    pub history: &'a HistoryLog,
    /// Steering instructions are injected before each round
    pub inbox: Option<&'a Inbox>,
    pub system_prompt: &'a str,
    pub session_id: &'a str,
    pub providers: Option<Vec<String>>,
    pub max_iterations: usize,
    pub cancel: CancellationToken,
}

impl ToolLoop<'_> {
    /// Run until the model answers without tool calls.
    ///
    /// Appends every turn to `context` and the usage of every response to
    /// `usage`, including on error. Returns the final text, `None` if empty.
    pub async fn run(
        &self,
        context: &mut Vec<Message>,
        usage: &mut Vec<TokenSnapshot>,
    ) -> Result<Option<String>> {
        let definitions = self.tools.definitions();

        for iteration in 1..=self.max_iterations {
            if let Some(steering) = self.inbox.and_then(|inbox| inbox.consume_steering()) {
                self.history
                    .append(HistoryRecord::UserMessage {
                        at: self.history.stamp(),
                        text: steering.clone(),
                        files: Vec::new(),
                    })
                    .await;
                context.push(Message::user(&steering));
            }

            let request = InferenceContext {
                system_prompt: self.system_prompt.to_string(),
                messages: context.clone(),
                tools: definitions.clone(),
            };
            let options =
                InferenceOptions::new(self.cancel.clone()).with_providers(self.providers.clone());
            let response = tokio::select! {
                _ = self.cancel.cancelled() => return Err(VisorError::Aborted),
                response = self.router.complete(&request, self.session_id, options) => {
                    response.map_err(overflow_from_message)?
                }
            };

            let snapshot = TokenSnapshot {
                provider: response.provider_id.clone(),
                model: response.model_id.clone(),
                size: response.usage,
            };
            usage.push(snapshot.clone());

            let message = response.message;
            let calls: Vec<ToolCall> = message.tool_calls.clone().unwrap_or_default();
            self.history
                .append(HistoryRecord::AssistantMessage {
                    at: self.history.stamp(),
                    text: message.content.clone(),
                    tool_calls: calls.clone(),
                    tokens: Some(snapshot),
                })
                .await;
            let text = message.content.trim().to_string();
            context.push(message);

            if calls.is_empty() {
                debug!(agent_id = %self.tool_context.agent_id, iteration, "Tool loop finished");
                return Ok(if text.is_empty() { None } else { Some(text) });
            }

            for (index, call) in calls.iter().enumerate() {
                let output = tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    output = self.tools.execute(&call.name, &call.arguments, self.tool_context) => {
                        Some(output.unwrap_or_else(|e| ToolOutput::error(format!("Error: {}", e))))
                    }
                };
                let Some(output) = output else {
                    self.abort_calls(&calls[index..], context).await;
                    return Err(VisorError::Aborted);
                };
                self.history
                    .append(HistoryRecord::ToolResult {
                        at: self.history.stamp(),
                        tool_call_id: call.id.clone(),
                        output: output.content.clone(),
                        is_error: output.is_error,
                    })
                    .await;
                context.push(Message::tool_result(&call.id, &output.content));
            }
        }

        info!(
            agent_id = %self.tool_context.agent_id,
            iterations = self.max_iterations,
            "Tool loop reached maximum iterations"
        );
        Err(VisorError::ToolLoopExceeded(self.max_iterations))
    }

    async fn abort_calls(&self, calls: &[ToolCall], context: &mut Vec<Message>) {
        for call in calls {
            let record =
                HistoryRecord::terminated_tool_call(call, ToolCallTermination::Aborted, self.history.stamp());
            if let HistoryRecord::ToolResult { output, .. } = &record {
                context.push(Message::tool_result(&call.id, output));
            }
            self.history.append(record).await;
        }
    }
}

/// Routers that report overflow as plain text still count as overflow.
fn overflow_from_message(error: VisorError) -> VisorError {
    match error {
        VisorError::Inference(message) if is_context_overflow_message(&message) => {
            VisorError::ContextOverflow(message)
        }
        other => other,
    }
}
