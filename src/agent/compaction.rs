//! Context compaction.
//!
//! The conversation is summarized by the inference router into a checkpoint;
//! the context is then replaced by a reset marker followed by the summary as
//! a user turn. Callers keep the original context when the summary comes back
//! empty.

use tokio_util::sync::CancellationToken;

use crate::error::{Result, VisorError};
use crate::providers::{InferenceContext, InferenceOptions, InferenceRouter, TokenSnapshot};
use crate::session::{HistoryRecord, Message};

/// Reset marker text placed at the head of a compacted context.
pub const COMPACTED_MARKER: &str = "Session context compacted.";

const SUMMARY_REQUEST: &str = "Summarize the conversation above into a compact context checkpoint. \
Follow the system prompt format exactly. Do not continue the conversation.";

const SUMMARY_SYSTEM_PROMPT: &str = "You compress conversations into checkpoints for an agent \
that will continue the work. Write plain text with these sections:\n\
Goal: what the user wants.\n\
State: decisions made, facts learned, files and identifiers involved.\n\
Open items: unfinished steps and pending questions.\n\
Keep every detail needed to continue. Omit pleasantries.";

const CONTINUE_SUFFIX: &str = "\n\nPlease continue with the user's latest request.";

/// A produced summary and the usage it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub text: String,
    pub tokens: TokenSnapshot,
}

impl Summary {
    /// Whitespace-only summaries must not replace the context.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Ask the router for a checkpoint of `messages`.
///
/// Cancelling `cancel` ends the call with [`VisorError::Aborted`] even if the
/// router ignores the token.
pub async fn summarize(
    router: &dyn InferenceRouter,
    messages: &[Message],
    session_id: &str,
    providers: Option<Vec<String>>,
    cancel: CancellationToken,
) -> Result<Summary> {
    let mut request = messages.to_vec();
    request.push(Message::user(SUMMARY_REQUEST));
    let context = InferenceContext {
        system_prompt: SUMMARY_SYSTEM_PROMPT.to_string(),
        messages: request,
        tools: Vec::new(),
    };
    let options = InferenceOptions::new(cancel.clone()).with_providers(providers);

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(VisorError::Aborted),
        response = router.complete(&context, session_id, options) => response?,
    };
    Ok(Summary {
        text: response.message.content.trim().to_string(),
        tokens: TokenSnapshot {
            provider: response.provider_id,
            model: response.model_id,
            size: response.usage,
        },
    })
}

/// Summary text as the user turn that follows the marker.
fn summary_turn(summary: &str) -> String {
    format!("{}{}", summary.trim(), CONTINUE_SUFFIX)
}

/// Context that replaces the compacted conversation.
pub fn compacted_context(summary: &str) -> Vec<Message> {
    vec![
        Message::reset_marker(COMPACTED_MARKER),
        Message::user(&summary_turn(summary)),
    ]
}

/// History records that reproduce [`compacted_context`] on replay.
pub fn compaction_records(summary: &str, at: i64) -> Vec<HistoryRecord> {
    vec![
        HistoryRecord::Reset {
            at,
            message: Some(COMPACTED_MARKER.to_string()),
        },
        HistoryRecord::UserMessage {
            at,
            text: summary_turn(summary),
            files: Vec::new(),
        },
    ]
}
