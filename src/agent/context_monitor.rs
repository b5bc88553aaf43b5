//! Context budget checks.
//!
//! Before a message runs inference the agent estimates the size of the
//! context it is about to send. Crossing the configured limit forces a
//! compaction first. Estimation is a pluggable [`TokenEstimator`]; the
//! default counts characters.

use std::sync::Arc;

use serde::Serialize;

use crate::providers::InferenceContext;
use crate::session::Message;

/// Rough token count used for attached files such as images.
pub const FILE_TOKENS: usize = 512;

const CHARS_PER_TOKEN: usize = 4;

/// Strategy for estimating token counts.
pub trait TokenEstimator: Send + Sync {
    fn estimate_text(&self, text: &str) -> usize;

    fn estimate_message(&self, message: &Message) -> usize {
        let mut total = self.estimate_text(&message.content);
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                total += self.estimate_text(&call.name) + self.estimate_text(&call.arguments);
            }
        }
        total
    }

    fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }
}

/// `ceil(chars / 4)` per text.
#[derive(Debug, Default, Clone, Copy)]
pub struct CharsPerTokenEstimator;

impl TokenEstimator for CharsPerTokenEstimator {
    fn estimate_text(&self, text: &str) -> usize {
        text.chars().count().div_ceil(CHARS_PER_TOKEN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
}

/// Result of a budget check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompactionStatus {
    pub estimated: usize,
    pub limit: usize,
    pub severity: Severity,
}

impl CompactionStatus {
    /// Only a crossed limit forces compaction; `warning` is informational.
    pub fn needs_compaction(&self) -> bool {
        self.severity == Severity::Critical
    }
}

/// Checks a pending inference request against the emergency limit.
#[derive(Clone)]
pub struct ContextMonitor {
    limit: usize,
    warning_ratio: f64,
    estimator: Arc<dyn TokenEstimator>,
}

impl ContextMonitor {
    pub fn new(limit: usize, warning_ratio: f64, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            limit,
            warning_ratio,
            estimator,
        }
    }

    /// Estimate the request: system prompt, tool definitions, context, the
    /// pending turn text and its attachments.
    pub fn estimate(&self, context: &InferenceContext, pending_text: &str, pending_files: usize) -> usize {
        let estimator = &self.estimator;
        let mut total = estimator.estimate_text(&context.system_prompt);
        for tool in &context.tools {
            total += estimator.estimate_text(&tool.name)
                + estimator.estimate_text(&tool.description)
                + estimator.estimate_text(&tool.parameters.to_string());
        }
        total += estimator.estimate_messages(&context.messages);
        total += estimator.estimate_text(pending_text);
        total + pending_files * FILE_TOKENS
    }

    pub fn check(&self, context: &InferenceContext, pending_text: &str, pending_files: usize) -> CompactionStatus {
        let estimated = self.estimate(context, pending_text, pending_files);
        let warning_at = (self.limit as f64 * self.warning_ratio) as usize;
        let severity = if estimated >= self.limit {
            Severity::Critical
        } else if estimated >= warning_at {
            Severity::Warning
        } else {
            Severity::Ok
        };
        CompactionStatus {
            estimated,
            limit: self.limit,
            severity,
        }
    }

    /// Estimate of the bare context, used in overflow notices.
    pub fn estimate_context(&self, messages: &[Message]) -> usize {
        self.estimator.estimate_messages(messages)
    }
}
