//! Inference collaborator boundary.
//!
//! The runtime never talks to an LLM API directly. It hands a context to an
//! [`InferenceRouter`], which picks a provider, runs the request under the
//! caller's cancellation token and reports which provider/model answered.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, VisorError};
use crate::session::Message;

/// Definition of a tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    /// The name of the tool (must be unique)
    pub name: String,
    /// Human-readable description of what the tool does
    pub description: String,
    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// Token counts for one response, or accumulated across many.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
    pub total: u64,
}

impl Usage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            cache_read: 0,
            cache_write: 0,
            total: input + output,
        }
    }

    /// Accumulate `other` into `self`.
    pub fn add(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.total += other.total;
    }
}

/// Usage of the most recent response together with who produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenSnapshot {
    pub provider: String,
    pub model: String,
    pub size: Usage,
}

/// Everything the router needs to run one completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceContext {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

/// Result of a completion.
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    /// Assistant message, possibly carrying tool calls
    pub message: Message,
    pub provider_id: String,
    pub model_id: String,
    pub usage: Usage,
}

/// Progress callbacks for a completion. All methods default to no-ops.
pub trait InferenceObserver: Send + Sync {
    fn on_attempt(&self, _provider_id: &str, _model_id: &str) {}
    fn on_fallback(&self, _from_provider: &str, _to_provider: &str, _error: &str) {}
    fn on_success(&self, _provider_id: &str, _model_id: &str) {}
    fn on_failure(&self, _provider_id: &str, _error: &str) {}
}

/// Per-call options passed to [`InferenceRouter::complete`].
#[derive(Clone, Default)]
pub struct InferenceOptions {
    /// Restrict routing to these provider ids, in order
    pub providers: Option<Vec<String>>,
    /// Cancelling this token must abort the call with [`VisorError::Aborted`]
    pub cancel: CancellationToken,
    pub observer: Option<Arc<dyn InferenceObserver>>,
}

impl fmt::Debug for InferenceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceOptions")
            .field("providers", &self.providers)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl InferenceOptions {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Default::default()
        }
    }

    pub fn with_providers(mut self, providers: Option<Vec<String>>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn InferenceObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

/// Routes completions to configured providers.
///
/// Implementations should map provider failures through
/// [`crate::providers::classify_error_message`] so that prompt-size
/// rejections surface as [`VisorError::ContextOverflow`].
#[async_trait]
pub trait InferenceRouter: Send + Sync {
    async fn complete(
        &self,
        context: &InferenceContext,
        session_id: &str,
        options: InferenceOptions,
    ) -> Result<InferenceResponse>;

    /// Whether at least one provider is active.
    fn has_providers(&self) -> bool {
        true
    }
}

/// Router used when no provider is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInferenceRouter;

#[async_trait]
impl InferenceRouter for NoopInferenceRouter {
    async fn complete(
        &self,
        _context: &InferenceContext,
        _session_id: &str,
        _options: InferenceOptions,
    ) -> Result<InferenceResponse> {
        Err(VisorError::Inference(
            "no inference provider configured".to_string(),
        ))
    }

    fn has_providers(&self) -> bool {
        false
    }
}
