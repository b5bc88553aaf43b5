//! Error types for Agentvisor
//!
//! This module defines all error types used throughout the runtime.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.

use std::fmt;
use thiserror::Error;

// ============================================================================
// Provider Error Classification
// ============================================================================

/// Structured provider error classification.
///
/// Produced by [`crate::providers::classify_error_message`] from the text a
/// provider returns, so the agent can tell a context overflow apart from a
/// transient failure without relying on status codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Prompt exceeded the model's context window
    ContextOverflow(String),
    /// Rate limit or quota exceeded
    RateLimit(String),
    /// Invalid API key or authentication failure
    Auth(String),
    /// Payment required or billing issue
    Billing(String),
    /// Provider is overloaded, retry with backoff
    Overloaded(String),
    /// Connection or read timeout
    Timeout(String),
    /// Catch-all for unrecognized errors
    Unknown(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::ContextOverflow(msg) => write!(f, "Context overflow: {}", msg),
            ProviderError::RateLimit(msg) => write!(f, "Rate limit error: {}", msg),
            ProviderError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            ProviderError::Billing(msg) => write!(f, "Billing error: {}", msg),
            ProviderError::Overloaded(msg) => write!(f, "Overloaded error: {}", msg),
            ProviderError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            ProviderError::Unknown(msg) => write!(f, "Unknown provider error: {}", msg),
        }
    }
}

impl ProviderError {
    /// Returns `true` if this error is transient and the request may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimit(_) | ProviderError::Overloaded(_) | ProviderError::Timeout(_)
        )
    }

    /// Returns `true` if the prompt no longer fits the provider's context window.
    pub fn is_context_overflow(&self) -> bool {
        matches!(self, ProviderError::ContextOverflow(_))
    }
}

impl From<ProviderError> for VisorError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::ContextOverflow(msg) => VisorError::ContextOverflow(msg),
            other => VisorError::Provider(other),
        }
    }
}

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for Agentvisor operations.
#[derive(Error, Debug)]
pub enum VisorError {
    /// Configuration-related errors (invalid config, unreadable file, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// No agent is registered or persisted under this id
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// The agent reached the terminal `dead` lifecycle
    #[error("Agent is dead: {0}")]
    AgentDead(String),

    /// Inference call failed for a reason other than overflow or abort
    #[error("Inference error: {0}")]
    Inference(String),

    /// Provider rejected the prompt as too large
    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    /// Structured provider failure
    #[error("Provider error: {0}")]
    Provider(ProviderError),

    /// Operation was cancelled through its cancellation token
    #[error("Operation aborted")]
    Aborted,

    /// The tool loop hit its iteration ceiling without a final answer
    #[error("Tool loop exceeded {0} iterations")]
    ToolLoopExceeded(usize),

    /// Durable storage failed; in-memory progress is kept
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Caller supplied invalid input (empty signal type, bad pattern, etc.)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The inbox consumer side failed or was closed
    #[error("Inbox closed for agent {0}")]
    InboxClosed(String),

    /// Resource not found (subscriptions, delayed entries, connectors, etc.)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML config parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl VisorError {
    /// Returns `true` for cancellation, which callers treat as a quiet outcome.
    pub fn is_aborted(&self) -> bool {
        matches!(self, VisorError::Aborted)
    }

    /// Returns `true` when the error means the prompt overflowed the provider window.
    pub fn is_context_overflow(&self) -> bool {
        matches!(self, VisorError::ContextOverflow(_))
    }
}

/// A specialized `Result` type for Agentvisor operations.
pub type Result<T> = std::result::Result<T, VisorError>;
