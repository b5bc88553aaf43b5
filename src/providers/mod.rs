//! Providers module - the inference collaborator boundary
//!
//! Agents call an [`InferenceRouter`] with a context, an inference session id
//! and [`InferenceOptions`] carrying a cancellation token. Provider failures
//! are classified by [`classify_error_message`]; a context-overflow result
//! triggers the agent's emergency reset path.

pub mod error_classifier;
pub mod types;

pub use error_classifier::{classify_error_message, is_context_overflow_message};
pub use types::{
    InferenceContext, InferenceObserver, InferenceOptions, InferenceResponse, InferenceRouter,
    NoopInferenceRouter, TokenSnapshot, ToolDefinition, Usage,
};
