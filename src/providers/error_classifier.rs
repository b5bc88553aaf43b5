//! Pattern-based classification of provider error text.
//!
//! Providers report prompt-size rejections with different codes and bodies,
//! so the check runs on the lowercase message text. Priority order:
//! context overflow > billing > auth > rate limit > overloaded > timeout.
//! Falls back to `Unknown` if no pattern matches.

use crate::error::ProviderError;

const CONTEXT_OVERFLOW_PATTERNS: &[&str] = &[
    "prompt is too long",
    "context_length_exceeded",
    "maximum context length",
    "context window",
    "exceeds the context",
    "exceed context limit",
    "input is too long",
    "too many input tokens",
    "reduce the length of the messages",
    "request_too_large",
];

const BILLING_PATTERNS: &[&str] = &[
    "402",
    "payment required",
    "insufficient credits",
    "credit balance",
    "billing",
];

const AUTH_PATTERNS: &[&str] = &[
    "invalid_api_key",
    "invalid api key",
    "authentication",
    "unauthorized",
    "forbidden",
    "401",
    "403",
];

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate_limit",
    "rate limit",
    "too many requests",
    "429",
    "quota exceeded",
    "resource_exhausted",
];

const OVERLOADED_PATTERNS: &[&str] = &["overloaded_error", "overloaded"];

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "deadline exceeded"];

/// Classify an error message string into a `ProviderError`.
///
/// # Example
/// ```
/// use agentvisor::providers::classify_error_message;
///
/// let err = classify_error_message("prompt is too long: 212000 tokens > 200000 maximum");
/// assert!(err.is_context_overflow());
/// ```
pub fn classify_error_message(msg: &str) -> ProviderError {
    let lower = msg.to_lowercase();

    if contains_any(&lower, CONTEXT_OVERFLOW_PATTERNS) {
        return ProviderError::ContextOverflow(msg.to_string());
    }
    if contains_any(&lower, BILLING_PATTERNS) {
        return ProviderError::Billing(msg.to_string());
    }
    if contains_any(&lower, AUTH_PATTERNS) {
        return ProviderError::Auth(msg.to_string());
    }
    if contains_any(&lower, RATE_LIMIT_PATTERNS) {
        return ProviderError::RateLimit(msg.to_string());
    }
    if contains_any(&lower, OVERLOADED_PATTERNS) {
        return ProviderError::Overloaded(msg.to_string());
    }
    if contains_any(&lower, TIMEOUT_PATTERNS) {
        return ProviderError::Timeout(msg.to_string());
    }

    ProviderError::Unknown(msg.to_string())
}

/// Shorthand for `classify_error_message(msg).is_context_overflow()`.
pub fn is_context_overflow_message(msg: &str) -> bool {
    contains_any(&msg.to_lowercase(), CONTEXT_OVERFLOW_PATTERNS)
}

fn contains_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}
