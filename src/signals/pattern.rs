//! Colon-segmented signal patterns.
//!
//! A pattern is matched segment by segment against a signal type. `*` matches
//! exactly one non-empty segment; every other segment must match literally.
//!
//! ```
//! use agentvisor::signals::pattern::matches;
//!
//! assert!(matches("build:*:done", "build:alpha:done"));
//! assert!(!matches("build:*:done", "build:a:b:done"));
//! ```

use crate::error::{Result, VisorError};

pub const WILDCARD: &str = "*";

/// Returns true if `signal_type` matches `pattern`.
pub fn matches(pattern: &str, signal_type: &str) -> bool {
    let mut pattern_segments = pattern.split(':');
    let mut type_segments = signal_type.split(':');
    loop {
        match (pattern_segments.next(), type_segments.next()) {
            (None, None) => return true,
            (Some(p), Some(t)) => {
                let ok = if p == WILDCARD { !t.is_empty() } else { p == t };
                if !ok {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// Reject empty patterns and patterns with empty segments.
pub fn validate(pattern: &str) -> Result<()> {
    if pattern.trim().is_empty() {
        return Err(VisorError::InvalidInput(
            "signal pattern must not be empty".to_string(),
        ));
    }
    if pattern.split(':').any(|segment| segment.trim().is_empty()) {
        return Err(VisorError::InvalidInput(format!(
            "signal pattern '{}' has an empty segment",
            pattern
        )));
    }
    Ok(())
}
