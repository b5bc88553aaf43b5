//! Tools module
//!
//! Tools the model can call while an agent handles a message, the registry
//! that runs them, and the built-in signal tools.

pub mod registry;
pub mod signal;
pub mod types;

use std::sync::Arc;

pub use registry::{ToolExecutor, ToolRegistry};
pub use signal::{SignalGenerateTool, SignalSubscribeTool, SignalUnsubscribeTool};
pub use types::{Tool, ToolContext, ToolOutput};

use crate::signals::Signals;

/// Register the signal tools on `registry`.
pub fn register_signal_tools(registry: &mut ToolRegistry, signals: &Arc<Signals>) {
    registry.register(Box::new(SignalGenerateTool::new(Arc::clone(signals))));
    registry.register(Box::new(SignalSubscribeTool::new(Arc::clone(signals))));
    registry.register(Box::new(SignalUnsubscribeTool::new(Arc::clone(signals))));
}
