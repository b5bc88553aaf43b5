//! Logging initialization for Agentvisor.
//!
//! Supports three formats:
//! - `pretty`: multi-line human-readable output
//! - `component`: compact single-line output; use [`log_component!`] to add a
//!   `component` field for per-subsystem filtering
//! - `json`: structured JSON lines for log aggregators

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Result, VisorError};

/// Initialize the global tracing subscriber from config.
///
/// Call this once at startup before any tracing events are emitted.
/// Falls back to `RUST_LOG` env var; if unset, uses `cfg.level`.
pub fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    let file = match &cfg.file {
        Some(path) => Some(Arc::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        )),
        None => None,
    };

    let installed = match (&cfg.format, file) {
        (LogFormat::Json, Some(file)) => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(file)
            .try_init(),
        (LogFormat::Json, None) => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
        (LogFormat::Pretty, Some(file)) => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter)
            .with_writer(file)
            .try_init(),
        (LogFormat::Pretty, None) => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter)
            .try_init(),
        (LogFormat::Component, Some(file)) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .compact()
            .with_writer(file)
            .try_init(),
        (LogFormat::Component, None) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .compact()
            .try_init(),
    };

    installed.map_err(|e| VisorError::Config(format!("failed to install logger: {}", e)))
}

/// Emit a component-tagged tracing event.
///
/// Works with any tracing level (`trace`, `debug`, `info`, `warn`, `error`).
/// The `component` field makes it easy to grep logs by subsystem:
///
/// ```
/// # use agentvisor::log_component;
/// log_component!(info, "scheduler", "timer armed");
/// log_component!(warn, "agent", "context budget crossed", used = 8000u64, limit = 10000u64);
/// ```
#[macro_export]
macro_rules! log_component {
    ($level:ident, $component:expr, $msg:expr) => {
        tracing::$level!(component = $component, $msg)
    };
    ($level:ident, $component:expr, $msg:expr, $($key:ident = $val:expr),+ $(,)?) => {
        tracing::$level!(component = $component, $($key = $val,)+ $msg)
    };
}
