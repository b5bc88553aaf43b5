//! Configuration types for Agentvisor

use serde::{Deserialize, Serialize};

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Agent lifecycle and context budget settings
    pub agents: AgentsConfig,
    /// Delayed signal scheduler settings
    pub scheduler: SchedulerConfig,
    /// Signal bus settings
    pub signals: SignalsConfig,
    /// Durable storage location
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

// ============================================================================
// Agents Configuration
// ============================================================================

/// Agent runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentsConfig {
    /// Estimated token count at which a message forces compaction first
    pub emergency_context_limit: usize,
    /// Fraction of the limit at which the budget is reported as `warning`
    pub compaction_warning_ratio: f64,
    /// Delay before a sleeping evictable agent is killed
    pub poison_pill_delay_ms: i64,
    /// Delay before the idle lifecycle signal fires for a sleeping agent
    pub idle_signal_delay_ms: i64,
    /// Maximum inference rounds per message before giving up
    pub max_tool_iterations: usize,
    /// Provider ids passed to inference as an override list
    pub default_providers: Option<Vec<String>>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            emergency_context_limit: 200_000,
            compaction_warning_ratio: 0.8,
            poison_pill_delay_ms: 3_600_000,
            idle_signal_delay_ms: 60_000,
            max_tool_iterations: 20,
            default_providers: None,
        }
    }
}

// ============================================================================
// Scheduler Configuration
// ============================================================================

/// Delayed signal scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound for a single timer sleep
    pub max_timer_ms: u64,
    /// Retry delay after a failed delivery pass
    pub failure_retry_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_timer_ms: 60_000,
            failure_retry_ms: 1_000,
        }
    }
}

// ============================================================================
// Signals Configuration
// ============================================================================

/// Signal bus settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalsConfig {
    /// Number of events returned by `list_recent` when no limit is given
    pub recent_default_limit: usize,
    /// Hard ceiling for `list_recent`
    pub recent_max_limit: usize,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            recent_default_limit: 200,
            recent_max_limit: 1_000,
        }
    }
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// Durable storage settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory; defaults to `~/.agentvisor/data`
    pub data_dir: Option<String>,
}

// ============================================================================
// Logging Configuration
// ============================================================================

/// Log output format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output
    Pretty,
    /// Compact single-line output with a `component` field
    #[default]
    Component,
    /// JSON lines for log aggregators
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format
    pub format: LogFormat,
    /// Default filter level when `RUST_LOG` is unset
    pub level: String,
    /// Optional file to append logs to
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: "info".to_string(),
            file: None,
        }
    }
}
