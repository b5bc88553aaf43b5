//! Configuration management for Agentvisor
//!
//! Configuration is loaded from `~/.agentvisor/config.json` (or a `.toml`
//! file when one is passed explicitly) with environment variable overrides.

mod types;

pub use types::*;

use crate::error::{Result, VisorError};
use std::path::{Path, PathBuf};

impl Config {
    /// Returns the Agentvisor configuration directory path (~/.agentvisor)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".agentvisor")
    }

    /// Returns the path to the config file (~/.agentvisor/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Directory holding agent state, history, signals and delayed entries.
    pub fn data_dir(&self) -> PathBuf {
        match &self.storage.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => Self::dir().join("data"),
        }
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// If the config file doesn't exist, returns default configuration.
    /// Environment variables can override config values using the pattern:
    /// `AGENTVISOR_SECTION_KEY`
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    ///
    /// Files ending in `.toml` are parsed as TOML, everything else as JSON.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::parse(path, &content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    fn parse(path: &Path, content: &str) -> Result<Self> {
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        if is_toml {
            Ok(toml::from_str(content)?)
        } else {
            Ok(serde_json::from_str(content)?)
        }
    }

    /// Save configuration as pretty JSON.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.agents.emergency_context_limit == 0 {
            return Err(VisorError::Config(
                "agents.emergency_context_limit must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.agents.compaction_warning_ratio) {
            return Err(VisorError::Config(
                "agents.compaction_warning_ratio must be between 0 and 1".to_string(),
            ));
        }
        if self.agents.poison_pill_delay_ms <= 0 || self.agents.idle_signal_delay_ms <= 0 {
            return Err(VisorError::Config(
                "agent lifecycle delays must be positive".to_string(),
            ));
        }
        if self.scheduler.max_timer_ms == 0 {
            return Err(VisorError::Config(
                "scheduler.max_timer_ms must be positive".to_string(),
            ));
        }
        if self.signals.recent_max_limit == 0 {
            return Err(VisorError::Config(
                "signals.recent_max_limit must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables follow the pattern: AGENTVISOR_SECTION_KEY
    fn apply_env_overrides(&mut self) {
        // Agents
        if let Ok(val) = std::env::var("AGENTVISOR_AGENTS_EMERGENCY_CONTEXT_LIMIT") {
            if let Ok(v) = val.parse() {
                self.agents.emergency_context_limit = v;
            }
        }
        if let Ok(val) = std::env::var("AGENTVISOR_AGENTS_POISON_PILL_DELAY_MS") {
            if let Ok(v) = val.parse() {
                self.agents.poison_pill_delay_ms = v;
            }
        }
        if let Ok(val) = std::env::var("AGENTVISOR_AGENTS_IDLE_SIGNAL_DELAY_MS") {
            if let Ok(v) = val.parse() {
                self.agents.idle_signal_delay_ms = v;
            }
        }
        if let Ok(val) = std::env::var("AGENTVISOR_AGENTS_MAX_TOOL_ITERATIONS") {
            if let Ok(v) = val.parse() {
                self.agents.max_tool_iterations = v;
            }
        }

        // Scheduler
        if let Ok(val) = std::env::var("AGENTVISOR_SCHEDULER_MAX_TIMER_MS") {
            if let Ok(v) = val.parse() {
                self.scheduler.max_timer_ms = v;
            }
        }
        if let Ok(val) = std::env::var("AGENTVISOR_SCHEDULER_FAILURE_RETRY_MS") {
            if let Ok(v) = val.parse() {
                self.scheduler.failure_retry_ms = v;
            }
        }

        // Storage
        if let Ok(val) = std::env::var("AGENTVISOR_STORAGE_DATA_DIR") {
            self.storage.data_dir = Some(val);
        }

        // Logging
        if let Ok(val) = std::env::var("AGENTVISOR_LOGGING_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("AGENTVISOR_LOGGING_FORMAT") {
            match val.to_lowercase().as_str() {
                "pretty" => self.logging.format = LogFormat::Pretty,
                "component" => self.logging.format = LogFormat::Component,
                "json" => self.logging.format = LogFormat::Json,
                _ => {}
            }
        }
    }
}
