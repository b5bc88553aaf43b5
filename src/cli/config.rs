//! Config show/check command handler.

use std::path::Path;

use anyhow::{Context, Result};

use agentvisor::config::Config;

use super::ConfigAction;

pub(crate) async fn cmd_config(path: &Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::load_from_path(path).context("Failed to load config")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Check => {
            println!("Config file: {}", path.display());
            if !path.exists() {
                println!("[OK] No config file found (using defaults)");
                return Ok(());
            }
            match Config::load_from_path(path) {
                Ok(config) => {
                    println!("[OK] Configuration looks good!");
                    println!("  data dir: {}", config.data_dir().display());
                }
                Err(e) => println!("[ERROR] {}", e),
            }
        }
    }
    Ok(())
}
