//! Status and agent listing from the data directory.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};

use agentvisor::agent::Lifecycle;
use agentvisor::config::Config;
use agentvisor::storage::{FileStorage, Storage};

pub(crate) fn open_storage(config_path: &Path) -> Result<(Config, FileStorage)> {
    let config = Config::load_from_path(config_path).context("Failed to load config")?;
    let storage = FileStorage::new(config.data_dir()).context("Failed to open data directory")?;
    Ok((config, storage))
}

/// CLI entry point for `agentvisor status`.
pub(crate) async fn cmd_status(config_path: &Path) -> Result<()> {
    let (config, storage) = open_storage(config_path)?;

    let mut by_lifecycle: BTreeMap<String, usize> = BTreeMap::new();
    for record in storage.agent_records_list().await? {
        let lifecycle = storage
            .agent_state_read(&record.id)
            .await?
            .map(|state| state.lifecycle.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        *by_lifecycle.entry(lifecycle).or_default() += 1;
    }
    let subscriptions = storage.subscriptions_load().await?;
    let delayed = storage.delayed_load().await?;

    println!("agentvisor status");
    println!("=================");
    println!("Data dir:       {}", config.data_dir().display());
    println!(
        "Context limit:  {} tokens (warning at {:.0}%)",
        config.agents.emergency_context_limit,
        config.agents.compaction_warning_ratio * 100.0
    );
    println!(
        "Poison pill:    {} ms after sleep",
        config.agents.poison_pill_delay_ms
    );
    println!();
    println!("Agents:");
    if by_lifecycle.is_empty() {
        println!("  (none)");
    }
    for (lifecycle, count) in &by_lifecycle {
        println!("  {:<10} {}", lifecycle, count);
    }
    println!();
    println!("Subscriptions:  {}", subscriptions.len());
    println!("Delayed:        {}", delayed.len());
    if let Some(next) = delayed.iter().min_by_key(|e| e.deliver_at) {
        println!("  next: {} at {}", next.signal_type, format_ms(next.deliver_at));
    }
    Ok(())
}

/// CLI entry point for `agentvisor agents`.
pub(crate) async fn cmd_agents(config_path: &Path) -> Result<()> {
    let (_, storage) = open_storage(config_path)?;
    let records = storage.agent_records_list().await?;
    if records.is_empty() {
        println!("No agents.");
        return Ok(());
    }
    println!(
        "{:<38} {:<12} {:<10} {:<20} LABEL",
        "ID", "KIND", "STATE", "UPDATED"
    );
    for record in records {
        let state = storage.agent_state_read(&record.id).await?;
        let (lifecycle, updated) = match &state {
            Some(state) => (state.lifecycle, format_ms(state.updated_at)),
            None => (Lifecycle::Dead, "-".to_string()),
        };
        println!(
            "{:<38} {:<12} {:<10} {:<20} {}",
            record.id,
            record.descriptor.kind(),
            lifecycle,
            updated,
            record.descriptor.label()
        );
    }
    Ok(())
}

pub(crate) fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}
