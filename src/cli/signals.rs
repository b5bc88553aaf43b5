//! Signal bus and delayed signal inspection.

use std::path::Path;

use anyhow::Result;

use agentvisor::storage::Storage;

use super::status::{format_ms, open_storage};
use super::{DelayedAction, SignalsAction};

pub(crate) async fn cmd_signals(config_path: &Path, action: SignalsAction) -> Result<()> {
    let (config, storage) = open_storage(config_path)?;
    match action {
        SignalsAction::Recent { limit } => {
            let limit = limit
                .unwrap_or(config.signals.recent_default_limit)
                .clamp(1, config.signals.recent_max_limit);
            let signals = storage.signals_recent(limit).await?;
            if signals.is_empty() {
                println!("No signals.");
            }
            for signal in signals {
                let data = signal
                    .data
                    .as_ref()
                    .map(|d| d.to_string())
                    .unwrap_or_default();
                println!(
                    "{}  {:<40} {:<24} {}",
                    format_ms(signal.created_at),
                    signal.signal_type,
                    signal.source.describe(),
                    data
                );
            }
        }
        SignalsAction::Subscriptions => {
            let mut subscriptions = storage.subscriptions_load().await?;
            subscriptions.sort_by(|a, b| {
                a.agent_id
                    .cmp(&b.agent_id)
                    .then_with(|| a.pattern.cmp(&b.pattern))
            });
            if subscriptions.is_empty() {
                println!("No subscriptions.");
            }
            for subscription in subscriptions {
                println!(
                    "{:<38} {:<40} {}",
                    subscription.agent_id,
                    subscription.pattern,
                    if subscription.silent { "silent" } else { "wake" }
                );
            }
        }
    }
    Ok(())
}

pub(crate) async fn cmd_delayed(config_path: &Path, action: DelayedAction) -> Result<()> {
    let (_, storage) = open_storage(config_path)?;
    let mut entries = storage.delayed_load().await?;
    match action {
        DelayedAction::List => {
            entries.sort_by(|a, b| {
                a.deliver_at
                    .cmp(&b.deliver_at)
                    .then_with(|| a.signal_type.cmp(&b.signal_type))
                    .then_with(|| a.id.cmp(&b.id))
            });
            if entries.is_empty() {
                println!("No delayed signals.");
            }
            for entry in entries {
                println!(
                    "{}  {}  {:<40} {}",
                    entry.id,
                    format_ms(entry.deliver_at),
                    entry.signal_type,
                    entry.repeat_key.as_deref().unwrap_or("-")
                );
            }
        }
        DelayedAction::Cancel { id } => {
            let before = entries.len();
            entries.retain(|e| e.id != id);
            if entries.len() == before {
                println!("No delayed signal with id {}", id);
                return Ok(());
            }
            storage.delayed_save(&entries).await?;
            println!("Cancelled {}.", id);
            println!("Note: a running daemon keeps its own copy and rewrites the table on its next change.");
        }
    }
    Ok(())
}
