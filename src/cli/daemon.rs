//! Daemon: run the supervisor until interrupted.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use agentvisor::channels::{ConnectorRegistry, LogConnector};
use agentvisor::config::Config;
use agentvisor::supervisor::SupervisorBuilder;

/// CLI entry point for `agentvisor daemon`.
pub(crate) async fn cmd_daemon(config_path: &Path) -> Result<()> {
    let config = Config::load_from_path(config_path).context("Failed to load config")?;
    println!("Starting agentvisor (data: {})", config.data_dir().display());

    let connectors = ConnectorRegistry::new();
    connectors.register("log", Arc::new(LogConnector)).await;

    let supervisor = SupervisorBuilder::new(config)
        .connectors(connectors)
        .build()
        .await?;
    supervisor.start().await?;
    info!(agents = supervisor.list_agents().await.len(), "Daemon running");

    wait_for_shutdown(config_path, &supervisor).await;

    supervisor.stop().await;
    println!("Stopped.");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(config_path: &Path, supervisor: &agentvisor::supervisor::Supervisor) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            error!("Cannot listen for SIGHUP: {}", e);
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                return;
            }
            _ = hangup.recv() => reload(config_path, supervisor).await,
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_config_path: &Path, _supervisor: &agentvisor::supervisor::Supervisor) {
    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");
}

#[cfg_attr(not(unix), allow(dead_code))]
async fn reload(config_path: &Path, supervisor: &agentvisor::supervisor::Supervisor) {
    match Config::load_from_path(config_path) {
        Ok(config) => match supervisor.reload(config).await {
            Ok(true) => info!("Configuration reloaded"),
            Ok(false) => info!("Configuration unchanged"),
            Err(e) => error!("Reload rejected: {}", e),
        },
        Err(e) => error!("Failed to read config for reload: {}", e),
    }
}
