//! CLI module: command parsing and dispatch
//!
//! All CLI logic lives here. `main.rs` calls `cli::run()`.

pub mod config;
pub mod daemon;
pub mod signals;
pub mod status;

use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "agentvisor")]
#[command(version)]
#[command(about = "Actor runtime for long-lived agents", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.agentvisor/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor until interrupted (SIGHUP reloads config)
    Daemon,
    /// Show agents and scheduler state from the data directory
    Status,
    /// List persisted agents
    Agents,
    /// Inspect the signal bus
    Signals {
        #[command(subcommand)]
        action: SignalsAction,
    },
    /// Inspect or cancel delayed signals
    Delayed {
        #[command(subcommand)]
        action: DelayedAction,
    },
    /// Show or validate configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
pub enum SignalsAction {
    /// Most recent signals, oldest first
    Recent {
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// All subscriptions
    Subscriptions,
}

#[derive(Subcommand)]
pub enum DelayedAction {
    /// Pending entries in delivery order
    List,
    /// Cancel one entry by id
    Cancel { id: String },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Validate the configuration file
    Check,
}

/// Entry point for the CLI, called from main().
pub async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(agentvisor::config::Config::path);

    // Respect the logging settings when the config loads; fall back to
    // defaults so a broken file still gets diagnostics.
    let logging_cfg = agentvisor::config::Config::load_from_path(&config_path)
        .map(|c| c.logging)
        .unwrap_or_default();
    if let Err(e) = agentvisor::utils::logging::init_logging(&logging_cfg) {
        eprintln!("Logging disabled: {}", e);
    }

    match cli.command {
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
        }
        Some(Commands::Version) => cmd_version(),
        Some(Commands::Daemon) => daemon::cmd_daemon(&config_path).await?,
        Some(Commands::Status) => status::cmd_status(&config_path).await?,
        Some(Commands::Agents) => status::cmd_agents(&config_path).await?,
        Some(Commands::Signals { action }) => signals::cmd_signals(&config_path, action).await?,
        Some(Commands::Delayed { action }) => signals::cmd_delayed(&config_path, action).await?,
        Some(Commands::Config { action }) => config::cmd_config(&config_path, action).await?,
    }

    Ok(())
}

/// Display version information
fn cmd_version() {
    println!("agentvisor {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Actor runtime for long-lived agents");
}
