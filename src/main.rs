use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use ares_relay::config::watcher::{self, ConfigWatcher};
use ares_relay::config::{load_config, AresConfig, ConfigError};
use ares_relay::lifecycle::startup::VERSION;
use ares_relay::lifecycle::{build_transport, spawn_signal_handler, Ares, Shutdown, SignalEvent};
use ares_relay::observability::{init_logging, metrics};

#[derive(Parser)]
#[command(name = "ares-relay")]
#[command(about = "Mesh destination proxy relay", version)]
struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(short, long, default_value = "ares.toml", global = true)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Run the daemon (default)
    Start,
    /// Load and validate the configuration, then exit
    Configtest,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Start) {
        Command::Configtest => configtest(&cli.config),
        Command::Start => start(cli).await,
    }
}

fn configtest(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    match load_config(path) {
        Ok(_) => {
            println!("configuration {} is valid", path.display());
            Ok(())
        }
        Err(ConfigError::Validation(errors)) => {
            eprintln!("configuration {} is invalid:", path.display());
            for error in &errors {
                eprintln!("  {error}");
            }
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

async fn start(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config_present = cli.config.exists();
    let config = if config_present {
        load_config(&cli.config)?
    } else {
        AresConfig::default()
    };

    let log_handle = init_logging(&config.logging, cli.log_level.as_deref())?;
    tracing::info!(version = VERSION, config = %cli.config.display(), "ares-relay starting");
    if !config_present {
        tracing::warn!(config = %cli.config.display(), "Config file not found; using defaults");
    }

    if config.monitoring.enabled {
        match config.monitoring.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr, &config.monitoring.metrics_prefix) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(e) => tracing::error!(
                metrics_address = %config.monitoring.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    } else {
        metrics::set_prefix(&config.monitoring.metrics_prefix);
    }
    metrics::record_info(VERSION);

    let transport = build_transport(config.core.transport);
    let ares = Arc::new(Ares::new(config.clone(), transport).with_log_handle(log_handle));
    ares.init_features();

    let shutdown = Shutdown::new();
    let (config_watcher, updates) = ConfigWatcher::new(&cli.config);
    let reload_tx = config_watcher.sender();
    let _file_watch = if config_present {
        match config_watcher.run() {
            Ok(watch) => Some(watch),
            Err(e) => {
                tracing::warn!(error = %e, "Config file watching unavailable");
                None
            }
        }
    } else {
        None
    };

    let (signal_tx, mut signals) = mpsc::unbounded_channel();
    spawn_signal_handler(signal_tx)?;
    {
        let shutdown = shutdown.clone();
        let path = cli.config.clone();
        tokio::spawn(async move {
            while let Some(event) = signals.recv().await {
                match event {
                    SignalEvent::Shutdown => shutdown.trigger(),
                    SignalEvent::Reload => {
                        watcher::reload_into(&path, &reload_tx);
                    }
                }
            }
        });
    }

    if config.admin.enabled {
        match config.admin.bind_address.parse() {
            Ok(addr) => {
                let ares = ares.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = ares_relay::admin::serve(addr, ares, shutdown).await {
                        tracing::error!(error = %e, "Admin endpoint failed");
                    }
                });
            }
            Err(e) => tracing::error!(
                bind_address = %config.admin.bind_address,
                error = %e,
                "Failed to parse admin address"
            ),
        }
    }

    ares.run(updates, shutdown).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
