//! CLI entry point for the publish agent
//!
//! Parses command line arguments and starts the daemon.

use clap::Parser;
use publish_agent::{logging, CancellationToken, Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// Publish agent - imports, publishes and live-streams videos for a Node
#[derive(Parser, Debug)]
#[command(name = "publish-agent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the local server bind address
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    if let Err(e) = logging::init(&config.logging.filter) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    println!("Publish agent starting...");
    info!(config = %args.config.display(), videos_root = %config.storage.videos_root.display(), "Configuration loaded");

    let daemon = match Daemon::with_config(config) {
        Ok(daemon) => Arc::new(daemon),
        Err(e) => {
            error!("Failed to initialize daemon: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                signal.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    match daemon.run(shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Daemon error: {}", e);
            ExitCode::FAILURE
        }
    }
}
