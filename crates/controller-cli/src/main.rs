//! Binary entry point for the Telegram agent controller daemon.

mod daemon;
mod instance_store;

use clap::Parser;
use std::path::PathBuf;

/// Telegram-driven controller multiplexing a bot across local agent
/// subprocesses.
#[derive(Parser, Debug)]
#[command(name = "telegram-controller", version, about)]
struct Cli {
    /// Path to a YAML config file, layered under environment variables.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the state directory (instances.json, logs/, pids/, router state).
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Override the default provider for newly spawned instances.
    #[arg(long)]
    provider: Option<String>,

    /// Override the default model for newly spawned instances.
    #[arg(long)]
    model: Option<String>,

    /// Enable debug-level logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match controller_core::ControllerConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }
    if let Some(provider) = cli.provider {
        config.default_provider = provider;
    }
    if let Some(model) = cli.model {
        config.default_model = model;
    }

    if let Err(e) = daemon::run(config).await {
        tracing::error!(error = %e, "controller exited with a fatal error");
        std::process::exit(1);
    }
}
