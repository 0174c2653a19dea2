//! CLI entry point for the disc ripper
//!
//! Parses command line arguments, installs logging and starts the daemon.

use clap::Parser;
use disc_ripper_daemon::Daemon;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Disc Ripper - unattended optical disc ripping and transcoding
#[derive(Parser, Debug)]
#[command(name = "disc-ripper")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the temp folder for intermediate files
    #[arg(short, long)]
    temp_dir: Option<PathBuf>,

    /// Skip startup checks (folder permissions, tool availability). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!(config = %args.config.display(), "disc ripper starting");

    let mut config = match disc_ripper_daemon::Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(temp_dir) = args.temp_dir {
        config.paths.temp_dir = temp_dir;
    }
    for expanded in config.expand_paths() {
        warn!(
            from = %expanded.original.display(),
            to = %expanded.expanded.display(),
            "expanded '~' in configured path"
        );
    }

    let daemon = match Daemon::with_config(config, args.skip_checks).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = daemon.run().await {
        error!(error = %e, "daemon error");
        return ExitCode::FAILURE;
    }

    info!("disc ripper stopped");
    ExitCode::SUCCESS
}
