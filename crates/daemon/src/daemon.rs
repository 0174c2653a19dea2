//! Daemon startup and main loop for the disc ripper
//!
//! Startup order: load config, run preflight checks, build the coordinator.
//! `run` then starts the status endpoint, runs the orphan recovery pass,
//! polls once immediately and keeps polling on a fixed interval until a
//! termination signal arrives.

use crate::coordinator::RipCoordinator;
use crate::notify::{HttpNotifier, NotificationSink};
use crate::process::{CommandRunner, SystemRunner};
use crate::recovery::{OrphanRecovery, RecoveryError};
use crate::startup::{log_process_identity, run_startup_checks, StartupError};
use crate::status::run_status_server;
use disc_ripper_config::{Config, ConfigError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Signal handler error: {0}")]
    Signal(#[source] std::io::Error),
}

pub struct Daemon {
    pub config: Config,
    coordinator: Arc<RipCoordinator>,
}

impl Daemon {
    /// Load configuration, run startup checks and wire up the real tools.
    pub async fn new<P: AsRef<Path>>(config_path: P, skip_checks: bool) -> Result<Self, DaemonError> {
        let mut config = Config::load(config_path)?;
        for expanded in config.expand_paths() {
            warn!(
                from = %expanded.original.display(),
                to = %expanded.expanded.display(),
                "expanded '~' in configured path"
            );
        }
        Self::with_config(config, skip_checks).await
    }

    pub async fn with_config(config: Config, skip_checks: bool) -> Result<Self, DaemonError> {
        log_process_identity();
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);

        if skip_checks {
            warn!("skipping startup checks");
        } else {
            run_startup_checks(&config, runner.as_ref()).await?;
        }

        let notifier: Arc<dyn NotificationSink> =
            Arc::new(HttpNotifier::new(config.notify.url.as_deref()));
        Ok(Self::with_parts(config, runner, notifier))
    }

    /// Assemble a daemon from explicit parts; no checks are run.
    pub fn with_parts(
        config: Config,
        runner: Arc<dyn CommandRunner>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let coordinator = Arc::new(RipCoordinator::new(&config, runner, notifier));
        Self { config, coordinator }
    }

    pub fn coordinator(&self) -> Arc<RipCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Spawn the status HTTP server; its failure never stops ripping.
    pub fn start_status_server(&self) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.status.enabled {
            return None;
        }
        let state = self.coordinator.state();
        let bind = self.config.status.bind.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_status_server(state, &bind).await {
                error!(error = %e, "status server error");
            }
        }))
    }

    /// Resume work left behind by a previous run.
    pub async fn recover(&self) -> Result<(), DaemonError> {
        info!("checking for discs that haven't finished compressing");
        let recovery = OrphanRecovery::new(
            self.coordinator.transcoder().clone(),
            self.coordinator.notifier(),
            self.config.final_output_dir(),
        );
        recovery.run().await?;
        Ok(())
    }

    /// Run the daemon until SIGINT or SIGTERM.
    ///
    /// Running rip cycles and their subprocesses are not cancelled; anything
    /// left unfinished is picked up by the next recovery pass.
    pub async fn run(&self) -> Result<(), DaemonError> {
        info!("=== disc ripper started ===");
        info!(
            device = %self.config.drive.device,
            output = %self.config.final_output_dir().display(),
            temp = %self.config.paths.temp_dir.display(),
            poll_interval_secs = self.config.schedule.poll_interval_secs,
            "monitoring drive"
        );

        let _server = self.start_status_server();

        if let Err(e) = self.recover().await {
            error!(error = %e, "orphan recovery failed");
        }

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(DaemonError::Signal)?;

        let period = Duration::from_secs(self.config.schedule.poll_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // The first tick completes immediately
                _ = interval.tick() => {
                    self.coordinator.tick().await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}
