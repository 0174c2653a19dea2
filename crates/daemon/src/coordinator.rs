//! The rip coordinator: polls the drive and runs one rip cycle per inserted disc.
//!
//! A cycle is inspect -> rip -> eject -> transcode -> cleanup -> notify, in
//! that order. Every stage error is caught here, reported once, and followed
//! by a best-effort eject. The rip slot is held by a [`RipGuard`] for the
//! whole cycle and released on every exit path.

use crate::detect::MediaDetector;
use crate::inspect::{DiscInfo, DiscInspector, ScanError};
use crate::notify::{Notification, NotificationSink};
use crate::process::{run_to_completion, CommandRunner, CommandSpec};
use crate::rip::{RipError, RipOutput, RipPipeline, RipSettings};
use crate::state::{CoordinatorState, PresenceChange, RipGuard};
use crate::transcode::{
    display_name, humanize, output_filename, TranscodeError, TranscodeJob, TranscodePipeline,
    TranscodeProfile,
};
use disc_ripper_config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A stage failure that ends a rip cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("disc inspection failed: {0}")]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Rip(#[from] RipError),

    #[error("could not create output folder {}: {source}", path.display())]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// One entry per file that failed; siblings were still attempted
    #[error("{} of {total} file(s) failed to transcode", failures.len())]
    Transcode {
        total: usize,
        failures: Vec<(String, TranscodeError)>,
    },
}

impl CycleError {
    /// Title of the error notification sent for this failure.
    pub fn notification_title(&self) -> &'static str {
        match self {
            CycleError::Rip(e) if e.is_disc_damage() => "Disc Read Error",
            CycleError::Scan(_) | CycleError::Rip(_) => "Ripping Failed",
            CycleError::OutputDirectory { .. } | CycleError::Transcode { .. } => "Compression Failed",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            CycleError::Scan(ScanError::Spawn(e)) if e.is_not_found() => {
                "The disc ripping tool is not installed or not on PATH.".to_string()
            }
            CycleError::Scan(_) => "Could not read the disc's contents. The disc may be dirty or \
                 unsupported - clean it and try again."
                .to_string(),
            CycleError::Rip(e) => e.user_message(),
            CycleError::OutputDirectory { .. } => {
                "The video folder is not writable. Check folder permissions and free disk space."
                    .to_string()
            }
            CycleError::Transcode { failures, .. } => {
                let names: Vec<String> = failures.iter().map(|(name, _)| format!("\"{name}\"")).collect();
                let reason = failures
                    .first()
                    .map(|(_, e)| e.user_message())
                    .unwrap_or_default();
                format!("Failed to convert {}: {}", names.join(", "), reason)
            }
        }
    }
}

/// How a rip cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed { disc: String, outputs: Vec<PathBuf> },
    NoValidTitles { disc: String },
    /// The same disc was ripped too recently; nothing was done
    CoolingDown { disc: String, remaining_secs: u64 },
    Failed { disc: Option<String>, error: String },
}

/// Result of one poll of the drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A cycle is running; only a removal was recorded, if any
    Busy,
    Observed(PresenceChange),
}

/// Coordinator knobs taken from the configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub device: String,
    pub eject_tool: String,
    pub auto_eject: bool,
    pub keep_intermediate: bool,
    pub spin_up_delay: Duration,
    pub final_output_dir: PathBuf,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            device: config.drive.device.clone(),
            eject_tool: config.tools.eject.clone(),
            auto_eject: config.rip.auto_eject,
            keep_intermediate: config.rip.keep_intermediate,
            spin_up_delay: Duration::from_secs(config.schedule.spin_up_delay_secs),
            final_output_dir: config.final_output_dir(),
        }
    }
}

/// Per-cycle bookkeeping for the error path.
#[derive(Debug, Default)]
struct CycleContext {
    disc_name: Option<String>,
    ejected: bool,
}

pub struct RipCoordinator {
    state: Arc<CoordinatorState>,
    runner: Arc<dyn CommandRunner>,
    notifier: Arc<dyn NotificationSink>,
    detector: MediaDetector,
    inspector: DiscInspector,
    ripper: RipPipeline,
    transcoder: TranscodePipeline,
    settings: CoordinatorSettings,
}

impl RipCoordinator {
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>, notifier: Arc<dyn NotificationSink>) -> Self {
        let rip_settings = RipSettings {
            ripper: config.tools.ripper.clone(),
            disc_slot: config.drive.disc_slot,
            temp_root: config.paths.temp_dir.clone(),
            create_subfolder: config.paths.create_temp_subfolder,
            titles_to_rip: config.rip.titles_to_rip,
        };

        Self {
            state: Arc::new(CoordinatorState::new(Duration::from_secs(
                config.schedule.cooldown_secs,
            ))),
            detector: MediaDetector::new(runner.clone()),
            inspector: DiscInspector::new(
                runner.clone(),
                &config.tools.ripper,
                config.drive.disc_slot,
                config.rip.min_title_length_secs,
            ),
            ripper: RipPipeline::new(runner.clone(), rip_settings),
            transcoder: TranscodePipeline::new(
                runner.clone(),
                TranscodeProfile::from_config(config),
                config.paths.temp_dir.clone(),
            ),
            runner,
            notifier,
            settings: CoordinatorSettings::from_config(config),
        }
    }

    pub fn state(&self) -> Arc<CoordinatorState> {
        Arc::clone(&self.state)
    }

    pub fn transcoder(&self) -> &TranscodePipeline {
        &self.transcoder
    }

    pub fn notifier(&self) -> Arc<dyn NotificationSink> {
        Arc::clone(&self.notifier)
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Probe the drive and fold the reading into the edge detector.
    /// Only state changes are logged.
    ///
    /// A cycle ejects before transcoding, so removals are still recorded
    /// while it runs.
    pub async fn poll(&self) -> PollOutcome {
        let busy = self.state.is_ripping();
        let present = self.detector.is_disc_present(&self.settings.device).await;
        if busy {
            let change = self.state.observe_presence_while_busy(present).await;
            self.log_change(change);
            return PollOutcome::Busy;
        }

        let change = self.state.observe_presence(present).await;
        self.log_change(change);
        PollOutcome::Observed(change)
    }

    fn log_change(&self, change: PresenceChange) {
        match change {
            PresenceChange::Inserted => info!(device = %self.settings.device, "disc detected in drive"),
            PresenceChange::Removed => info!(device = %self.settings.device, "disc removed"),
            PresenceChange::RemovedAfterEject => info!("disc removed, ready to detect new discs"),
            PresenceChange::AwaitingRemoval | PresenceChange::Unchanged => {}
        }
    }

    /// Poll once and, on a newly inserted disc, start a rip cycle on its own
    /// task. Returns the cycle's handle when one was started.
    pub async fn tick(self: &Arc<Self>) -> Option<JoinHandle<CycleOutcome>> {
        if self.poll().await != PollOutcome::Observed(PresenceChange::Inserted) {
            return None;
        }
        let Some(guard) = self.state.try_begin_rip() else {
            info!("already ripping a disc, skipping");
            return None;
        };
        let this = Arc::clone(self);
        Some(tokio::spawn(async move { this.run_cycle(guard).await }))
    }

    /// Run one full cycle while holding the rip slot.
    pub async fn run_cycle(&self, guard: RipGuard) -> CycleOutcome {
        let _guard = guard;
        info!("=== starting disc ripping process ===");

        let mut ctx = CycleContext::default();
        match self.execute(&mut ctx).await {
            Ok(outcome) => outcome,
            Err(e) => self.handle_failure(ctx, e).await,
        }
    }

    async fn execute(&self, ctx: &mut CycleContext) -> Result<CycleOutcome, CycleError> {
        if !self.settings.spin_up_delay.is_zero() {
            tokio::time::sleep(self.settings.spin_up_delay).await;
        }

        let disc = self.inspector.inspect().await?;
        ctx.disc_name = Some(disc.name.clone());

        if let Some(left) = self.state.cooldown_remaining(&disc.name, Instant::now()).await {
            let remaining_secs = left.as_secs_f64().ceil() as u64;
            info!(
                disc = %disc.name,
                remaining_secs,
                "disc detected but still in cooldown"
            );
            return Ok(CycleOutcome::CoolingDown {
                disc: disc.name,
                remaining_secs,
            });
        }

        if disc.title_count == 0 {
            return Ok(self.finish_without_titles(ctx, &disc).await);
        }

        let selected = disc.selected_titles(self.ripper.settings().titles_to_rip).len();
        info!(
            disc = %disc.name,
            qualifying = disc.title_count,
            ripping = selected,
            "disc detected"
        );
        self.notifier.notify(Notification::info(
            "Disc Detected",
            format!("Starting to rip \"{}\"", disc.name),
        ));

        let output = self.ripper.rip(&disc).await?;
        if output.files.is_empty() {
            return Ok(self.finish_without_titles(ctx, &disc).await);
        }
        info!(count = output.files.len(), "ripping tool completed successfully");
        for (n, file) in output.files.iter().enumerate() {
            let size = fs::metadata(file).map(|m| m.len()).unwrap_or(0);
            info!(
                "  {}. {} - {:.2} MB",
                n + 1,
                file.display(),
                size as f64 / 1024.0 / 1024.0
            );
        }

        // The disc is no longer needed; free the drive for the next one
        if self.settings.auto_eject {
            info!("ejecting disc (no longer needed for compression)");
            ctx.ejected = true;
            self.eject().await;
        }

        let final_dir = &self.settings.final_output_dir;
        fs::create_dir_all(final_dir).map_err(|source| CycleError::OutputDirectory {
            path: final_dir.clone(),
            source,
        })?;

        self.notifier.notify(Notification::info(
            "Starting Compression",
            format!("Converting \"{}\"", disc.name),
        ));
        let outputs = self.transcode_all(&disc, &output).await?;

        self.finish_intermediates(&output);

        let title = humanize(&disc.name);
        info!(disc = %disc.name, folder = %final_dir.display(), "=== ripping and conversion completed ===");
        self.notifier.notify(Notification::success(
            "Compression Complete",
            format!("\"{}\" is now ready to stream", title),
        ));
        self.state.record_completion(&disc.name, Instant::now(), None).await;

        Ok(CycleOutcome::Completed {
            disc: disc.name,
            outputs,
        })
    }

    async fn finish_without_titles(&self, ctx: &mut CycleContext, disc: &DiscInfo) -> CycleOutcome {
        info!(disc = %disc.name, "no valid titles found on disc (all shorter than minimum length)");
        self.notifier.notify(Notification::info(
            "No Valid Titles",
            "Nothing found on this disk to rip based on the minimum title length setting.",
        ));
        if self.settings.auto_eject {
            ctx.ejected = true;
            self.eject().await;
        }
        self.state.record_completion(&disc.name, Instant::now(), None).await;
        CycleOutcome::NoValidTitles {
            disc: disc.name.clone(),
        }
    }

    /// Transcode every intermediate in rip order. A failed file does not stop
    /// its siblings but fails the cycle.
    async fn transcode_all(&self, disc: &DiscInfo, output: &RipOutput) -> Result<Vec<PathBuf>, CycleError> {
        let base = humanize(&disc.name);
        let extension = self.transcoder.profile().extension.clone();
        let total = output.files.len();
        let mut finished = Vec::with_capacity(total);
        let mut failures = Vec::new();

        for (index, input) in output.files.iter().enumerate() {
            let job = TranscodeJob {
                input: input.clone(),
                output_dir: self.settings.final_output_dir.clone(),
                output_filename: output_filename(&base, index, total, &extension),
                display_name: display_name(&base, index, total),
                cleanup_source: false,
            };
            info!("converting {}/{}: {}", index + 1, total, input.display());
            match self.transcoder.transcode(&job).await {
                Ok(path) => finished.push(path),
                Err(e) => {
                    error!(input = %input.display(), error = %e, "failed to convert");
                    failures.push((job.display_name, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(finished)
        } else {
            Err(CycleError::Transcode { total, failures })
        }
    }

    /// Keep (move into the video folder) or delete the intermediates, then
    /// drop the per-disc temp folder. Failures here are only logged.
    fn finish_intermediates(&self, output: &RipOutput) {
        let final_dir = &self.settings.final_output_dir;
        for file in &output.files {
            if self.settings.keep_intermediate {
                let Some(name) = file.file_name() else {
                    continue;
                };
                let dest = final_dir.join(name);
                if let Err(e) = move_file(file, &dest) {
                    warn!(from = %file.display(), to = %dest.display(), error = %e, "failed to keep intermediate file");
                }
            } else if let Err(e) = fs::remove_file(file) {
                warn!(path = %file.display(), error = %e, "failed to delete intermediate file");
            }
        }

        if output.created_subfolder && output.output_dir.exists() {
            match fs::remove_dir_all(&output.output_dir) {
                Ok(()) => info!(path = %output.output_dir.display(), "removed temp folder"),
                Err(e) => warn!(path = %output.output_dir.display(), error = %e, "failed to remove temp folder"),
            }
        }
    }

    async fn handle_failure(&self, ctx: CycleContext, err: CycleError) -> CycleOutcome {
        error!(error = %err, "error during ripping process");
        self.notifier
            .notify(Notification::error(err.notification_title(), err.user_message()));

        if self.settings.auto_eject && !ctx.ejected {
            info!("attempting to eject disc after error");
            self.eject().await;
        }

        let message = err.to_string();
        match &ctx.disc_name {
            Some(name) => {
                self.state
                    .record_completion(name, Instant::now(), Some(message.clone()))
                    .await
            }
            None => self.state.record_failure(message.clone()).await,
        }

        CycleOutcome::Failed {
            disc: ctx.disc_name,
            error: message,
        }
    }

    /// Eject the drive. Never fails the cycle; returns whether it worked.
    pub async fn eject(&self) -> bool {
        let spec = CommandSpec::new(&self.settings.eject_tool).arg(&self.settings.device);
        info!(device = %self.settings.device, "ejecting disc");

        let failure = match run_to_completion(self.runner.as_ref(), &spec).await {
            Ok(output) if output.success() => None,
            Ok(output) => Some(format!(
                "exit code {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            )),
            Err(e) => Some(e.to_string()),
        };

        match failure {
            None => {
                info!("disc ejected; waiting for it to be removed before detecting new discs");
                self.state.mark_ejected().await;
                true
            }
            Some(reason) => {
                warn!(device = %self.settings.device, reason = %reason, "error ejecting disc");
                warn!("possible causes: drive not accessible, no disc in drive, drive busy, wrong device path");
                false
            }
        }
    }
}

/// Rename, falling back to copy + delete across filesystems.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}
