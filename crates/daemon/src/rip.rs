//! Extraction of the selected titles into intermediate files.
//!
//! The ripping tool is run once per title (it does not reliably accept a
//! batch of titles) with a zero umask, so its output stays writable for the
//! unprivileged transcoding step even when this process runs as root.

use crate::inspect::DiscInfo;
use crate::makemkv::{indicates_read_error, parse_message, parse_progress};
use crate::process::{CommandRunner, CommandSpec, ProcessError, ProcessEvent, EXIT_COMMAND_NOT_FOUND};
use std::fmt;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Extension of the intermediate container produced by the ripping tool.
pub const INTERMEDIATE_EXTENSION: &str = "mkv";

/// Error type for rip operations
#[derive(Debug, Error)]
pub enum RipError {
    /// The disc could not be physically read
    #[error("disc read error while ripping title {title}")]
    ReadError { title: u32, detail: String },

    /// The ripping tool could not be started
    #[error("ripping tool could not be started: {0}")]
    ToolStartFailure(#[source] ProcessError),

    /// The ripping tool is missing (reported by the umask wrapper shell)
    #[error("ripping tool {program} not found")]
    ToolNotFound { program: String },

    /// The tool reported success but left no intermediate files
    #[error("ripping tool completed but produced no output files in {}", path.display())]
    NoOutputProduced { path: PathBuf },

    /// The tool failed for a reason other than a read error
    #[error("ripping tool exited with code {exit_code:?} on title {title}\n{diagnostics}")]
    NonZeroExit {
        title: u32,
        exit_code: Option<i32>,
        diagnostics: Diagnostics,
    },

    #[error("could not prepare output directory {}: {source}", path.display())]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("output directory {} is not writable", path.display())]
    NotWritable { path: PathBuf },
}

impl RipError {
    /// Plain-language explanation for the operator.
    pub fn user_message(&self) -> String {
        match self {
            RipError::ReadError { .. } => "Unable to read disc - the disc may be scratched, damaged, or dirty. \
                 Please clean the disc and try again."
                .to_string(),
            RipError::ToolStartFailure(e) if e.is_not_found() => {
                "The disc ripping tool is not installed or not on PATH.".to_string()
            }
            RipError::ToolNotFound { .. } => {
                "The disc ripping tool is not installed or not on PATH.".to_string()
            }
            RipError::ToolStartFailure(_) => {
                "The disc ripping tool could not be started. Check the service logs.".to_string()
            }
            RipError::NoOutputProduced { .. } => "Ripping finished without producing any files - \
                 the disc may be unreadable. Please clean the disc and try again."
                .to_string(),
            RipError::NonZeroExit { .. } => "Ripping failed. Check folder permissions, free disk space \
                 and drive access."
                .to_string(),
            RipError::OutputDirectory { .. } | RipError::NotWritable { .. } => {
                "The rip folder is not writable. Check folder permissions and free disk space."
                    .to_string()
            }
        }
    }

    /// Whether the failure points at the disc rather than the environment.
    pub fn is_disc_damage(&self) -> bool {
        matches!(self, RipError::ReadError { .. })
    }
}

/// Where and how to rip.
#[derive(Debug, Clone)]
pub struct RipSettings {
    pub ripper: String,
    pub disc_slot: u32,
    pub temp_root: PathBuf,
    pub create_subfolder: bool,
    pub titles_to_rip: u32,
}

/// Intermediate files of one disc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RipOutput {
    /// Non-empty intermediate files, sorted by path
    pub files: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub created_subfolder: bool,
}

/// Ownership/permission snapshot used for troubleshooting failed rips.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub directory: PathBuf,
    /// `(uid, gid, mode)` of the directory when it could be read
    pub directory_owner: Option<(u32, u32, u32)>,
    /// `name size uid:gid mode` lines
    pub listing: Vec<String>,
    pub process_uid: u32,
    pub process_gid: u32,
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "output directory: {}", self.directory.display())?;
        match self.directory_owner {
            Some((uid, gid, mode)) => writeln!(f, "directory owner: uid={uid} gid={gid} mode={mode:o}")?,
            None => writeln!(f, "directory owner: unavailable")?,
        }
        writeln!(f, "process: uid={} gid={}", self.process_uid, self.process_gid)?;
        if self.listing.is_empty() {
            write!(f, "directory listing: (empty)")
        } else {
            write!(f, "directory listing:\n  {}", self.listing.join("\n  "))
        }
    }
}

/// Effective uid/gid of this process.
pub fn effective_ids() -> (u32, u32) {
    // SAFETY: geteuid/getegid have no preconditions and cannot fail.
    unsafe { (libc::geteuid(), libc::getegid()) }
}

/// Owner a directory should be handed to when running elevated through sudo.
///
/// Returns `None` unless the process is root and `SUDO_UID` names the
/// invoking user; the group falls back to the current gid.
pub fn invoking_user_owner(
    euid: u32,
    egid: u32,
    sudo_uid: Option<&str>,
    sudo_gid: Option<&str>,
) -> Option<(u32, u32)> {
    if euid != 0 {
        return None;
    }
    let uid = sudo_uid?.trim().parse::<u32>().ok()?;
    let gid = sudo_gid
        .and_then(|g| g.trim().parse::<u32>().ok())
        .unwrap_or(egid);
    Some((uid, gid))
}

/// Write-then-delete probe; permission bits alone can be misleading.
pub fn probe_writable(dir: &Path) -> bool {
    let probe = dir.join(format!(".write-test-{}", Uuid::new_v4()));
    match fs::write(&probe, b"test") {
        Ok(()) => fs::remove_file(&probe).is_ok(),
        Err(_) => false,
    }
}

/// Create the directory, open it up to everyone and re-own it to the
/// invoking user when elevated, then prove it is writable.
pub fn prepare_output_dir(path: &Path) -> Result<(), RipError> {
    if !path.exists() {
        info!(path = %path.display(), "creating output directory");
        fs::create_dir_all(path).map_err(|source| RipError::OutputDirectory {
            path: path.to_path_buf(),
            source,
        })?;
    }

    if let Ok(meta) = fs::metadata(path) {
        info!(
            path = %path.display(),
            uid = meta.uid(),
            gid = meta.gid(),
            mode = %format!("{:o}", meta.mode()),
            "output directory before permission changes"
        );
    }

    let (euid, egid) = effective_ids();
    let sudo_uid = std::env::var("SUDO_UID").ok();
    let sudo_gid = std::env::var("SUDO_GID").ok();
    let (uid, gid) = match invoking_user_owner(euid, egid, sudo_uid.as_deref(), sudo_gid.as_deref()) {
        Some(owner) => {
            info!(uid = owner.0, gid = owner.1, "running elevated via sudo; handing directory to invoking user");
            owner
        }
        None => (euid, egid),
    };

    if let Err(e) = std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
        warn!(path = %path.display(), error = %e, "failed to change directory owner");
    }
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o777)) {
        warn!(path = %path.display(), error = %e, "failed to change directory mode");
    }

    if !probe_writable(path) {
        return Err(RipError::NotWritable {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Snapshot of directory ownership and contents.
pub fn collect_diagnostics(dir: &Path) -> Diagnostics {
    let (process_uid, process_gid) = effective_ids();
    let directory_owner = fs::metadata(dir)
        .ok()
        .map(|m| (m.uid(), m.gid(), m.mode()));

    let mut listing: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|entry| {
                    let meta = entry.metadata().ok()?;
                    Some(format!(
                        "{} {} {}:{} {:o}",
                        entry.file_name().to_string_lossy(),
                        meta.len(),
                        meta.uid(),
                        meta.gid(),
                        meta.mode()
                    ))
                })
                .collect()
        })
        .unwrap_or_default();
    listing.sort();

    Diagnostics {
        directory: dir.to_path_buf(),
        directory_owner,
        listing,
        process_uid,
        process_gid,
    }
}

/// Non-empty intermediate files directly inside `dir`, sorted by path.
/// Zero-byte leftovers are deleted.
pub fn collect_intermediates(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || !is_intermediate(&path) {
            continue;
        }
        if fs::metadata(&path)?.len() == 0 {
            warn!(path = %path.display(), "discarding empty intermediate file");
            let _ = fs::remove_file(&path);
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

/// Whether the path has the intermediate container extension (case-insensitive).
pub fn is_intermediate(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(INTERMEDIATE_EXTENSION))
        .unwrap_or(false)
}

/// Drives the ripping tool for one disc.
#[derive(Clone)]
pub struct RipPipeline {
    runner: Arc<dyn CommandRunner>,
    settings: RipSettings,
}

impl RipPipeline {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: RipSettings) -> Self {
        Self { runner, settings }
    }

    pub fn settings(&self) -> &RipSettings {
        &self.settings
    }

    /// `temp_root/<disc name>` or `temp_root`, per configuration.
    pub fn output_dir_for(&self, disc: &DiscInfo) -> PathBuf {
        if self.settings.create_subfolder {
            self.settings.temp_root.join(&disc.name)
        } else {
            self.settings.temp_root.clone()
        }
    }

    pub fn rip_command(&self, title_index: u32, output_dir: &Path) -> CommandSpec {
        CommandSpec::new(&self.settings.ripper)
            .args(["-r", "mkv"])
            .arg(format!("disc:{}", self.settings.disc_slot))
            .arg(title_index.to_string())
            .arg(output_dir.to_string_lossy())
            .relaxed_umask()
    }

    pub async fn rip(&self, disc: &DiscInfo) -> Result<RipOutput, RipError> {
        let output_dir = self.output_dir_for(disc);
        prepare_output_dir(&output_dir)?;
        info!(path = %output_dir.display(), "output directory is writable");

        let selected = disc.selected_titles(self.settings.titles_to_rip);
        if selected.is_empty() {
            info!(disc = %disc.name, "no titles meet the minimum length; skipping rip");
            return Ok(RipOutput {
                files: Vec::new(),
                output_dir,
                created_subfolder: self.settings.create_subfolder,
            });
        }

        info!(
            disc = %disc.name,
            qualifying = disc.title_count,
            ripping = selected.len(),
            path = %output_dir.display(),
            "ripping disc"
        );
        for (n, title) in selected.iter().enumerate() {
            info!(
                "  {}. title {} - duration {}",
                n + 1,
                title.index,
                title.duration_formatted
            );
        }

        for title in selected {
            self.rip_title(title.index, &output_dir).await?;
        }

        let files = collect_intermediates(&output_dir).map_err(|source| RipError::OutputDirectory {
            path: output_dir.clone(),
            source,
        })?;
        if files.is_empty() {
            warn!(
                path = %output_dir.display(),
                "ripping tool reported success but created no files; possible read error"
            );
            return Err(RipError::NoOutputProduced { path: output_dir });
        }
        if files.len() != selected.len() {
            warn!(
                expected = selected.len(),
                produced = files.len(),
                "intermediate file count differs from selected titles"
            );
        }

        Ok(RipOutput {
            files,
            output_dir,
            created_subfolder: self.settings.create_subfolder,
        })
    }

    async fn rip_title(&self, title: u32, output_dir: &Path) -> Result<(), RipError> {
        let spec = self.rip_command(title, output_dir);
        info!(command = %spec.display(), "starting ripping tool");

        let mut process = self.runner.spawn(&spec).map_err(RipError::ToolStartFailure)?;
        let mut has_read_errors = false;
        let mut read_error_output = String::new();
        let mut last_percent = None;
        let mut exit_code = None;

        while let Some(event) = process.next_event().await {
            match event {
                ProcessEvent::Stdout(line) => {
                    if let Some(percent) = parse_progress(&line) {
                        if last_percent != Some(percent) {
                            last_percent = Some(percent);
                            info!(title, percent, "rip progress");
                        }
                    }
                    if let Some(message) = parse_message(&line) {
                        info!(title, "{}", message);
                    }
                    if indicates_read_error(&line) {
                        has_read_errors = true;
                        read_error_output.push_str(&line);
                        read_error_output.push('\n');
                    }
                }
                ProcessEvent::Stderr(line) => {
                    warn!(title, "ripping tool: {}", line);
                    if indicates_read_error(&line) {
                        has_read_errors = true;
                        read_error_output.push_str(&line);
                        read_error_output.push('\n');
                    }
                }
                ProcessEvent::Exited(code) => {
                    exit_code = code;
                    break;
                }
            }
        }

        if exit_code == Some(0) {
            info!(title, "title ripped");
            return Ok(());
        }

        error!(title, exit_code = ?exit_code, "ripping tool failed");
        if has_read_errors {
            log_read_error_guidance();
            return Err(RipError::ReadError {
                title,
                detail: read_error_output,
            });
        }
        if exit_code == Some(EXIT_COMMAND_NOT_FOUND) {
            return Err(RipError::ToolNotFound {
                program: self.settings.ripper.clone(),
            });
        }

        let diagnostics = collect_diagnostics(output_dir);
        error!("diagnostic information:\n{}", diagnostics);
        error!(
            "troubleshooting: ensure the directory is writable (mode 777), \
             check free disk space, and verify the tool can access the drive"
        );
        Err(RipError::NonZeroExit {
            title,
            exit_code,
            diagnostics,
        })
    }
}

fn log_read_error_guidance() {
    error!("disc read error detected: the disc appears scratched, damaged or unreadable");
    error!("common causes: scratches or fingerprints, disc rot, region-locked disc, dirty drive");
    error!(
        "suggestions: clean the disc from the center outward, try another drive, \
         check the disc in a player, clean the drive lens"
    );
}
