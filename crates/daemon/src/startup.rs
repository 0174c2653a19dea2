//! Preflight checks run before the daemon starts polling.
//!
//! - Temp and video folders exist and pass a real write probe
//! - The ripping tool and the transcoder can be started
//! - Process identity is logged (ownership problems are the most common
//!   deployment failure)

use crate::process::{run_to_completion, CommandRunner, CommandSpec, EXIT_COMMAND_NOT_FOUND};
use crate::rip::{effective_ids, probe_writable};
use disc_ripper_config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("could not create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("directory {} is not writable", path.display())]
    NotWritable { path: PathBuf },
}

/// Log uid/gid and the sudo context the process was started with.
pub fn log_process_identity() {
    let (uid, gid) = effective_ids();
    let sudo_uid = std::env::var("SUDO_UID").unwrap_or_else(|_| "not set".to_string());
    let sudo_gid = std::env::var("SUDO_GID").unwrap_or_else(|_| "not set".to_string());
    let user = std::env::var("USER").unwrap_or_default();
    let home = std::env::var("HOME").unwrap_or_default();
    info!(uid, gid, user = %user, home = %home, "process identity");
    info!(sudo_uid = %sudo_uid, sudo_gid = %sudo_gid, "sudo context");
}

/// Create `path` if missing and prove it is writable.
pub fn ensure_writable_dir(path: &Path) -> Result<(), StartupError> {
    if !path.exists() {
        info!(path = %path.display(), "creating folder");
        fs::create_dir_all(path).map_err(|source| StartupError::CreateDir {
            path: path.to_path_buf(),
            source,
        })?;
    }

    if !probe_writable(path) {
        error!(path = %path.display(), "folder is not writable; check permissions and service user");
        return Err(StartupError::NotWritable {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Parse the major version from `ffmpeg -version` output.
///
/// Handles both release (`8.0`) and git (`n8.0-...`) version strings.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(['.', '-']).next()?;
    major_str.parse().ok()
}

/// Verify a tool can be started. Only a failure to launch counts; tools
/// disagree on the exit code of their version flag.
pub async fn check_tool_available(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
) -> Result<String, StartupError> {
    let output = run_to_completion(runner, spec)
        .await
        .map_err(|e| StartupError::ToolUnavailable {
            tool: spec.program.clone(),
            reason: format!("{e}; is it installed and on PATH?"),
        })?;

    if output.exit_code == Some(EXIT_COMMAND_NOT_FOUND) {
        return Err(StartupError::ToolUnavailable {
            tool: spec.program.clone(),
            reason: "command not found".to_string(),
        });
    }
    Ok(output.combined())
}

/// Run all startup checks in order: folders, then tools.
pub async fn run_startup_checks(cfg: &Config, runner: &dyn CommandRunner) -> Result<(), StartupError> {
    info!("testing directory permissions");
    ensure_writable_dir(&cfg.paths.temp_dir)?;
    ensure_writable_dir(&cfg.final_output_dir())?;

    check_tool_available(runner, &CommandSpec::new(&cfg.tools.ripper).arg("--version")).await?;

    let ffmpeg_output =
        check_tool_available(runner, &CommandSpec::new(&cfg.tools.transcoder).arg("-version")).await?;
    match parse_ffmpeg_version(&ffmpeg_output) {
        Some(major) => info!(major, "transcoder version"),
        None => warn!("could not determine transcoder version"),
    }

    Ok(())
}
