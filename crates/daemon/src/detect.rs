//! Media presence detection for the optical drive.
//!
//! No single OS tool reports disc presence reliably across drivers, so a
//! fixed cascade of probes is tried in order. A probe that fails to run,
//! exits nonzero or prints nothing recognisable is inconclusive and the
//! next probe is tried. If every probe is inconclusive the drive is empty.

use crate::process::{run_to_completion, CommandRunner, CommandSpec};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::debug;

static UDISKS_PRESENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"optical|MediaAvailable:\s*true|Media:").unwrap());
static UDEVADM_PRESENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ID_CDROM_MEDIA=(1|true)|ID_FS_LABEL=|ID_FS_TYPE=").unwrap());
static FILE_SNIFF_PRESENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ISO 9660|ISO9660|filesystem|FAT|NTFS|ext[234]").unwrap());

/// One OS-level presence probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// `udisksctl info -b <device>`
    BlockDeviceInfo,
    /// `udevadm info -q property -n <device>`
    DeviceProperties,
    /// `blkid <device>`
    FilesystemSignature,
    /// `file -s <device>`
    FileTypeSniff,
}

impl Probe {
    /// Probes in the order they are tried.
    pub const CASCADE: [Probe; 4] = [
        Probe::BlockDeviceInfo,
        Probe::DeviceProperties,
        Probe::FilesystemSignature,
        Probe::FileTypeSniff,
    ];

    pub fn command(&self, device: &str) -> CommandSpec {
        match self {
            Probe::BlockDeviceInfo => CommandSpec::new("udisksctl").args(["info", "-b", device]),
            Probe::DeviceProperties => {
                CommandSpec::new("udevadm").args(["info", "-q", "property", "-n", device])
            }
            Probe::FilesystemSignature => CommandSpec::new("blkid").arg(device),
            Probe::FileTypeSniff => CommandSpec::new("file").args(["-s", device]),
        }
    }

    /// Whether the probe's stdout indicates a disc in the drive.
    pub fn indicates_presence(&self, stdout: &str) -> bool {
        match self {
            Probe::BlockDeviceInfo => UDISKS_PRESENT_RE.is_match(stdout),
            Probe::DeviceProperties => UDEVADM_PRESENT_RE.is_match(stdout),
            // blkid only prints anything when it finds a filesystem
            Probe::FilesystemSignature => !stdout.trim().is_empty(),
            Probe::FileTypeSniff => FILE_SNIFF_PRESENT_RE.is_match(stdout),
        }
    }
}

impl std::fmt::Display for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Probe::BlockDeviceInfo => write!(f, "udisksctl"),
            Probe::DeviceProperties => write!(f, "udevadm"),
            Probe::FilesystemSignature => write!(f, "blkid"),
            Probe::FileTypeSniff => write!(f, "file -s"),
        }
    }
}

/// Decides whether a disc is loaded in the drive.
#[derive(Clone)]
pub struct MediaDetector {
    runner: Arc<dyn CommandRunner>,
}

impl MediaDetector {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Never fails: probe errors fall through to the next probe and an
    /// entirely inconclusive cascade reports no disc.
    pub async fn is_disc_present(&self, device: &str) -> bool {
        for probe in Probe::CASCADE {
            let output = match run_to_completion(self.runner.as_ref(), &probe.command(device)).await {
                Ok(output) => output,
                Err(e) => {
                    debug!(probe = %probe, error = %e, "presence probe unavailable");
                    continue;
                }
            };

            if !output.success() {
                debug!(
                    probe = %probe,
                    exit_code = ?output.exit_code,
                    stderr = %output.stderr.trim(),
                    "presence probe failed"
                );
                continue;
            }

            if probe.indicates_presence(&output.stdout) {
                debug!(probe = %probe, device = %device, "disc present");
                return true;
            }
        }

        false
    }
}
