//! Startup recovery of work left behind by an interrupted run.
//!
//! Any intermediate file still under the temp root is a pending transcode.
//! Zero-byte final outputs are leftovers of a transcode that died before
//! writing anything and are deleted so they do not shadow a retry.

use crate::notify::{Notification, NotificationSink};
use crate::rip::is_intermediate;
use crate::transcode::{display_name, humanize, output_filename, TranscodeJob, TranscodePipeline};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Error type for recovery operations
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("could not create output directory {}: {source}", path.display())]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Zero-byte final outputs removed
    pub deleted_empty: usize,
    /// Orphans transcoded successfully
    pub resumed: usize,
    /// Orphans whose final output already existed; their intermediates are deleted
    pub skipped: usize,
    pub failed: usize,
}

/// Remove zero-byte final outputs directly inside `final_dir`.
pub fn delete_zero_byte_outputs(final_dir: &Path, extension: &str) -> usize {
    let entries = match fs::read_dir(final_dir) {
        Ok(entries) => entries,
        Err(_) => {
            info!(path = %final_dir.display(), "output folder does not exist yet; nothing to clean");
            return 0;
        }
    };

    let mut deleted = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let matches_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(extension))
            .unwrap_or(false);
        if !matches_ext {
            continue;
        }
        match entry.metadata() {
            Ok(meta) if meta.is_file() && meta.len() == 0 => match fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "deleted zero-byte output");
                    deleted += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to delete zero-byte output"),
            },
            Ok(_) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to stat output"),
        }
    }
    deleted
}

/// Intermediate files anywhere under `temp_root`, sorted by path.
/// Hidden directories are not descended into.
pub fn find_orphans(temp_root: &Path) -> Vec<PathBuf> {
    if !temp_root.exists() {
        return Vec::new();
    }

    let walker = WalkDir::new(temp_root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.file_type().is_dir() && entry.depth() > 0 {
                if let Some(name) = entry.file_name().to_str() {
                    return !name.starts_with('.');
                }
            }
            true
        });

    let mut orphans: Vec<PathBuf> = walker
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file() && is_intermediate(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    orphans.sort();
    orphans
}

/// Display name for an orphan: its folder's name, or the file's own stem
/// when it sits directly in the temp root.
pub fn orphan_display_base(orphan: &Path, temp_root: &Path) -> String {
    let parent = orphan.parent();
    let raw = match parent {
        Some(dir) if dir != temp_root => dir.file_name(),
        _ => orphan.file_stem(),
    };
    humanize(&raw.map(|s| s.to_string_lossy().into_owned()).unwrap_or_default())
}

/// Turn orphans into transcode jobs, numbering parts per display name the
/// same way a fresh rip would.
pub fn plan_recovery(
    orphans: &[PathBuf],
    temp_root: &Path,
    final_dir: &Path,
    extension: &str,
) -> Vec<TranscodeJob> {
    let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for orphan in orphans {
        groups
            .entry(orphan_display_base(orphan, temp_root))
            .or_default()
            .push(orphan.clone());
    }

    let mut jobs = Vec::new();
    for (base, mut files) in groups {
        files.sort();
        let total = files.len();
        for (index, input) in files.into_iter().enumerate() {
            jobs.push(TranscodeJob {
                input,
                output_dir: final_dir.to_path_buf(),
                output_filename: output_filename(&base, index, total, extension),
                display_name: display_name(&base, index, total),
                cleanup_source: true,
            });
        }
    }
    jobs
}

/// Runs the recovery pass against the temp root and the final folder.
pub struct OrphanRecovery {
    transcoder: TranscodePipeline,
    notifier: Arc<dyn NotificationSink>,
    final_dir: PathBuf,
}

impl OrphanRecovery {
    pub fn new(
        transcoder: TranscodePipeline,
        notifier: Arc<dyn NotificationSink>,
        final_dir: PathBuf,
    ) -> Self {
        Self {
            transcoder,
            notifier,
            final_dir,
        }
    }

    pub async fn run(&self) -> Result<RecoveryReport, RecoveryError> {
        let extension = self.transcoder.profile().extension.clone();
        let mut report = RecoveryReport {
            deleted_empty: delete_zero_byte_outputs(&self.final_dir, &extension),
            ..Default::default()
        };

        let temp_root = self.transcoder.temp_root().to_path_buf();
        let orphans = find_orphans(&temp_root);
        if orphans.is_empty() {
            info!("no unfinished discs found");
            return Ok(report);
        }
        info!(count = orphans.len(), "found unfinished intermediate files");
        for orphan in &orphans {
            info!("  - {}", orphan.display());
        }

        fs::create_dir_all(&self.final_dir).map_err(|source| RecoveryError::OutputDirectory {
            path: self.final_dir.clone(),
            source,
        })?;

        let jobs = plan_recovery(&orphans, &temp_root, &self.final_dir, &extension);
        let total = jobs.len();
        for (n, job) in jobs.iter().enumerate() {
            let target = job.output_path();
            if target.exists() {
                info!(
                    input = %job.input.display(),
                    output = %target.display(),
                    "skipping orphan; final output already exists"
                );
                // A kept orphan would be renumbered on the next pass
                if job.cleanup_source {
                    self.transcoder.remove_source(&job.input);
                }
                report.skipped += 1;
                continue;
            }

            info!("resuming {}/{}: {}", n + 1, total, job.input.display());
            self.notifier.notify(Notification::info(
                "Resuming Compression",
                format!("Converting \"{}\"", job.display_name),
            ));
            match self.transcoder.transcode(job).await {
                Ok(path) => {
                    report.resumed += 1;
                    info!(output = %path.display(), "recovered orphan");
                    self.notifier.notify(Notification::success(
                        "Compression Complete",
                        format!("\"{}\" is now ready to stream", job.display_name),
                    ));
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(input = %job.input.display(), error = %e, "failed to recover orphan");
                    self.notifier.notify(Notification::error(
                        "Compression Failed",
                        format!("Failed to convert \"{}\": {}", job.display_name, e.user_message()),
                    ));
                }
            }
        }

        info!(
            resumed = report.resumed,
            skipped = report.skipped,
            failed = report.failed,
            deleted_empty = report.deleted_empty,
            "finished processing unfinished discs"
        );
        Ok(report)
    }
}
