//! Transcoding of intermediate files into the distribution format.
//!
//! Audio settings are fixed for broad playback compatibility (AAC-LC,
//! 192 kbit/s, 48 kHz) and the container is written with the index up
//! front so playback can start before the file is fully downloaded.

use crate::process::{CommandRunner, CommandSpec, ProcessError, ProcessEvent, EXIT_COMMAND_NOT_FOUND};
use disc_ripper_config::Config;
use regex::Regex;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::{info, warn};

static ELAPSED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=(\d+:\d+:\d+\.\d+)").unwrap());
static SEPARATOR_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[_-]+").unwrap());

const AUDIO_BITRATE: &str = "192k";
const AUDIO_PROFILE: &str = "aac_low";
const AUDIO_SAMPLE_RATE: &str = "48000";
const FAST_START: &str = "+faststart";

/// Lines of transcoder diagnostics kept for failure reports.
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// Error type for transcode operations
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("transcoder could not be started: {0}")]
    ToolStartFailure(#[source] ProcessError),

    #[error("transcoder exited with code {exit_code:?}: {diagnostics}")]
    ToolFailure {
        exit_code: Option<i32>,
        diagnostics: String,
    },

    /// Exit code 0 but a zero-byte file: the transcoder failed silently
    #[error("transcoder created an empty output file {}", path.display())]
    EmptyOutput { path: PathBuf },

    #[error("transcoder completed but output file {} was not created", path.display())]
    OutputNotFound { path: PathBuf },
}

impl TranscodeError {
    pub fn user_message(&self) -> String {
        match self {
            TranscodeError::ToolStartFailure(e) if e.is_not_found() => {
                "The transcoder is not installed or not on PATH.".to_string()
            }
            TranscodeError::ToolFailure {
                exit_code: Some(EXIT_COMMAND_NOT_FOUND),
                ..
            } => "The transcoder is not installed or not on PATH.".to_string(),
            TranscodeError::ToolStartFailure(_) | TranscodeError::ToolFailure { .. } => {
                "Compression failed. Check the logs for details.".to_string()
            }
            TranscodeError::EmptyOutput { .. } => {
                "Compression produced an empty file. Check free disk space.".to_string()
            }
            TranscodeError::OutputNotFound { .. } => {
                "Compression finished but no output file was created. Check folder permissions."
                    .to_string()
            }
        }
    }
}

/// Codec and quality parameters for the transcoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeProfile {
    pub transcoder: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub preset: String,
    pub crf: u32,
    /// Output extension without the dot
    pub extension: String,
}

impl TranscodeProfile {
    pub fn from_config(config: &Config) -> Self {
        Self {
            transcoder: config.tools.transcoder.clone(),
            video_codec: config.transcode.video_codec.clone(),
            audio_codec: config.transcode.audio_codec.clone(),
            preset: config.transcode.preset.clone(),
            crf: config.transcode.crf,
            extension: config.transcode.output_extension.clone(),
        }
    }
}

/// Build the transcoder invocation for one file.
///
/// The output is overwritten if it exists; a previous partial attempt is
/// never worth keeping.
pub fn build_transcode_command(profile: &TranscodeProfile, input: &Path, output: &Path) -> CommandSpec {
    CommandSpec::new(&profile.transcoder)
        .arg("-i")
        .arg(input.to_string_lossy())
        .args(["-c:v", profile.video_codec.as_str()])
        .args(["-preset", profile.preset.as_str()])
        .arg("-crf")
        .arg(profile.crf.to_string())
        .args(["-c:a", profile.audio_codec.as_str()])
        .args(["-b:a", AUDIO_BITRATE])
        .args(["-profile:a", AUDIO_PROFILE])
        .args(["-ar", AUDIO_SAMPLE_RATE])
        .args(["-movflags", FAST_START])
        .arg("-y")
        .arg(output.to_string_lossy())
}

/// Elapsed-time marker from a transcoder diagnostic line.
pub fn parse_elapsed(line: &str) -> Option<&str> {
    ELAPSED_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// `HOW_TO_TRAIN_YOUR_DRAGON` -> `How To Train Your Dragon`
pub fn humanize(name: &str) -> String {
    let spaced = SEPARATOR_RUN_RE.replace_all(name, " ");
    spaced
        .trim()
        .to_lowercase()
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Display name of output `index` (0-based) out of `total`.
///
/// A single output carries the bare name; several are suffixed
/// ` - Part N`, zero-padded to two digits once there are more than nine.
pub fn display_name(base: &str, index: usize, total: usize) -> String {
    if total <= 1 {
        return base.to_string();
    }
    let width = if total > 9 { 2 } else { 1 };
    format!("{} - Part {:0width$}", base, index + 1, width = width)
}

pub fn output_filename(base: &str, index: usize, total: usize, extension: &str) -> String {
    format!("{}.{}", display_name(base, index, total), extension)
}

/// One file to transcode.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub output_filename: String,
    pub display_name: String,
    /// Delete the intermediate (and its emptied folder) on success
    pub cleanup_source: bool,
}

impl TranscodeJob {
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(&self.output_filename)
    }
}

/// Runs the transcoder and verifies its output.
#[derive(Clone)]
pub struct TranscodePipeline {
    runner: Arc<dyn CommandRunner>,
    profile: TranscodeProfile,
    temp_root: PathBuf,
}

impl TranscodePipeline {
    pub fn new(runner: Arc<dyn CommandRunner>, profile: TranscodeProfile, temp_root: PathBuf) -> Self {
        Self {
            runner,
            profile,
            temp_root,
        }
    }

    pub fn profile(&self) -> &TranscodeProfile {
        &self.profile
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    pub async fn transcode(&self, job: &TranscodeJob) -> Result<PathBuf, TranscodeError> {
        let output = job.output_path();
        let spec = build_transcode_command(&self.profile, &job.input, &output);
        info!(
            input = %job.input.display(),
            output = %output.display(),
            "transcoding \"{}\"",
            job.display_name
        );
        info!(command = %spec.display(), "starting transcoder");

        let mut process = self
            .runner
            .spawn(&spec)
            .map_err(TranscodeError::ToolStartFailure)?;

        let mut last_elapsed = String::new();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES);
        let mut exit_code = None;

        while let Some(event) = process.next_event().await {
            match event {
                ProcessEvent::Stderr(line) => {
                    if let Some(elapsed) = parse_elapsed(&line) {
                        if elapsed != last_elapsed {
                            last_elapsed = elapsed.to_string();
                            info!(name = %job.display_name, elapsed = %last_elapsed, "compression progress");
                        }
                    } else {
                        let lower = line.to_lowercase();
                        if lower.contains("error") || lower.contains("invalid") || lower.contains("failed") {
                            warn!("transcoder: {}", line.trim());
                        }
                    }
                    if tail.len() == DIAGNOSTIC_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                ProcessEvent::Stdout(line) => info!("transcoder: {}", line.trim()),
                ProcessEvent::Exited(code) => {
                    exit_code = code;
                    break;
                }
            }
        }

        if exit_code != Some(0) {
            warn!(exit_code = ?exit_code, name = %job.display_name, "transcoder failed");
            return Err(TranscodeError::ToolFailure {
                exit_code,
                diagnostics: Vec::from(tail).join("\n"),
            });
        }

        let size = match fs::metadata(&output) {
            Ok(meta) => meta.len(),
            Err(_) => return Err(TranscodeError::OutputNotFound { path: output }),
        };
        if size == 0 {
            return Err(TranscodeError::EmptyOutput { path: output });
        }
        info!(
            name = %job.display_name,
            size_mb = %format!("{:.2}", size as f64 / 1024.0 / 1024.0),
            "compression completed"
        );

        if job.cleanup_source {
            self.remove_source(&job.input);
        }
        Ok(output)
    }

    /// Delete the intermediate and its folder once empty; the shared temp
    /// root itself is never removed.
    pub(crate) fn remove_source(&self, source: &Path) {
        if let Err(e) = fs::remove_file(source) {
            warn!(path = %source.display(), error = %e, "failed to delete intermediate file");
            return;
        }
        info!(path = %source.display(), "deleted intermediate file");

        let Some(parent) = source.parent() else {
            return;
        };
        if same_dir(parent, &self.temp_root) {
            return;
        }
        let is_empty = fs::read_dir(parent)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty && fs::remove_dir(parent).is_ok() {
            info!(path = %parent.display(), "removed empty directory");
        }
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{ScriptedRun, ScriptedRunner};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn profile() -> TranscodeProfile {
        TranscodeProfile::from_config(&Config::default())
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    /// Fake transcoder writing `contents` to its output argument.
    fn writing_runner(contents: &'static [u8]) -> Arc<ScriptedRunner> {
        Arc::new(ScriptedRunner::new(move |spec| {
            let output = spec.args.last().unwrap();
            fs::write(output, contents).unwrap();
            Ok(ScriptedRun::ok().stderr(
                "frame=  100 fps= 50 time=00:00:04.00 bitrate=1000kbits/s\n\
                 frame=  200 fps= 50 time=00:00:08.00 bitrate=1000kbits/s",
            ))
        }))
    }

    fn job(input: PathBuf, output_dir: &Path, cleanup_source: bool) -> TranscodeJob {
        TranscodeJob {
            input,
            output_dir: output_dir.to_path_buf(),
            output_filename: "Movie.mp4".to_string(),
            display_name: "Movie".to_string(),
            cleanup_source,
        }
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize("HOW_TO_TRAIN_YOUR_DRAGON"), "How To Train Your Dragon");
        assert_eq!(humanize("__the-matrix__"), "The Matrix");
        assert_eq!(humanize("Star_Wars__Episode_IV"), "Star Wars Episode Iv");
        assert_eq!(humanize(""), "");
    }

    #[test]
    fn test_single_title_naming() {
        let base = humanize("HOW_TO_TRAIN_YOUR_DRAGON");
        assert_eq!(output_filename(&base, 0, 1, "mp4"), "How To Train Your Dragon.mp4");
    }

    #[test]
    fn test_multi_title_naming() {
        let base = humanize("HOW_TO_TRAIN_YOUR_DRAGON");
        assert_eq!(
            output_filename(&base, 0, 2, "mp4"),
            "How To Train Your Dragon - Part 1.mp4"
        );
        assert_eq!(
            output_filename(&base, 1, 2, "mp4"),
            "How To Train Your Dragon - Part 2.mp4"
        );
    }

    #[test]
    fn test_part_numbers_padded_past_nine() {
        assert_eq!(display_name("Show", 8, 9), "Show - Part 9");
        assert_eq!(display_name("Show", 0, 10), "Show - Part 01");
        assert_eq!(display_name("Show", 9, 10), "Show - Part 10");
    }

    #[test]
    fn test_parse_elapsed() {
        assert_eq!(
            parse_elapsed("frame= 1 fps=0.0 q=0.0 size=0kB time=01:02:03.45 bitrate=N/A"),
            Some("01:02:03.45")
        );
        assert_eq!(parse_elapsed("Stream mapping:"), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_transcode_command_completeness(
            input in "[a-zA-Z0-9_/.-]{1,50}",
            output in "[a-zA-Z0-9_/.-]{1,50}",
            crf in 0u32..52,
            preset in prop::sample::select(vec!["ultrafast", "fast", "medium", "slow"]),
        ) {
            let mut profile = profile();
            profile.crf = crf;
            profile.preset = preset.to_string();
            let spec = build_transcode_command(&profile, Path::new(&input), Path::new(&output));
            let args = &spec.args;

            prop_assert_eq!(spec.program.as_str(), "ffmpeg");
            prop_assert!(has_flag_with_value(args, "-i", &input));
            prop_assert!(has_flag_with_value(args, "-c:v", "libx264"));
            prop_assert!(has_flag_with_value(args, "-preset", preset));
            prop_assert!(has_flag_with_value(args, "-crf", &crf.to_string()));
            prop_assert!(has_flag_with_value(args, "-c:a", "aac"));
            prop_assert!(has_flag_with_value(args, "-b:a", "192k"));
            prop_assert!(has_flag_with_value(args, "-profile:a", "aac_low"));
            prop_assert!(has_flag_with_value(args, "-ar", "48000"));
            prop_assert!(has_flag_with_value(args, "-movflags", "+faststart"));
            prop_assert!(args.iter().any(|a| a == "-y"));
            prop_assert_eq!(args.last().map(String::as_str), Some(output.as_str()));
            prop_assert!(!spec.relaxed_umask);
        }

        #[test]
        fn prop_part_names_are_distinct(total in 2usize..30) {
            let names: std::collections::HashSet<String> =
                (0..total).map(|i| output_filename("X", i, total, "mp4")).collect();
            prop_assert_eq!(names.len(), total);
        }
    }

    #[tokio::test]
    async fn test_transcode_success_keeps_source_by_default() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("title_t00.mkv");
        fs::write(&input, b"matroska").unwrap();
        let out_dir = tmp.path().join("out");
        fs::create_dir(&out_dir).unwrap();

        let pipeline = TranscodePipeline::new(writing_runner(b"mp4"), profile(), tmp.path().to_path_buf());
        let result = pipeline.transcode(&job(input.clone(), &out_dir, false)).await.unwrap();

        assert_eq!(result, out_dir.join("Movie.mp4"));
        assert!(input.exists());
    }

    #[tokio::test]
    async fn test_cleanup_removes_source_and_empty_disc_folder() {
        let tmp = TempDir::new().unwrap();
        let disc_dir = tmp.path().join("MOVIE");
        fs::create_dir(&disc_dir).unwrap();
        let input = disc_dir.join("title_t00.mkv");
        fs::write(&input, b"matroska").unwrap();
        let out_dir = TempDir::new().unwrap();

        let pipeline = TranscodePipeline::new(writing_runner(b"mp4"), profile(), tmp.path().to_path_buf());
        pipeline.transcode(&job(input.clone(), out_dir.path(), true)).await.unwrap();

        assert!(!input.exists());
        assert!(!disc_dir.exists());
        assert!(tmp.path().exists());
    }

    #[tokio::test]
    async fn test_cleanup_never_removes_temp_root() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("loose.mkv");
        fs::write(&input, b"matroska").unwrap();
        let out_dir = TempDir::new().unwrap();

        let pipeline = TranscodePipeline::new(writing_runner(b"mp4"), profile(), tmp.path().to_path_buf());
        pipeline.transcode(&job(input.clone(), out_dir.path(), true)).await.unwrap();

        assert!(!input.exists());
        assert!(tmp.path().is_dir());
    }

    #[tokio::test]
    async fn test_zero_byte_output_is_failure() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("a.mkv");
        fs::write(&input, b"matroska").unwrap();

        let pipeline = TranscodePipeline::new(writing_runner(b""), profile(), tmp.path().to_path_buf());
        let err = pipeline.transcode(&job(input.clone(), tmp.path(), true)).await.unwrap_err();

        assert!(matches!(err, TranscodeError::EmptyOutput { .. }));
        // Source is kept for a later retry
        assert!(input.exists());
    }

    #[tokio::test]
    async fn test_missing_output_is_failure() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_| Ok(ScriptedRun::ok())));
        let pipeline = TranscodePipeline::new(runner, profile(), tmp.path().to_path_buf());

        let err = pipeline
            .transcode(&job(tmp.path().join("a.mkv"), tmp.path(), false))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::OutputNotFound { .. }));
    }

    #[tokio::test]
    async fn test_nonzero_exit_surfaces_diagnostics() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_| {
            Ok(ScriptedRun::exit(1).stderr("a.mkv: Invalid data found when processing input"))
        }));
        let pipeline = TranscodePipeline::new(runner, profile(), tmp.path().to_path_buf());

        match pipeline.transcode(&job(tmp.path().join("a.mkv"), tmp.path(), false)).await {
            Err(TranscodeError::ToolFailure { exit_code, diagnostics }) => {
                assert_eq!(exit_code, Some(1));
                assert!(diagnostics.contains("Invalid data"));
            }
            other => panic!("expected ToolFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_transcoder() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_| Err(std::io::ErrorKind::NotFound.into())));
        let pipeline = TranscodePipeline::new(runner, profile(), tmp.path().to_path_buf());

        let err = pipeline
            .transcode(&job(tmp.path().join("a.mkv"), tmp.path(), false))
            .await
            .unwrap_err();
        assert!(err.user_message().contains("not installed"));
    }
}
