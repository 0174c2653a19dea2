//! Disc inspection: scan the disc, rank its titles and name it.

use crate::makemkv::{parse_disc_name, parse_title_records, TitleRecord};
use crate::process::{run_to_completion, CommandRunner, CommandSpec, ProcessError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};

static UNSAFE_NAME_CHARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_\s-]").unwrap());
static WHITESPACE_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Error type for disc scans
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("could not run disc scan: {0}")]
    Spawn(#[from] ProcessError),

    #[error("disc scan exited with code {exit_code:?}: {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
}

/// A selectable track on the disc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Title {
    /// Tool-assigned title index
    pub index: u32,
    pub duration_secs: u64,
    /// `HH:MM:SS`
    pub duration_formatted: String,
}

impl Title {
    pub fn new(index: u32, duration_secs: u64) -> Self {
        Self {
            index,
            duration_secs,
            duration_formatted: format_duration(duration_secs),
        }
    }
}

/// Result of inspecting a disc. Titles are filtered by minimum length and
/// ordered longest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscInfo {
    /// Sanitized disc identifier
    pub name: String,
    pub titles: Vec<Title>,
    pub title_count: usize,
}

impl DiscInfo {
    /// Rank raw title records: stable sort by duration descending, then drop
    /// titles shorter than `min_title_length_secs`.
    pub fn from_records(raw_name: &str, records: &[TitleRecord], min_title_length_secs: u64) -> Self {
        let mut titles: Vec<Title> = records
            .iter()
            .map(|r| Title::new(r.index, r.duration_secs))
            .collect();
        titles.sort_by(|a, b| b.duration_secs.cmp(&a.duration_secs));
        titles.retain(|t| t.duration_secs >= min_title_length_secs);

        Self {
            name: sanitize_name(raw_name),
            title_count: titles.len(),
            titles,
        }
    }

    /// The first `min(titles_to_rip, title_count)` titles.
    pub fn selected_titles(&self, titles_to_rip: u32) -> &[Title] {
        let count = (titles_to_rip as usize).min(self.title_count);
        &self.titles[..count]
    }
}

/// `H:MM:SS`-style duration padded to `HH:MM:SS`.
pub fn format_duration(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Replace characters outside `[word, whitespace, hyphen]` with `_`, then
/// collapse whitespace runs to `_`.
pub fn sanitize_name(name: &str) -> String {
    let replaced = UNSAFE_NAME_CHARS_RE.replace_all(name, "_");
    WHITESPACE_RUN_RE.replace_all(&replaced, "_").into_owned()
}

fn fallback_disc_name() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("Disc_{}", millis)
}

/// Runs the ripping tool's scan mode against the drive.
#[derive(Clone)]
pub struct DiscInspector {
    runner: Arc<dyn CommandRunner>,
    ripper: String,
    disc_slot: u32,
    min_title_length_secs: u64,
}

impl DiscInspector {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        ripper: impl Into<String>,
        disc_slot: u32,
        min_title_length_secs: u64,
    ) -> Self {
        Self {
            runner,
            ripper: ripper.into(),
            disc_slot,
            min_title_length_secs,
        }
    }

    pub fn scan_command(&self) -> CommandSpec {
        CommandSpec::new(&self.ripper)
            .args(["-r", "info"])
            .arg(format!("disc:{}", self.disc_slot))
    }

    pub async fn inspect(&self) -> Result<DiscInfo, ScanError> {
        info!(slot = self.disc_slot, "scanning disc");
        let output = run_to_completion(self.runner.as_ref(), &self.scan_command()).await?;

        if !output.success() {
            return Err(ScanError::Failed {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        let raw_name = parse_disc_name(&output.stdout).unwrap_or_else(|| {
            let name = fallback_disc_name();
            warn!(fallback = %name, "disc name missing from scan output");
            name
        });
        let records = parse_title_records(&output.stdout);
        let disc = DiscInfo::from_records(&raw_name, &records, self.min_title_length_secs);

        info!(
            disc = %disc.name,
            scanned = records.len(),
            qualifying = disc.title_count,
            min_length_secs = self.min_title_length_secs,
            "disc scan complete"
        );
        Ok(disc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{ScriptedRun, ScriptedRunner};
    use proptest::prelude::*;

    fn record(index: u32, duration_secs: u64) -> TitleRecord {
        TitleRecord { index, duration_secs }
    }

    #[test]
    fn test_duration_filter_and_ordering() {
        let records = [record(0, 120), record(1, 600), record(2, 45), record(3, 900)];
        let disc = DiscInfo::from_records("DISC", &records, 300);

        let durations: Vec<u64> = disc.titles.iter().map(|t| t.duration_secs).collect();
        assert_eq!(durations, vec![900, 600]);
        assert_eq!(disc.title_count, 2);
        assert_eq!(disc.titles[0].index, 3);
        assert_eq!(disc.titles[1].index, 1);
    }

    #[test]
    fn test_ties_keep_emission_order() {
        let records = [record(4, 600), record(1, 900), record(2, 600), record(0, 600)];
        let disc = DiscInfo::from_records("DISC", &records, 0);
        let indices: Vec<u32> = disc.titles.iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![1, 4, 2, 0]);
    }

    #[test]
    fn test_selected_titles_is_bounded_prefix() {
        let records = [record(0, 1000), record(1, 2000), record(2, 3000)];
        let disc = DiscInfo::from_records("DISC", &records, 300);

        assert_eq!(disc.selected_titles(1).len(), 1);
        assert_eq!(disc.selected_titles(1)[0].index, 2);
        assert_eq!(disc.selected_titles(10).len(), 3);
        assert!(disc.selected_titles(0).is_empty());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("HOW_TO_TRAIN_YOUR_DRAGON"), "HOW_TO_TRAIN_YOUR_DRAGON");
        assert_eq!(sanitize_name("Star Wars: Episode IV"), "Star_Wars__Episode_IV");
        assert_eq!(sanitize_name("a  b\tc"), "a_b_c");
        assert_eq!(sanitize_name("some-disc/../x"), "some-disc____x");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00:00");
        assert_eq!(format_duration(5892), "01:38:12");
        assert_eq!(format_duration(36_000), "10:00:00");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_titles_sorted_and_filtered(
            durations in proptest::collection::vec(0u64..20_000, 0..30),
            min_len in 0u64..10_000,
        ) {
            let records: Vec<TitleRecord> = durations
                .iter()
                .enumerate()
                .map(|(i, d)| record(i as u32, *d))
                .collect();
            let disc = DiscInfo::from_records("X", &records, min_len);

            prop_assert_eq!(disc.title_count, disc.titles.len());
            prop_assert_eq!(
                disc.title_count,
                durations.iter().filter(|d| **d >= min_len).count()
            );
            prop_assert!(disc.titles.iter().all(|t| t.duration_secs >= min_len));
            prop_assert!(disc.titles.windows(2).all(|w| w[0].duration_secs >= w[1].duration_secs));
        }

        #[test]
        fn prop_sanitized_names_are_path_safe(name in ".{0,40}") {
            let sanitized = sanitize_name(&name);
            prop_assert!(!sanitized.contains('/'));
            prop_assert!(!sanitized.chars().any(char::is_whitespace));
        }
    }

    #[tokio::test]
    async fn test_inspect_parses_scan_output() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            Ok(ScriptedRun::ok().stdout(
                "CINFO:2,0,\"My Movie: Special\"\n\
                 TINFO:0,9,0,\"0:02:00\"\n\
                 TINFO:1,9,0,\"0:10:00\"\n\
                 TINFO:2,9,0,\"0:00:45\"\n\
                 TINFO:3,9,0,\"0:15:00\"\n",
            ))
        }));
        let inspector = DiscInspector::new(runner.clone(), "makemkvcon", 0, 300);

        let disc = inspector.inspect().await.unwrap();
        assert_eq!(disc.name, "My_Movie__Special");
        assert_eq!(disc.title_count, 2);
        assert_eq!(disc.titles[0].duration_formatted, "00:15:00");

        let calls = runner.calls();
        assert_eq!(calls[0].args, vec!["-r", "info", "disc:0"]);
    }

    #[tokio::test]
    async fn test_inspect_nonzero_exit_is_scan_error() {
        let runner = Arc::new(ScriptedRunner::new(|_| Ok(ScriptedRun::exit(1).stderr("no disc"))));
        let inspector = DiscInspector::new(runner, "makemkvcon", 0, 300);

        match inspector.inspect().await {
            Err(ScanError::Failed { exit_code, stderr }) => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(stderr, "no disc");
            }
            other => panic!("expected scan failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inspect_missing_tool_is_scan_error() {
        let runner = Arc::new(ScriptedRunner::new(|_| Err(std::io::ErrorKind::NotFound.into())));
        let inspector = DiscInspector::new(runner, "makemkvcon", 0, 300);
        assert!(matches!(inspector.inspect().await, Err(ScanError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_inspect_without_name_uses_fallback() {
        let runner = Arc::new(ScriptedRunner::new(|_| Ok(ScriptedRun::ok().stdout("TCOUNT:0"))));
        let inspector = DiscInspector::new(runner, "makemkvcon", 0, 300);

        let disc = inspector.inspect().await.unwrap();
        assert!(disc.name.starts_with("Disc_"));
        assert_eq!(disc.title_count, 0);
    }
}
