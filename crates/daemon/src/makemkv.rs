//! Parsers for the ripping tool's robot-mode (`-r`) output.
//!
//! All knowledge of the tool's line format lives here:
//! - `CINFO:2,0,"<name>"` carries the disc name
//! - `TINFO:<title>,9,0,"H:MM:SS"` carries a title's duration
//! - `PRGV:<current>,<total>,<max>` reports progress
//! - `MSG:<code>,<flags>,<count>,"<text>",...` carries status messages

use regex::Regex;
use std::sync::LazyLock;

static DISC_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"CINFO:2,0,"([^"]+)""#).unwrap());
static TITLE_DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"TINFO:(\d+),9,0,"(\d+):(\d+):(\d+)""#).unwrap());
static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"PRGV:(\d+),(\d+),(\d+)").unwrap());
static MESSAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"MSG:(\d+),(\d+),\d+,"([^"]+)""#).unwrap());

/// Substrings the tool prints when the disc cannot be physically read.
pub const READ_ERROR_MARKERS: &[&str] = &[
    "Posix error",
    "No such device",
    "Read error",
    "Scsi error",
    "failed to read",
];

/// A title as reported by the scan, before ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleRecord {
    pub index: u32,
    pub duration_secs: u64,
}

/// Disc name from the `CINFO` record, if present.
pub fn parse_disc_name(text: &str) -> Option<String> {
    DISC_NAME_RE
        .captures(text)
        .map(|caps| caps[1].to_string())
}

/// Every title duration record, in emission order.
pub fn parse_title_records(text: &str) -> Vec<TitleRecord> {
    TITLE_DURATION_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let index = caps[1].parse::<u32>().ok()?;
            let hours = caps[2].parse::<u64>().ok()?;
            let minutes = caps[3].parse::<u64>().ok()?;
            let seconds = caps[4].parse::<u64>().ok()?;
            Some(TitleRecord {
                index,
                duration_secs: hours * 3600 + minutes * 60 + seconds,
            })
        })
        .collect()
}

/// Percentage from a `PRGV` line (current / total).
pub fn parse_progress(line: &str) -> Option<u8> {
    let caps = PROGRESS_RE.captures(line)?;
    let current = caps[1].parse::<u64>().ok()?;
    let total = caps[2].parse::<u64>().ok()?;
    if total == 0 {
        return None;
    }
    Some(((current.min(total) * 100 + total / 2) / total) as u8)
}

/// Status text from a `MSG` line.
pub fn parse_message(line: &str) -> Option<String> {
    MESSAGE_RE.captures(line).map(|caps| caps[3].to_string())
}

/// Whether a chunk of output names a physical read failure.
pub fn indicates_read_error(text: &str) -> bool {
    READ_ERROR_MARKERS.iter().any(|marker| text.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCAN_FIXTURE: &str = r#"MSG:1005,0,1,"MakeMKV v1.17.7 linux(x64-release) started","%1 started","MakeMKV v1.17.7 linux(x64-release)"
DRV:0,2,999,1,"BD-RE HL-DT-ST","HOW_TO_TRAIN_YOUR_DRAGON","/dev/sr0"
TCOUNT:4
CINFO:1,6209,"Blu-ray disc"
CINFO:2,0,"HOW_TO_TRAIN_YOUR_DRAGON"
CINFO:32,0,"HOW_TO_TRAIN_YOUR_DRAGON"
TINFO:0,2,0,"How To Train Your Dragon"
TINFO:0,9,0,"0:02:00"
TINFO:1,9,0,"0:10:00"
TINFO:1,10,0,"1.2 GB"
TINFO:2,9,0,"0:00:45"
TINFO:3,9,0,"1:38:12"
"#;

    #[test]
    fn test_parse_disc_name() {
        assert_eq!(
            parse_disc_name(SCAN_FIXTURE).as_deref(),
            Some("HOW_TO_TRAIN_YOUR_DRAGON")
        );
        assert_eq!(parse_disc_name("TCOUNT:0\n"), None);
    }

    #[test]
    fn test_parse_title_records_in_emission_order() {
        let titles = parse_title_records(SCAN_FIXTURE);
        assert_eq!(
            titles,
            vec![
                TitleRecord { index: 0, duration_secs: 120 },
                TitleRecord { index: 1, duration_secs: 600 },
                TitleRecord { index: 2, duration_secs: 45 },
                TitleRecord { index: 3, duration_secs: 5892 },
            ]
        );
    }

    #[test]
    fn test_other_tinfo_attributes_are_ignored() {
        let titles = parse_title_records("TINFO:0,2,0,\"Name\"\nTINFO:0,10,0,\"1.2 GB\"\n");
        assert!(titles.is_empty());
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("PRGV:0,0,65536"), None);
        assert_eq!(parse_progress("PRGV:16384,32768,65536"), Some(50));
        assert_eq!(parse_progress("PRGV:65536,65536,65536"), Some(100));
        assert_eq!(parse_progress("PRGT:5018,0,\"Saving\""), None);
    }

    #[test]
    fn test_parse_message() {
        assert_eq!(
            parse_message(r#"MSG:5014,0,2,"Saving 1 titles into directory file:///tmp/x","Saving %1""#)
                .as_deref(),
            Some("Saving 1 titles into directory file:///tmp/x")
        );
        assert_eq!(parse_message("PRGV:1,2,3"), None);
    }

    #[test]
    fn test_read_error_markers() {
        assert!(indicates_read_error(
            r#"MSG:2003,0,3,"Error 'Scsi error - MEDIUM ERROR:L-EC UNCORRECTABLE ERROR' occurred""#
        ));
        assert!(indicates_read_error("Posix error - Input/output error"));
        assert!(!indicates_read_error("MSG:5036,0,1,\"Copy complete.\""));
    }
}
