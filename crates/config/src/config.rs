//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Optical drive configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriveConfig {
    /// Block device of the optical drive
    #[serde(default = "default_device")]
    pub device: String,
    /// Disc slot passed to the ripping tool as `disc:<slot>`
    #[serde(default)]
    pub disc_slot: u32,
}

fn default_device() -> String {
    "/dev/sr0".to_string()
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            disc_slot: 0,
        }
    }
}

/// Directory layout configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Root directory for intermediate files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Directory served by the media front end
    #[serde(default = "default_video_dir")]
    pub video_dir: PathBuf,
    /// Optional subfolder of `video_dir` for finished files (empty = none)
    #[serde(default)]
    pub output_subfolder: String,
    /// Rip each disc into `temp_dir/<disc name>` instead of `temp_dir`
    #[serde(default = "default_true")]
    pub create_temp_subfolder: bool,
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/tmp/disc-ripper")
}

fn default_video_dir() -> PathBuf {
    PathBuf::from("~/Videos")
}

fn default_true() -> bool {
    true
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            video_dir: default_video_dir(),
            output_subfolder: String::new(),
            create_temp_subfolder: true,
        }
    }
}

/// Title selection and post-rip behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RipConfig {
    /// Number of longest titles to rip per disc
    #[serde(default = "default_titles_to_rip")]
    pub titles_to_rip: u32,
    /// Titles shorter than this are ignored
    #[serde(default = "default_min_title_length_secs")]
    pub min_title_length_secs: u64,
    /// Eject the disc as soon as ripping finishes
    #[serde(default = "default_true")]
    pub auto_eject: bool,
    /// Move intermediate files next to the transcoded output instead of deleting them
    #[serde(default)]
    pub keep_intermediate: bool,
}

fn default_titles_to_rip() -> u32 {
    1
}

fn default_min_title_length_secs() -> u64 {
    300
}

impl Default for RipConfig {
    fn default() -> Self {
        Self {
            titles_to_rip: default_titles_to_rip(),
            min_title_length_secs: default_min_title_length_secs(),
            auto_eject: true,
            keep_intermediate: false,
        }
    }
}

/// Transcoder codec/quality profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscodeConfig {
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_crf")]
    pub crf: u32,
    /// Extension (and container) of the final output
    #[serde(default = "default_output_extension")]
    pub output_extension: String,
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_crf() -> u32 {
    23
}

fn default_output_extension() -> String {
    "mp4".to_string()
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            video_codec: default_video_codec(),
            audio_codec: default_audio_codec(),
            preset: default_preset(),
            crf: default_crf(),
            output_extension: default_output_extension(),
        }
    }
}

/// Polling cadence and timing windows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Window after a completed rip during which the same disc is ignored
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Delay between detection and inspection to let the drive spin up
    #[serde(default = "default_spin_up_delay_secs")]
    pub spin_up_delay_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_spin_up_delay_secs() -> u64 {
    5
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            cooldown_secs: default_cooldown_secs(),
            spin_up_delay_secs: default_spin_up_delay_secs(),
        }
    }
}

/// External tool executables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ripper")]
    pub ripper: String,
    #[serde(default = "default_transcoder")]
    pub transcoder: String,
    #[serde(default = "default_eject")]
    pub eject: String,
}

fn default_ripper() -> String {
    "makemkvcon".to_string()
}

fn default_transcoder() -> String {
    "ffmpeg".to_string()
}

fn default_eject() -> String {
    "eject".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ripper: default_ripper(),
            transcoder: default_transcoder(),
            eject: default_eject(),
        }
    }
}

/// Front-end notification endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NotifyConfig {
    /// Base URL of the media front end; notifications are dropped when unset
    #[serde(default)]
    pub url: Option<String>,
}

/// Status HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_status_bind")]
    pub bind: String,
}

fn default_status_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_status_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub rip: RipConfig,
    #[serde(default)]
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

/// A configured path that was rewritten by `~` expansion
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedPath {
    pub original: PathBuf,
    pub expanded: PathBuf,
}

/// Expand a leading `~` against the given home directory.
///
/// Returns `None` when the path does not start with `~` or no home is known.
pub fn expand_home(path: &Path, home: Option<&str>) -> Option<PathBuf> {
    let home = home.filter(|h| !h.is_empty())?;
    let rest = path.strip_prefix("~").ok()?;
    Some(Path::new(home).join(rest))
}

fn parse_bool(val: &str) -> Option<bool> {
    // Accept "true", "1", "yes" as true; "false", "0", "no" as false
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RIPPER_DEVICE -> drive.device
    /// - RIPPER_TEMP_DIR -> paths.temp_dir
    /// - RIPPER_VIDEO_DIR -> paths.video_dir
    /// - RIPPER_TITLES_TO_RIP -> rip.titles_to_rip
    /// - RIPPER_MIN_TITLE_LENGTH -> rip.min_title_length_secs
    /// - RIPPER_AUTO_EJECT -> rip.auto_eject
    /// - RIPPER_KEEP_INTERMEDIATE -> rip.keep_intermediate
    /// - RIPPER_POLL_INTERVAL_SECS -> schedule.poll_interval_secs
    /// - RIPPER_NOTIFY_URL -> notify.url
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RIPPER_DEVICE") {
            if !val.is_empty() {
                self.drive.device = val;
            }
        }

        if let Ok(val) = env::var("RIPPER_TEMP_DIR") {
            if !val.is_empty() {
                self.paths.temp_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("RIPPER_VIDEO_DIR") {
            if !val.is_empty() {
                self.paths.video_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("RIPPER_TITLES_TO_RIP") {
            if let Ok(titles) = val.parse::<u32>() {
                self.rip.titles_to_rip = titles;
            }
        }

        if let Ok(val) = env::var("RIPPER_MIN_TITLE_LENGTH") {
            if let Ok(secs) = val.parse::<u64>() {
                self.rip.min_title_length_secs = secs;
            }
        }

        if let Ok(val) = env::var("RIPPER_AUTO_EJECT") {
            if let Some(flag) = parse_bool(&val) {
                self.rip.auto_eject = flag;
            }
        }

        if let Ok(val) = env::var("RIPPER_KEEP_INTERMEDIATE") {
            if let Some(flag) = parse_bool(&val) {
                self.rip.keep_intermediate = flag;
            }
        }

        if let Ok(val) = env::var("RIPPER_POLL_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                if secs > 0 {
                    self.schedule.poll_interval_secs = secs;
                }
            }
        }

        if let Ok(val) = env::var("RIPPER_NOTIFY_URL") {
            self.notify.url = if val.is_empty() { None } else { Some(val) };
        }
    }

    /// Expand `~` in the temp and video directories using `$HOME`.
    ///
    /// Returns the paths that were rewritten so the caller can report them.
    pub fn expand_paths(&mut self) -> Vec<ExpandedPath> {
        let home = env::var("HOME").ok();
        let mut expanded = Vec::new();

        for path in [&mut self.paths.temp_dir, &mut self.paths.video_dir] {
            if let Some(new_path) = expand_home(path, home.as_deref()) {
                expanded.push(ExpandedPath {
                    original: path.clone(),
                    expanded: new_path.clone(),
                });
                *path = new_path;
            }
        }

        expanded
    }

    /// Directory receiving finished files: `video_dir[/output_subfolder]`
    pub fn final_output_dir(&self) -> PathBuf {
        let subfolder = self.paths.output_subfolder.trim();
        if subfolder.is_empty() {
            self.paths.video_dir.clone()
        } else {
            self.paths.video_dir.join(subfolder)
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}
