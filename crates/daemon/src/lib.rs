//! Disc Ripper Daemon
//!
//! Unattended optical-disc ingestion: detect a disc, rip its main titles,
//! transcode them into the video library and notify the media front end.

pub mod coordinator;
pub mod daemon;
pub mod detect;
pub mod inspect;
pub mod makemkv;
pub mod notify;
pub mod process;
pub mod recovery;
pub mod rip;
pub mod startup;
pub mod state;
pub mod status;
pub mod transcode;

pub use disc_ripper_config as config;
pub use disc_ripper_config::Config;
pub use coordinator::{CycleError, CycleOutcome, PollOutcome, RipCoordinator};
pub use daemon::{Daemon, DaemonError};
pub use detect::MediaDetector;
pub use inspect::{DiscInfo, DiscInspector, ScanError, Title};
pub use notify::{HttpNotifier, Notification, NotificationKind, NotificationSink};
pub use process::{CommandRunner, CommandSpec, ProcessError, ProcessEvent, SystemRunner};
pub use recovery::{OrphanRecovery, RecoveryError, RecoveryReport};
pub use rip::{RipError, RipOutput, RipPipeline};
pub use startup::{run_startup_checks, StartupError};
pub use state::{CoordinatorState, PresenceChange, RipGuard};
pub use status::{create_status_router, run_status_server, CoordinatorStatus, Phase, ServerError};
pub use transcode::{humanize, TranscodeError, TranscodePipeline};
