//! Subprocess execution for the external ripping, transcoding and probe tools.
//!
//! Every tool invocation goes through the [`CommandRunner`] trait. The system
//! implementation spawns the program with `tokio::process`, reads stdout and
//! stderr concurrently on a background task and hands the caller a stream of
//! [`ProcessEvent`]s ending with the exit code.

use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// Exit code a POSIX shell reports when the wrapped program does not exist.
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Shell snippet that clears the file-creation mask before exec'ing `$0 "$@"`.
const UMASK_WRAPPER: &str = "umask 0000 && exec \"$0\" \"$@\"";

/// Error type for process operations
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program could not be started at all
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    /// True when the program is not installed (or not on PATH).
    pub fn is_not_found(&self) -> bool {
        match self {
            ProcessError::Spawn { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
        }
    }
}

/// A program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Run with a zero umask so created files are group/world writable.
    pub relaxed_umask: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            relaxed_umask: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn relaxed_umask(mut self) -> Self {
        self.relaxed_umask = true;
        self
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Output produced by a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    /// Final event; `None` when the process was killed by a signal.
    Exited(Option<i32>),
}

/// Everything a finished process produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Handle to a spawned process, consumed as a lazy sequence of events.
#[derive(Debug)]
pub struct RunningProcess {
    program: String,
    events: UnboundedReceiver<ProcessEvent>,
}

impl RunningProcess {
    pub fn new(program: impl Into<String>, events: UnboundedReceiver<ProcessEvent>) -> Self {
        Self {
            program: program.into(),
            events,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Next line or the exit event; `None` once the stream is exhausted.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }

    /// Drain every remaining event into a [`ProcessOutput`].
    pub async fn collect(mut self) -> ProcessOutput {
        let mut output = ProcessOutput::default();
        while let Some(event) = self.next_event().await {
            match event {
                ProcessEvent::Stdout(line) => {
                    output.stdout.push_str(&line);
                    output.stdout.push('\n');
                }
                ProcessEvent::Stderr(line) => {
                    output.stderr.push_str(&line);
                    output.stderr.push('\n');
                }
                ProcessEvent::Exited(code) => {
                    output.exit_code = code;
                    break;
                }
            }
        }
        output
    }
}

/// Seam between the pipelines and the operating system.
pub trait CommandRunner: Send + Sync {
    fn spawn(&self, spec: &CommandSpec) -> Result<RunningProcess, ProcessError>;
}

/// Spawn a command and wait for it to finish.
pub async fn run_to_completion(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
) -> Result<ProcessOutput, ProcessError> {
    let process = runner.spawn(spec)?;
    Ok(process.collect().await)
}

/// [`CommandRunner`] backed by real child processes.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

fn build_command(spec: &CommandSpec) -> Command {
    let mut cmd = if spec.relaxed_umask {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(UMASK_WRAPPER).arg(&spec.program);
        cmd
    } else {
        Command::new(&spec.program)
    };
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

impl CommandRunner for SystemRunner {
    fn spawn(&self, spec: &CommandSpec) -> Result<RunningProcess, ProcessError> {
        let mut child = build_command(spec)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: spec.program.clone(),
                source,
            })?;
        debug!(command = %spec.display(), pid = ?child.id(), "spawned process");

        let (tx, rx) = mpsc::unbounded_channel();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let program = spec.program.clone();

        tokio::spawn(async move {
            tokio::join!(
                pump_lines(stdout, tx.clone(), ProcessEvent::Stdout),
                pump_lines(stderr, tx.clone(), ProcessEvent::Stderr),
            );
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(program = %program, error = %e, "failed to wait for process");
                    None
                }
            };
            let _ = tx.send(ProcessEvent::Exited(code));
        });

        Ok(RunningProcess::new(spec.program.clone(), rx))
    }
}

/// Forward a pipe as lines, splitting on both `\n` and `\r`.
async fn pump_lines<R>(
    reader: Option<R>,
    tx: UnboundedSender<ProcessEvent>,
    wrap: fn(String) -> ProcessEvent,
) where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        let chunk = match reader.fill_buf().await {
            Ok(chunk) => chunk,
            Err(_) => break,
        };
        if chunk.is_empty() {
            break;
        }
        let consumed = chunk.len();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !line.is_empty() {
                    let _ = tx.send(wrap(String::from_utf8_lossy(&line).into_owned()));
                    line.clear();
                }
            } else {
                line.push(byte);
            }
        }
        reader.consume(consumed);
    }

    if !line.is_empty() {
        let _ = tx.send(wrap(String::from_utf8_lossy(&line).into_owned()));
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedRun, ScriptedRunner};
    use super::*;

    #[test]
    fn test_command_spec_builder() {
        let spec = CommandSpec::new("makemkvcon")
            .args(["-r", "mkv"])
            .arg("disc:0")
            .relaxed_umask();

        assert_eq!(spec.program, "makemkvcon");
        assert_eq!(spec.args, vec!["-r", "mkv", "disc:0"]);
        assert!(spec.relaxed_umask);
        assert_eq!(spec.display(), "makemkvcon -r mkv disc:0");
    }

    #[test]
    fn test_relaxed_umask_wraps_in_shell() {
        let spec = CommandSpec::new("makemkvcon").arg("disc:0").relaxed_umask();
        let cmd = build_command(&spec);
        let std_cmd = cmd.as_std();
        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(std_cmd.get_program(), "sh");
        assert_eq!(args, vec!["-c", UMASK_WRAPPER, "makemkvcon", "disc:0"]);
    }

    #[test]
    fn test_plain_command_is_not_wrapped() {
        let spec = CommandSpec::new("eject").arg("/dev/sr0");
        let cmd = build_command(&spec);
        assert_eq!(cmd.as_std().get_program(), "eject");
    }

    #[tokio::test]
    async fn test_system_runner_captures_streams_and_exit_code() {
        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg("printf 'one\\ntwo\\rthree\\n'; echo oops >&2; exit 3");
        let output = run_to_completion(&SystemRunner, &spec).await.unwrap();

        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout, "one\ntwo\nthree\n");
        assert_eq!(output.stderr, "oops\n");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_system_runner_missing_program() {
        let spec = CommandSpec::new("definitely-not-a-real-tool-4242");
        let err = SystemRunner.spawn(&spec).unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_relaxed_umask_creates_world_writable_files() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        let spec = CommandSpec::new("touch")
            .arg(target.to_string_lossy())
            .relaxed_umask();
        let output = run_to_completion(&SystemRunner, &spec).await.unwrap();
        assert!(output.success());

        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o666, 0o666);
    }

    #[tokio::test]
    async fn test_scripted_runner_replays_events() {
        let runner = ScriptedRunner::new(|_| Ok(ScriptedRun::exit(1).stdout("a\nb").stderr("c")));
        let mut process = runner.spawn(&CommandSpec::new("tool")).unwrap();

        assert_eq!(process.program(), "tool");
        assert_eq!(process.next_event().await, Some(ProcessEvent::Stdout("a".into())));
        assert_eq!(process.next_event().await, Some(ProcessEvent::Stdout("b".into())));
        assert_eq!(process.next_event().await, Some(ProcessEvent::Stderr("c".into())));
        assert_eq!(process.next_event().await, Some(ProcessEvent::Exited(Some(1))));
        assert_eq!(runner.calls_to("tool").len(), 1);
    }
}
