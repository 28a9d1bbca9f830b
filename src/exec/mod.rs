//! Subprocess execution against fleet instances.
//!
//! Every remote operation is one OS subprocess per attempt (`ssh`, `scp`, or
//! `rsync`, optionally wrapped in `sshpass`). The [`CommandRunner`] trait
//! isolates spawning so tests can script outcomes, while the remote command
//! and transfer runners turn instance records into invocations and classify
//! exits into [`ExecutionOutcome`]s.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

mod command;
mod output;
mod retry;
mod ssh;
mod transfer;
mod util;

pub use command::{RemoteCommand, RemoteCommandRunner, validate_env_key};
pub use output::{ColorCounter, ColorSlot, OutputPrefixer, OutputStream, PALETTE_SIZE};
pub use retry::{
    Attempted, DEFAULT_MAX_RETRIES, RetryPolicy, SSH_CONNECTION_FAILURE_CODE,
    TRANSIENT_MARKERS, run_with_retry,
};
pub use ssh::{SshSettings, render_env_prefix};
pub use transfer::{
    Direction, FileTransfer, INSTANCE_TOKEN, TransferMethod, TransferPaths, TransferRunner,
};
pub use util::expand_tilde;

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// A fully rendered subprocess invocation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Invocation {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
    /// Local file piped to the child's stdin.
    pub stdin: Option<Utf8PathBuf>,
}

impl Invocation {
    /// Starts an invocation of `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<OsString>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Pipes `path` into the child's stdin.
    #[must_use]
    pub fn stdin(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    /// Returns a shell-like rendering for logs and dry runs. Environment
    /// values are never included.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 2);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| shell_escape::unix::escape(arg.to_string_lossy()).into_owned()),
        );
        if let Some(ref path) = self.stdin {
            parts.push(format!("< {path}"));
        }
        parts.join(" ")
    }
}

/// Errors raised while spawning or supervising a subprocess.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when waiting on a spawned command fails.
    #[error("failed while waiting for {program}: {message}")]
    Wait {
        /// Command being supervised.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// Per-instance result of one unit of work.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExecutionOutcome {
    /// Every step exited zero.
    Success,
    /// A step exited non-zero; `None` when terminated by a signal.
    NonZeroExit(Option<i32>),
    /// Transient connection failures outlasted the retry budget.
    ConnectionFailure {
        /// Attempts made, including the first.
        attempts: u32,
    },
    /// A file transfer exited non-zero.
    TransferFailure(Option<i32>),
    /// A local failure (spawn, provider, or store error) prevented the work.
    Errored(String),
}

impl ExecutionOutcome {
    /// Returns `true` for [`ExecutionOutcome::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::NonZeroExit(Some(code)) => write!(f, "exited with status {code}"),
            Self::NonZeroExit(None) => write!(f, "terminated by signal"),
            Self::ConnectionFailure { attempts } => {
                write!(f, "connection failed after {attempts} attempts")
            }
            Self::TransferFailure(Some(code)) => write!(f, "transfer exited with status {code}"),
            Self::TransferFailure(None) => write!(f, "transfer terminated by signal"),
            Self::Errored(message) => write!(f, "{message}"),
        }
    }
}

/// Future returned by [`CommandRunner::run`].
pub type RunnerFuture<'a> = Pin<Box<dyn Future<Output = Result<CommandOutput, ExecError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `invocation`, forwarding each output line to `output` as it
    /// arrives and capturing both streams.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Spawn`] if the command cannot be started.
    fn run<'a>(&'a self, invocation: &'a Invocation, output: &'a OutputPrefixer)
    -> RunnerFuture<'a>;
}

/// Real command runner that shells out to the host operating system.
///
/// Output is streamed line by line while the child runs; stdout, stderr, and
/// the exit status are awaited concurrently so a chatty child cannot fill a
/// pipe and deadlock.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        invocation: &'a Invocation,
        output: &'a OutputPrefixer,
    ) -> RunnerFuture<'a> {
        Box::pin(async move {
            let program = invocation.program.clone();
            let mut command = Command::new(&invocation.program);
            command
                .args(&invocation.args)
                .envs(invocation.env.iter().map(|(key, value)| (key, value)))
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            command.stdin(open_stdin(invocation)?);

            let mut child = command.spawn().map_err(|err| ExecError::Spawn {
                program: program.clone(),
                message: err.to_string(),
            })?;

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let (waited, captured_out, captured_err) = tokio::join!(
                child.wait(),
                forward_lines(stdout, output, OutputStream::Stdout),
                forward_lines(stderr, output, OutputStream::Stderr),
            );
            let status = waited.map_err(|err| ExecError::Wait {
                program,
                message: err.to_string(),
            })?;

            Ok(CommandOutput {
                code: status.code(),
                stdout: captured_out,
                stderr: captured_err,
            })
        })
    }
}

fn open_stdin(invocation: &Invocation) -> Result<Stdio, ExecError> {
    invocation.stdin.as_ref().map_or_else(
        || Ok(Stdio::null()),
        |path| {
            std::fs::File::open(path)
                .map(Stdio::from)
                .map_err(|err| ExecError::Spawn {
                    program: invocation.program.clone(),
                    message: format!("cannot open {path}: {err}"),
                })
        },
    )
}

async fn forward_lines<R>(
    pipe: Option<R>,
    output: &OutputPrefixer,
    stream: OutputStream,
) -> String
where
    R: AsyncRead + Unpin,
{
    let mut captured = String::new();
    let Some(handle) = pipe else {
        return captured;
    };
    let mut reader = BufReader::new(handle);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buffer);
                output.line(stream, text.trim_end_matches(['\n', '\r']));
                captured.push_str(&text);
            }
        }
    }
    captured
}
