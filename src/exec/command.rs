//! Remote command execution over SSH with transient-failure retry.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::fleet::Instance;

use super::retry::{RetryPolicy, run_with_retry};
use super::ssh::{SshSettings, render_env_prefix};
use super::{CommandRunner, ExecError, ExecutionOutcome, Invocation, OutputPrefixer};

/// One step of a command work unit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemoteCommand {
    /// Shell text executed by the remote shell.
    Literal(String),
    /// Local script streamed to `bash -s` on the remote side.
    Script(Utf8PathBuf),
}

impl RemoteCommand {
    /// Interprets `token` as a script when it names an existing file in
    /// `cwd` or, failing that, in `scripts_dir`; otherwise as a literal.
    #[must_use]
    pub fn resolve(token: &str, cwd: &Utf8Path, scripts_dir: Option<&Utf8Path>) -> Self {
        let local = cwd.join(token);
        if local.is_file() {
            return Self::Script(local);
        }
        if let Some(dir) = scripts_dir {
            let bundled = dir.join(token);
            if bundled.is_file() {
                return Self::Script(bundled);
            }
        }
        Self::Literal(token.to_owned())
    }

    fn remote_text(&self, env: &BTreeMap<String, String>) -> String {
        let prefix = render_env_prefix(env);
        match self {
            Self::Literal(command) => format!("{prefix}{command}"),
            Self::Script(_) => format!("{prefix}bash -s"),
        }
    }
}

/// Returns `true` when `key` is usable as a shell variable name.
#[must_use]
pub fn validate_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|first| first == '_' || first.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Runs [`RemoteCommand`]s against single instances.
#[derive(Debug)]
pub struct RemoteCommandRunner<R: CommandRunner> {
    runner: Arc<R>,
    ssh: SshSettings,
    retry: RetryPolicy,
}

impl<R: CommandRunner> Clone for RemoteCommandRunner<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            ssh: self.ssh.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<R: CommandRunner> RemoteCommandRunner<R> {
    /// Creates a runner.
    #[must_use]
    pub const fn new(runner: Arc<R>, ssh: SshSettings, retry: RetryPolicy) -> Self {
        Self { runner, ssh, retry }
    }

    /// Builds the invocation for `command` on `instance`.
    #[must_use]
    pub fn invocation(
        &self,
        instance: &Instance,
        command: &RemoteCommand,
        env: &BTreeMap<String, String>,
    ) -> Invocation {
        let invocation = self
            .ssh
            .ssh_invocation(instance, &command.remote_text(env));
        match command {
            RemoteCommand::Literal(_) => invocation,
            RemoteCommand::Script(path) => invocation.stdin(path.clone()),
        }
    }

    /// Executes `command` on `instance` and classifies the result.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] when the client cannot be spawned.
    pub async fn execute(
        &self,
        instance: &Instance,
        command: &RemoteCommand,
        env: &BTreeMap<String, String>,
        output: &OutputPrefixer,
    ) -> Result<ExecutionOutcome, ExecError> {
        let invocation = self.invocation(instance, command, env);
        debug!(instance = %instance.name, command = %invocation.command_line(), "running remote command");
        let attempted = run_with_retry(self.runner.as_ref(), &self.retry, &invocation, output).await?;
        if attempted.exhausted {
            return Ok(ExecutionOutcome::ConnectionFailure {
                attempts: attempted.attempts,
            });
        }
        if attempted.output.is_success() {
            Ok(ExecutionOutcome::Success)
        } else {
            Ok(ExecutionOutcome::NonZeroExit(attempted.output.code))
        }
    }
}
