//! File transfers between the operator's machine and one instance.
//!
//! Transfers share the output prefixing of remote commands but are never
//! retried: a partially applied rsync with `--delete` is not safe to repeat
//! blindly.

use std::ffi::OsString;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::fleet::Instance;

use super::ssh::{SshSettings, auth_options};
use super::util::expand_tilde;
use super::{CommandRunner, ExecError, ExecutionOutcome, Invocation, OutputPrefixer};

/// Placeholder in the local path replaced with the instance name.
pub const INSTANCE_TOKEN: &str = "{instance}";

/// Tool used to move files.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TransferMethod {
    /// Recursive `scp`.
    #[default]
    Scp,
    /// `rsync` over ssh with deletion of extraneous files.
    Rsync,
}

/// Which way files flow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Local source, remote destination.
    Push,
    /// Remote source, local destination.
    Pull,
}

/// A transfer request shared by every instance in one operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileTransfer {
    /// Tool used to move files.
    pub method: TransferMethod,
    /// Which way files flow.
    pub direction: Direction,
    /// Source path; remote for pulls.
    pub source: String,
    /// Destination path; remote for pushes.
    pub dest: String,
    /// rsync exclusion patterns. Ignored by scp.
    pub excludes: Vec<String>,
}

/// Local and remote paths of a transfer bound to one instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferPaths {
    /// Absolute local path.
    pub local: Utf8PathBuf,
    /// `user@ip:path` remote endpoint.
    pub remote: String,
}

impl FileTransfer {
    /// Returns the local-side path template.
    #[must_use]
    pub fn local_template(&self) -> &str {
        match self.direction {
            Direction::Push => &self.source,
            Direction::Pull => &self.dest,
        }
    }

    /// Returns the remote-side path.
    #[must_use]
    pub fn remote_path(&self) -> &str {
        match self.direction {
            Direction::Push => &self.dest,
            Direction::Pull => &self.source,
        }
    }

    /// Binds the transfer to `instance`, substituting the instance name in
    /// the local path and anchoring it at `cwd` when relative.
    #[must_use]
    pub fn resolve(&self, instance: &Instance, cwd: &Utf8Path) -> TransferPaths {
        let substituted = self.local_template().replace(INSTANCE_TOKEN, &instance.name);
        let expanded = Utf8PathBuf::from(expand_tilde(&substituted));
        let local = if expanded.is_absolute() {
            expanded
        } else {
            cwd.join(expanded)
        };
        TransferPaths {
            local,
            remote: format!("{}:{}", instance.ssh_target(), self.remote_path()),
        }
    }

    /// Returns `(from, to)` arguments in transfer order.
    #[must_use]
    pub fn endpoints(&self, paths: &TransferPaths) -> (String, String) {
        match self.direction {
            Direction::Push => (paths.local.to_string(), paths.remote.clone()),
            Direction::Pull => (paths.remote.clone(), paths.local.to_string()),
        }
    }
}

/// Runs [`FileTransfer`]s against single instances.
#[derive(Debug)]
pub struct TransferRunner<R: CommandRunner> {
    runner: Arc<R>,
    ssh: SshSettings,
    cwd: Utf8PathBuf,
}

impl<R: CommandRunner> Clone for TransferRunner<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            ssh: self.ssh.clone(),
            cwd: self.cwd.clone(),
        }
    }
}

impl<R: CommandRunner> TransferRunner<R> {
    /// Creates a runner resolving relative local paths against `cwd`.
    #[must_use]
    pub fn new(runner: Arc<R>, ssh: SshSettings, cwd: impl Into<Utf8PathBuf>) -> Self {
        Self {
            runner,
            ssh,
            cwd: cwd.into(),
        }
    }

    /// Builds the scp or rsync invocation for `transfer` on `instance`.
    #[must_use]
    pub fn invocation(&self, instance: &Instance, transfer: &FileTransfer) -> Invocation {
        let paths = transfer.resolve(instance, &self.cwd);
        let (from, to) = transfer.endpoints(&paths);
        match transfer.method {
            TransferMethod::Scp => {
                let mut args = vec![OsString::from("-r")];
                args.extend(auth_options(instance));
                args.push(OsString::from("-P"));
                args.push(OsString::from(instance.ssh_port.to_string()));
                args.push(OsString::from("-o"));
                args.push(OsString::from("StrictHostKeyChecking=no"));
                args.push(OsString::from(from));
                args.push(OsString::from(to));
                self.ssh.authenticated(instance, &self.ssh.scp_bin, args)
            }
            TransferMethod::Rsync => {
                let mut args = vec![
                    OsString::from("-e"),
                    OsString::from(self.rsync_shell(instance)),
                    OsString::from("-varuzP"),
                    OsString::from("--delete"),
                    OsString::from("--ignore-errors"),
                ];
                for pattern in &transfer.excludes {
                    args.push(OsString::from("--exclude"));
                    args.push(OsString::from(pattern));
                }
                args.push(OsString::from(from));
                args.push(OsString::from(to));
                self.ssh.authenticated(instance, &self.ssh.rsync_bin, args)
            }
        }
    }

    fn rsync_shell(&self, instance: &Instance) -> String {
        let mut parts = vec![
            self.ssh.ssh_bin.clone(),
            String::from("-p"),
            instance.ssh_port.to_string(),
        ];
        parts.extend(
            auth_options(instance)
                .iter()
                .map(|arg| shell_escape::unix::escape(arg.to_string_lossy()).into_owned()),
        );
        parts.push(String::from("-o"));
        parts.push(String::from("StrictHostKeyChecking=no"));
        parts.join(" ")
    }

    /// Executes `transfer` against `instance`. Failures are not retried.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] when the client cannot be spawned.
    pub async fn execute(
        &self,
        instance: &Instance,
        transfer: &FileTransfer,
        output: &OutputPrefixer,
    ) -> Result<ExecutionOutcome, ExecError> {
        let invocation = self.invocation(instance, transfer);
        debug!(instance = %instance.name, command = %invocation.command_line(), "running transfer");
        let result = self.runner.run(&invocation, output).await?;
        if result.is_success() {
            Ok(ExecutionOutcome::Success)
        } else {
            Ok(ExecutionOutcome::TransferFailure(result.code))
        }
    }
}
