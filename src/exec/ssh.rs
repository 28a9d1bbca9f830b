//! SSH argument construction for one instance.
//!
//! Key and password authentication are mutually exclusive: a stored password
//! wraps the client in `sshpass -e` (the password travels in `SSHPASS`, never
//! on the command line) and disables public key authentication.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::time::Duration;

use crate::fleet::Instance;

use super::Invocation;
use super::util::expand_tilde;

/// Environment variable `sshpass -e` reads the password from.
pub const SSHPASS_ENV: &str = "SSHPASS";

/// Client binaries and options shared by every SSH-based invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    pub scp_bin: String,
    /// Path to the `rsync` executable.
    pub rsync_bin: String,
    /// Path to the `sshpass` executable used for password auth.
    pub sshpass_bin: String,
    /// Extra arguments inserted before the target on every ssh call.
    pub extra_args: Vec<String>,
    /// Value passed as `ConnectTimeout`, when set.
    pub connect_timeout: Option<Duration>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            rsync_bin: String::from("rsync"),
            sshpass_bin: String::from("sshpass"),
            extra_args: Vec::new(),
            connect_timeout: None,
        }
    }
}

impl SshSettings {
    /// Returns a copy bounded by `timeout` per connection attempt.
    #[must_use]
    pub fn with_connect_timeout(&self, timeout: Duration) -> Self {
        Self {
            connect_timeout: Some(timeout),
            ..self.clone()
        }
    }

    /// Builds `ssh [opts] user@ip <remote_command>` for `instance`.
    #[must_use]
    pub fn ssh_invocation(&self, instance: &Instance, remote_command: &str) -> Invocation {
        let mut args = self.ssh_options(instance);
        args.extend(self.extra_args.iter().map(OsString::from));
        args.push(OsString::from(instance.ssh_target()));
        args.push(OsString::from(remote_command));
        self.authenticated(instance, &self.ssh_bin, args)
    }

    /// Options common to every ssh call against `instance`.
    #[must_use]
    pub fn ssh_options(&self, instance: &Instance) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(instance.ssh_port.to_string()),
        ];
        args.extend(auth_options(instance));
        args.extend(host_key_options());
        if let Some(timeout) = self.connect_timeout {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "ConnectTimeout={}",
                timeout.as_secs().max(1)
            )));
        }
        args
    }

    /// Wraps `program args` in `sshpass -e` when the instance uses a
    /// password, otherwise runs it directly.
    #[must_use]
    pub fn authenticated(
        &self,
        instance: &Instance,
        program: &str,
        args: Vec<OsString>,
    ) -> Invocation {
        let Some(ref password) = instance.password else {
            return Invocation::new(program).args(args);
        };
        Invocation::new(self.sshpass_bin.clone())
            .arg("-e")
            .arg(program)
            .args(args)
            .env(SSHPASS_ENV, password.clone())
    }
}

/// `-i key` for key auth, or the options that force password auth.
pub(crate) fn auth_options(instance: &Instance) -> Vec<OsString> {
    if instance.password.is_some() {
        return vec![
            OsString::from("-o"),
            OsString::from("PubkeyAuthentication=no"),
        ];
    }
    instance.ssh_key.as_ref().map_or_else(Vec::new, |key| {
        vec![OsString::from("-i"), OsString::from(expand_tilde(key.as_str()))]
    })
}

fn host_key_options() -> [OsString; 4] {
    [
        OsString::from("-o"),
        OsString::from("StrictHostKeyChecking=no"),
        OsString::from("-o"),
        OsString::from("UserKnownHostsFile=/dev/null"),
    ]
}

/// Serialises `env` into a prefix the remote shell evaluates before the
/// command, for example `export A=1 B='two words'; `. Empty when `env` is.
#[must_use]
pub fn render_env_prefix(env: &BTreeMap<String, String>) -> String {
    if env.is_empty() {
        return String::new();
    }
    let assignments: Vec<String> = env
        .iter()
        .map(|(key, value)| {
            format!(
                "{key}={}",
                shell_escape::unix::escape(value.as_str().into())
            )
        })
        .collect();
    format!("export {}; ", assignments.join(" "))
}
