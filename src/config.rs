//! Configuration loading via `ortho-config`.
//!
//! [`EngineConfig`] merges defaults, an `overcast.toml` discovered in the
//! usual places, and `OVERCAST_*` environment variables. Provider credentials
//! live with their provider (see [`crate::provider::scaleway::ScalewayConfig`]).

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::exec::{RetryPolicy, SshSettings, expand_tilde};
use crate::provider::PollSettings;

/// Configuration directory used when none is configured.
pub const DEFAULT_CONFIG_DIR: &str = "~/.overcast";

/// Engine settings shared by every command.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "OVERCAST",
    discovery(
        app_name = "overcast",
        env_var = "OVERCAST_CONFIG_PATH",
        config_file_name = "overcast.toml",
        dotfile_name = ".overcast.toml",
        project_file_name = "overcast.toml"
    )
)]
pub struct EngineConfig {
    /// Directory holding `clusters.json` and `variables.json`. Supports
    /// tilde expansion. Defaults to `~/.overcast`.
    pub config_dir: Option<String>,
    /// Directory searched for bundled scripts after the working directory.
    pub scripts_dir: Option<String>,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Path to the `rsync` executable.
    #[ortho_config(default = "rsync".to_owned())]
    pub rsync_bin: String,
    /// Path to the `sshpass` executable used for password authentication.
    #[ortho_config(default = "sshpass".to_owned())]
    pub sshpass_bin: String,
    /// Path to the `multipass` executable driving local VMs.
    #[ortho_config(default = "multipass".to_owned())]
    pub multipass_bin: String,
    /// Extra ssh arguments, whitespace separated.
    pub ssh_args: Option<String>,
    /// Retries after a transient connection failure.
    #[ortho_config(default = 3)]
    pub retry_attempts: u32,
    /// Seconds between readiness probes.
    #[ortho_config(default = 2)]
    pub readiness_delay_secs: u64,
    /// Seconds allowed for one readiness probe, passed to ssh as
    /// `ConnectTimeout`.
    #[ortho_config(default = 10)]
    pub readiness_attempt_timeout_secs: u64,
    /// Seconds between provider state polls.
    #[ortho_config(default = 3)]
    pub poll_interval_secs: u64,
    /// Seconds before a provider state poll fails open.
    #[ortho_config(default = 300)]
    pub poll_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            config_dir: None,
            scripts_dir: None,
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            rsync_bin: String::from("rsync"),
            sshpass_bin: String::from("sshpass"),
            multipass_bin: String::from("multipass"),
            ssh_args: None,
            retry_attempts: 3,
            readiness_delay_secs: 2,
            readiness_attempt_timeout_secs: 10,
            poll_interval_secs: 3,
            poll_timeout_secs: 300,
        }
    }
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
pub(crate) struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    pub(crate) const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }

    /// Fails when `value` is missing or blank.
    pub(crate) fn require(&self, value: Option<&str>) -> Result<(), ConfigError> {
        if value.is_none_or(|text| text.trim().is_empty()) {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to [{}] in overcast.toml",
                self.description, self.env_var, self.toml_key, self.section
            )));
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("overcast")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, meta) in [
            (
                &self.ssh_bin,
                FieldMetadata::new("ssh binary", "OVERCAST_SSH_BIN", "ssh_bin", "overcast"),
            ),
            (
                &self.scp_bin,
                FieldMetadata::new("scp binary", "OVERCAST_SCP_BIN", "scp_bin", "overcast"),
            ),
            (
                &self.rsync_bin,
                FieldMetadata::new("rsync binary", "OVERCAST_RSYNC_BIN", "rsync_bin", "overcast"),
            ),
            (
                &self.sshpass_bin,
                FieldMetadata::new(
                    "sshpass binary",
                    "OVERCAST_SSHPASS_BIN",
                    "sshpass_bin",
                    "overcast",
                ),
            ),
            (
                &self.multipass_bin,
                FieldMetadata::new(
                    "multipass binary",
                    "OVERCAST_MULTIPASS_BIN",
                    "multipass_bin",
                    "overcast",
                ),
            ),
        ] {
            meta.require(Some(value.as_str()))?;
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "poll_interval_secs must be at least 1",
            )));
        }
        if self.readiness_attempt_timeout_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "readiness_attempt_timeout_secs must be at least 1",
            )));
        }
        Ok(())
    }

    /// Resolved configuration directory.
    #[must_use]
    pub fn config_dir(&self) -> Utf8PathBuf {
        let raw = self.config_dir.as_deref().unwrap_or(DEFAULT_CONFIG_DIR);
        Utf8PathBuf::from(expand_tilde(raw))
    }

    /// Resolved bundled scripts directory.
    #[must_use]
    pub fn scripts_dir(&self) -> Option<Utf8PathBuf> {
        self.scripts_dir
            .as_deref()
            .map(|dir| Utf8PathBuf::from(expand_tilde(dir)))
    }

    /// SSH client settings for remote commands and transfers.
    #[must_use]
    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            ssh_bin: self.ssh_bin.clone(),
            scp_bin: self.scp_bin.clone(),
            rsync_bin: self.rsync_bin.clone(),
            sshpass_bin: self.sshpass_bin.clone(),
            extra_args: self
                .ssh_args
                .as_deref()
                .map(|args| args.split_whitespace().map(str::to_owned).collect())
                .unwrap_or_default(),
            connect_timeout: None,
        }
    }

    /// Retry policy for remote commands.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::ssh_transient().with_max_retries(self.retry_attempts)
    }

    /// Provider state polling settings.
    #[must_use]
    pub const fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(self.poll_interval_secs),
            timeout: Duration::from_secs(self.poll_timeout_secs),
        }
    }

    /// Delay between readiness probes.
    #[must_use]
    pub const fn readiness_delay(&self) -> Duration {
        Duration::from_secs(self.readiness_delay_secs)
    }

    /// Time allowed for one readiness probe.
    #[must_use]
    pub const fn readiness_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_attempt_timeout_secs)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds an unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
