//! Command-line interface definitions for the `overcast` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `overcast` binary.
#[derive(Debug, Parser)]
#[command(
    name = "overcast",
    about = "Run commands, transfers, and lifecycle operations across a fleet of SSH hosts",
    version,
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Flags shared by every fleet operation.
    #[command(flatten)]
    pub(crate) fleet: FleetFlags,
    /// Operation to perform.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Dispatch toggles accepted before or after the subcommand.
#[derive(Debug, Args)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "each flag is an independent operator toggle"
)]
pub(crate) struct FleetFlags {
    /// Run against every matched instance at once instead of one by one.
    #[arg(long, global = true)]
    pub(crate) parallel: bool,
    /// Keep going after an instance fails; the command still exits 1.
    #[arg(long = "continue", global = true)]
    pub(crate) continue_on_error: bool,
    /// Print raw output lines without instance prefixes or colors.
    #[arg(long, global = true)]
    pub(crate) machine_readable: bool,
    /// Print what would run without running it.
    #[arg(long, global = true)]
    pub(crate) dry_run: bool,
}

/// Operations exposed by the binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Run commands or local scripts, in order, on matched instances.
    Run(RunCommand),
    /// Copy local files to matched instances.
    Push(TransferCommand),
    /// Copy files from matched instances.
    Pull(TransferCommand),
    /// Power on matched instances.
    Boot(PowerCommand),
    /// Power off matched instances.
    Shutdown(PowerCommand),
    /// Restart matched instances.
    Reboot(PowerCommand),
    /// Delete matched instances at their provider and drop them from the fleet.
    Destroy(TargetCommand),
    /// Change the size of matched instances.
    Resize(ResizeCommand),
    /// Provision a new instance through a provider.
    Create(CreateCommand),
    /// Add an existing machine to a cluster.
    Import(ImportCommand),
    /// Remove an instance from the fleet without touching its provider.
    Remove(TargetCommand),
    /// Wait until matched instances accept SSH.
    Wait(WaitCommand),
    /// List clusters and instances.
    List,
}

/// Arguments for `overcast run`.
#[derive(Debug, Args)]
pub(crate) struct RunCommand {
    /// Instance name, cluster name, wildcard pattern, or `all`.
    pub(crate) name: String,
    /// Shell commands or script files, executed in order.
    #[arg(required = true, num_args = 1.., value_name = "COMMAND|FILE")]
    pub(crate) commands: Vec<String>,
    /// Variable exported before each command.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub(crate) env: Vec<(String, String)>,
}

/// Arguments for `overcast push` and `overcast pull`.
#[derive(Debug, Args)]
pub(crate) struct TransferCommand {
    /// Instance name, cluster name, wildcard pattern, or `all`.
    pub(crate) name: String,
    /// Source path. `{instance}` in the local path expands to the instance name.
    pub(crate) source: String,
    /// Destination path.
    pub(crate) dest: String,
    /// Use rsync instead of scp.
    #[arg(long)]
    pub(crate) rsync: bool,
    /// Pattern excluded from an rsync transfer.
    #[arg(long, value_name = "PATTERN", requires = "rsync")]
    pub(crate) exclude: Vec<String>,
}

/// Arguments for power operations.
#[derive(Debug, Args)]
pub(crate) struct PowerCommand {
    /// Instance name, cluster name, wildcard pattern, or `all`.
    pub(crate) name: String,
    /// Wait for SSH once the instance is running.
    #[arg(long)]
    pub(crate) wait: bool,
}

/// Arguments naming a target only.
#[derive(Debug, Args)]
pub(crate) struct TargetCommand {
    /// Instance name, cluster name, wildcard pattern, or `all`.
    pub(crate) name: String,
}

/// Arguments for `overcast resize`.
#[derive(Debug, Args)]
pub(crate) struct ResizeCommand {
    /// Instance name, cluster name, wildcard pattern, or `all`.
    pub(crate) name: String,
    /// New provider size, for example `DEV1-M`.
    pub(crate) size: String,
    /// Leave the instance powered off afterwards.
    #[arg(long)]
    pub(crate) skip_boot: bool,
    /// Wait for SSH once the instance is running.
    #[arg(long, conflicts_with = "skip_boot")]
    pub(crate) wait: bool,
}

/// Arguments for `overcast create`.
#[derive(Debug, Args)]
pub(crate) struct CreateCommand {
    /// Provider to provision with, for example `scaleway` or `multipass`.
    pub(crate) provider: String,
    /// Name of the new instance.
    pub(crate) name: String,
    /// Cluster the instance joins.
    #[arg(long, default_value = "default")]
    pub(crate) cluster: String,
    /// Provider size or commercial type.
    #[arg(long)]
    pub(crate) size: Option<String>,
    /// Provider image label.
    #[arg(long)]
    pub(crate) image: Option<String>,
    /// Provider region or zone.
    #[arg(long)]
    pub(crate) region: Option<String>,
    /// Private key recorded for SSH access.
    #[arg(long, value_name = "PATH")]
    pub(crate) ssh_key: Option<String>,
    /// Public key installed on the instance.
    #[arg(long, value_name = "PATH")]
    pub(crate) ssh_pub_key: Option<String>,
    /// Login user when the image does not use root.
    #[arg(long)]
    pub(crate) user: Option<String>,
    /// Return as soon as the provider reports an address.
    #[arg(long)]
    pub(crate) no_wait: bool,
}

/// Arguments for `overcast import`.
#[derive(Debug, Args)]
pub(crate) struct ImportCommand {
    /// Fleet-wide unique name.
    pub(crate) name: String,
    /// Address used for SSH.
    pub(crate) ip: String,
    /// Cluster the instance joins.
    #[arg(long, default_value = "default")]
    pub(crate) cluster: String,
    /// SSH port.
    #[arg(long, default_value_t = 22)]
    pub(crate) port: u16,
    /// Remote login user.
    #[arg(long, default_value = "root")]
    pub(crate) user: String,
    /// Private key used for authentication.
    #[arg(long, value_name = "PATH", conflicts_with = "password")]
    pub(crate) ssh_key: Option<String>,
    /// Password for password-based authentication.
    #[arg(long, env = "OVERCAST_IMPORT_PASSWORD", hide_env_values = true)]
    pub(crate) password: Option<String>,
}

/// Arguments for `overcast wait`.
#[derive(Debug, Args)]
pub(crate) struct WaitCommand {
    /// Instance name, cluster name, wildcard pattern, or `all`.
    pub(crate) name: String,
    /// Give up after this many seconds instead of waiting indefinitely.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) timeout: Option<u64>,
}

/// Parses a `KEY=VALUE` pair.
pub(crate) fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw}"))
}
