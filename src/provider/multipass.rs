//! Local virtual machines managed through the `multipass` CLI.
//!
//! Every primitive shells out through the crate's [`CommandRunner`], so the
//! provider is scripted in tests exactly like SSH work. Multipass cannot
//! change the size of an existing VM, so resize is not offered.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde_json::Value;
use tracing::debug;

use crate::exec::{CommandOutput, CommandRunner, Invocation, OutputPrefixer};
use crate::fleet::{Instance, ProviderMetadata};

use super::{
    Capabilities, Capability, InstanceSpec, InstanceStatus, PowerAction, PowerState, Provider,
    ProviderError, ProviderFuture, metadata_field,
};

/// Name recorded in provider metadata.
pub const PROVIDER_NAME: &str = "multipass";

/// Metadata key holding the VM name.
pub const VM_FIELD: &str = "vm";

/// Login user of stock Ubuntu images.
pub const DEFAULT_USER: &str = "ubuntu";

/// Provider driving the `multipass` binary.
#[derive(Debug)]
pub struct MultipassProvider<R: CommandRunner> {
    runner: Arc<R>,
    bin: String,
    work_dir: Utf8PathBuf,
}

impl<R: CommandRunner> MultipassProvider<R> {
    /// Creates a provider. Cloud-init files are written under `work_dir`.
    #[must_use]
    pub fn new(runner: Arc<R>, bin: impl Into<String>, work_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            runner,
            bin: bin.into(),
            work_dir: work_dir.into(),
        }
    }

    async fn multipass(&self, args: &[&str]) -> Result<CommandOutput, ProviderError> {
        let invocation = Invocation::new(self.bin.clone()).args(args.iter().copied());
        debug!(command = %invocation.command_line(), "running multipass");
        self.runner
            .run(&invocation, &OutputPrefixer::silent())
            .await
            .map_err(|err| api_error(err.to_string()))
    }

    async fn checked(&self, args: &[&str]) -> Result<CommandOutput, ProviderError> {
        let output = self.multipass(args).await?;
        if output.is_success() {
            return Ok(output);
        }
        Err(api_error(format!(
            "multipass {} failed: {}",
            args.first().copied().unwrap_or_default(),
            output.stderr.trim()
        )))
    }

    fn prepare_cloud_init(
        &self,
        name: &str,
        public_key_path: &Utf8Path,
    ) -> Result<Utf8PathBuf, ProviderError> {
        let public_key = std::fs::read_to_string(public_key_path)
            .map_err(|err| api_error(format!("reading {public_key_path}: {err}")))?;
        let io_error = |err: std::io::Error| api_error(format!("cloud-init for {name}: {err}"));
        Dir::create_ambient_dir_all(&self.work_dir, ambient_authority()).map_err(io_error)?;
        let dir = Dir::open_ambient_dir(&self.work_dir, ambient_authority()).map_err(io_error)?;
        let file_name = format!("{name}-cloud-init.yaml");
        dir.write(&file_name, cloud_init(&public_key)).map_err(io_error)?;
        Ok(self.work_dir.join(file_name))
    }
}

fn api_error(message: String) -> ProviderError {
    ProviderError::Api {
        provider: PROVIDER_NAME.to_owned(),
        message,
    }
}

/// Renders a cloud-config document authorising `public_key`.
#[must_use]
pub fn cloud_init(public_key: &str) -> String {
    format!(
        "#cloud-config\nssh_authorized_keys:\n  - {}\n",
        public_key.trim()
    )
}

/// Parses `multipass info --format json` output for `vm`.
///
/// # Errors
///
/// Returns [`ProviderError::Api`] when the document is not valid JSON.
pub fn parse_info(vm: &str, stdout: &str) -> Result<InstanceStatus, ProviderError> {
    let info: Value = serde_json::from_str(stdout)
        .map_err(|err| api_error(format!("parsing multipass info: {err}")))?;
    let Some(entry) = info.get("info").and_then(|all| all.get(vm)) else {
        return Ok(InstanceStatus::new(PowerState::Gone));
    };
    let state = match entry.get("state").and_then(Value::as_str).unwrap_or_default() {
        "Running" => PowerState::Running,
        "Stopped" | "Suspended" => PowerState::Stopped,
        "Deleted" => PowerState::Gone,
        _ => PowerState::Pending,
    };
    let ip = entry
        .get("ipv4")
        .and_then(Value::as_array)
        .and_then(|addresses| addresses.first())
        .and_then(Value::as_str)
        .map(str::to_owned);
    Ok(InstanceStatus {
        state,
        ip,
        ssh_port: None,
        metadata: None,
    })
}

const fn action_verb(action: PowerAction) -> &'static str {
    match action {
        PowerAction::Boot => "start",
        PowerAction::Shutdown => "stop",
        PowerAction::Reboot => "restart",
    }
}

impl<R: CommandRunner + 'static> Provider for MultipassProvider<R> {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all().without(Capability::Resize)
    }

    fn describe<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, InstanceStatus> {
        Box::pin(async move {
            let vm = metadata_field(instance, VM_FIELD)?;
            let output = self.multipass(&["info", vm, "--format", "json"]).await?;
            if output.is_success() {
                return parse_info(vm, &output.stdout);
            }
            if output.stderr.contains("does not exist") {
                return Ok(InstanceStatus::new(PowerState::Gone));
            }
            Err(api_error(format!("multipass info failed: {}", output.stderr.trim())))
        })
    }

    fn submit_create<'a>(&'a self, spec: &'a InstanceSpec) -> ProviderFuture<'a, Instance> {
        Box::pin(async move {
            let cloud_init_path = spec
                .ssh_public_key
                .as_ref()
                .map(|path| self.prepare_cloud_init(&spec.name, path))
                .transpose()?;

            let mut args: Vec<&str> = vec!["launch"];
            if let Some(ref image) = spec.image {
                args.push(image);
            }
            args.extend(["--name", spec.name.as_str()]);
            if let Some(ref memory) = spec.size {
                args.extend(["--memory", memory.as_str()]);
            }
            if let Some(ref path) = cloud_init_path {
                args.extend(["--cloud-init", path.as_str()]);
            }
            self.checked(&args).await?;

            let mut instance = Instance::new(spec.name.clone(), "");
            instance.user = spec.user.clone().unwrap_or_else(|| DEFAULT_USER.to_owned());
            instance.ssh_key.clone_from(&spec.ssh_key);
            instance.provider =
                Some(ProviderMetadata::new(PROVIDER_NAME).with_field(VM_FIELD, spec.name.clone()));
            Ok(instance)
        })
    }

    fn submit_power<'a>(
        &'a self,
        instance: &'a Instance,
        action: PowerAction,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let vm = metadata_field(instance, VM_FIELD)?;
            self.checked(&[action_verb(action), vm]).await?;
            Ok(())
        })
    }

    fn submit_destroy<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let vm = metadata_field(instance, VM_FIELD)?;
            self.checked(&["delete", "--purge", vm]).await?;
            Ok(())
        })
    }
}
