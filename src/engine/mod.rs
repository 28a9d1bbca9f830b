//! Engine facade tying the matcher, store, dispatcher, runners, providers,
//! and readiness poller into the operations the CLI exposes.
//!
//! Every fleet operation reads the store once, resolves the name token, checks
//! what it can before anything runs, then dispatches one task per instance.
//! A report with any failure is returned as
//! [`EngineError::TerminalInstance`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use tracing::info;

use crate::config::EngineConfig;
use crate::dispatch::{DispatchContext, FleetDispatcher, FleetReport, InstanceTask, WorkUnit, WorkUnitTask};
use crate::error::EngineError;
use crate::exec::{
    CommandRunner, FileTransfer, RemoteCommand, RemoteCommandRunner, RetryPolicy, SshSettings,
    TransferRunner, validate_env_key,
};
use crate::fleet::{FleetError, Instance, match_instances};
use crate::lifecycle::{LifecycleOperation, LifecycleTask};
use crate::provider::{
    InstanceSpec, LifecycleAdapter, PollSettings, ProviderError, ProviderRegistry,
};
use crate::readiness::{
    DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_READINESS_DELAY, Readiness, ReadinessPoller,
};
use crate::store::FleetStore;

/// Result of [`Engine::create`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Created {
    /// Stored record of the new instance.
    pub instance: Instance,
    /// Readiness wait result, when requested.
    pub readiness: Option<Readiness>,
}

/// Fleet execution engine.
#[derive(Debug)]
pub struct Engine<S: FleetStore, R: CommandRunner> {
    store: Arc<S>,
    runner: Arc<R>,
    registry: ProviderRegistry,
    ssh: SshSettings,
    retry: RetryPolicy,
    poll: PollSettings,
    readiness_delay: Duration,
    attempt_timeout: Duration,
    cwd: Utf8PathBuf,
    scripts_dir: Option<Utf8PathBuf>,
}

impl<S, R> Engine<S, R>
where
    S: FleetStore + 'static,
    R: CommandRunner + 'static,
{
    /// Creates an engine with default SSH, retry, and polling settings.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        runner: Arc<R>,
        registry: ProviderRegistry,
        cwd: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            store,
            runner,
            registry,
            ssh: SshSettings::default(),
            retry: RetryPolicy::ssh_transient(),
            poll: PollSettings::default(),
            readiness_delay: DEFAULT_READINESS_DELAY,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            cwd: cwd.into(),
            scripts_dir: None,
        }
    }

    /// Applies binaries, retry budget, timings, and the scripts directory
    /// from `config`.
    #[must_use]
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.ssh = config.ssh_settings();
        self.retry = config.retry_policy();
        self.poll = config.poll_settings();
        self.readiness_delay = config.readiness_delay();
        self.attempt_timeout = config.readiness_attempt_timeout();
        self.scripts_dir = config.scripts_dir();
        self
    }

    /// Overrides provider polling.
    #[must_use]
    pub const fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// Overrides the directory searched for bundled scripts.
    #[must_use]
    pub fn with_scripts_dir(mut self, dir: Option<Utf8PathBuf>) -> Self {
        self.scripts_dir = dir;
        self
    }

    /// Resolves `token` against the stored fleet.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] with the fleet listing when nothing
    /// matches, or a store/pattern error.
    pub fn resolve(&self, token: &str) -> Result<Vec<Instance>, EngineError> {
        let clusters = self.store.clusters()?;
        let instances = match_instances(&clusters, token)?;
        if instances.is_empty() {
            return Err(EngineError::NotFound {
                token: token.to_owned(),
                listing: clusters.listing(),
            });
        }
        Ok(instances)
    }

    /// Runs shell commands or scripts, in order, on every matched instance.
    ///
    /// Each step naming a file in the working directory or the scripts
    /// directory is streamed as a script; anything else runs as shell text.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for an empty step list or an
    /// invalid variable name, [`EngineError::NotFound`], or
    /// [`EngineError::TerminalInstance`] when any instance fails.
    pub async fn run(
        &self,
        token: &str,
        steps: &[String],
        env: BTreeMap<String, String>,
        ctx: DispatchContext,
    ) -> Result<FleetReport, EngineError> {
        if steps.is_empty() {
            return Err(EngineError::Configuration(String::from(
                "no command given",
            )));
        }
        if let Some(key) = env.keys().find(|key| !validate_env_key(key)) {
            return Err(EngineError::Configuration(format!(
                "invalid environment variable name {key}"
            )));
        }
        let instances = self.resolve(token)?;
        let commands = steps
            .iter()
            .map(|step| RemoteCommand::resolve(step, &self.cwd, self.scripts_dir.as_deref()))
            .collect();
        self.dispatch_unit(
            instances,
            WorkUnit::Commands {
                steps: commands,
                env,
            },
            ctx,
        )
        .await
    }

    /// Pushes or pulls files on every matched instance.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] or
    /// [`EngineError::TerminalInstance`].
    pub async fn transfer(
        &self,
        token: &str,
        transfer: FileTransfer,
        ctx: DispatchContext,
    ) -> Result<FleetReport, EngineError> {
        let instances = self.resolve(token)?;
        self.dispatch_unit(instances, WorkUnit::Transfer(transfer), ctx)
            .await
    }

    /// Applies a lifecycle operation to every matched instance, optionally
    /// waiting for SSH once each instance is running again.
    ///
    /// Provider lookup and capabilities are checked for every instance before
    /// anything is dispatched.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] when an instance is not
    /// provider managed or its provider lacks the capability,
    /// [`EngineError::NotFound`], or [`EngineError::TerminalInstance`].
    pub async fn lifecycle(
        &self,
        token: &str,
        operation: LifecycleOperation,
        wait_ready: bool,
        ctx: DispatchContext,
    ) -> Result<FleetReport, EngineError> {
        let instances = self.resolve(token)?;
        for instance in &instances {
            let provider = self.registry.for_instance(instance)?;
            let capability = operation.capability();
            if !provider.capabilities().contains(capability) {
                return Err(ProviderError::Unsupported {
                    provider: provider.name().to_owned(),
                    capability,
                }
                .into());
            }
        }
        let mut task = LifecycleTask::new(
            operation,
            self.registry.clone(),
            self.poll,
            Arc::clone(&self.store),
        );
        if wait_ready {
            task = task.with_readiness(self.readiness_poller(None));
        }
        self.dispatch(instances, Arc::new(task), ctx).await
    }

    /// Provisions one instance through `provider`, records it in the store,
    /// and optionally waits until it accepts SSH.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for a duplicate name, an
    /// unknown provider, or a missing capability; [`EngineError::Provider`]
    /// when provisioning fails; or a readiness error.
    pub async fn create(
        &self,
        provider: &str,
        spec: &InstanceSpec,
        wait_ready: bool,
    ) -> Result<Created, EngineError> {
        let clusters = self.store.clusters()?;
        if let Some((existing, _)) = clusters.find(&spec.name) {
            return Err(FleetError::DuplicateInstance {
                name: spec.name.clone(),
                first: existing.to_owned(),
                second: spec.cluster.clone(),
            }
            .into());
        }
        let adapter = LifecycleAdapter::new(self.registry.get(provider)?, self.poll);
        let instance = adapter.create(spec).await?;
        self.store
            .update(&mut |fleet| fleet.insert(&spec.cluster, instance.clone()))?;
        info!(instance = %instance.name, cluster = %spec.cluster, provider, "instance created");

        let readiness = if wait_ready {
            Some(self.readiness_poller(None).wait(&instance).await?)
        } else {
            None
        };
        Ok(Created {
            instance,
            readiness,
        })
    }

    /// Waits until every matched instance accepts SSH.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] or
    /// [`EngineError::TerminalInstance`] when an instance misses `deadline`.
    pub async fn wait_ready(
        &self,
        token: &str,
        deadline: Option<Duration>,
        ctx: DispatchContext,
    ) -> Result<FleetReport, EngineError> {
        let instances = self.resolve(token)?;
        self.dispatch(instances, Arc::new(self.readiness_poller(deadline)), ctx)
            .await
    }

    /// Adds an existing machine to `cluster` without touching any provider.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] when the name is taken.
    pub fn import(&self, cluster: &str, instance: Instance) -> Result<(), EngineError> {
        self.store
            .update(&mut |fleet| fleet.insert(cluster, instance.clone()))?;
        info!(instance = %instance.name, cluster, "instance imported");
        Ok(())
    }

    /// Drops an instance from the store without touching any provider.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for an unknown name.
    pub fn remove(&self, name: &str) -> Result<Instance, EngineError> {
        let mut removed = None;
        self.store.update(&mut |fleet| {
            removed = Some(fleet.remove(name)?);
            Ok(())
        })?;
        removed.ok_or_else(|| {
            EngineError::from(FleetError::UnknownInstance {
                name: name.to_owned(),
            })
        })
    }

    /// Renders the stored fleet.
    ///
    /// # Errors
    ///
    /// Returns a store error when the fleet cannot be read.
    pub fn listing(&self) -> Result<String, EngineError> {
        Ok(self.store.clusters()?.listing())
    }

    fn readiness_poller(&self, deadline: Option<Duration>) -> ReadinessPoller<R> {
        ReadinessPoller::new(Arc::clone(&self.runner), self.ssh.clone())
            .with_delay(self.readiness_delay)
            .with_attempt_timeout(self.attempt_timeout)
            .with_deadline(deadline)
    }

    async fn dispatch_unit(
        &self,
        instances: Vec<Instance>,
        unit: WorkUnit,
        ctx: DispatchContext,
    ) -> Result<FleetReport, EngineError> {
        let task = WorkUnitTask::new(
            unit,
            RemoteCommandRunner::new(Arc::clone(&self.runner), self.ssh.clone(), self.retry.clone()),
            TransferRunner::new(Arc::clone(&self.runner), self.ssh.clone(), self.cwd.clone()),
        );
        self.dispatch(instances, Arc::new(task), ctx).await
    }

    async fn dispatch<T: InstanceTask>(
        &self,
        instances: Vec<Instance>,
        task: Arc<T>,
        ctx: DispatchContext,
    ) -> Result<FleetReport, EngineError> {
        info!(count = instances.len(), mode = ?ctx.mode, "dispatching fleet operation");
        let report = FleetDispatcher::new(ctx).dispatch(instances, task).await;
        if report.is_success() {
            Ok(report)
        } else {
            Err(EngineError::from_report(&report))
        }
    }
}

#[cfg(test)]
mod tests;
