//! Provider lifecycle operations dispatched across matched instances.
//!
//! A [`LifecycleTask`] adapts one [`LifecycleOperation`] to the dispatcher:
//! it looks up the instance's provider, drives the shared adapter flow,
//! merges the refreshed record into the store, and optionally waits for SSH.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::dispatch::{InstanceTask, TaskContext, TaskFuture};
use crate::exec::{CommandRunner, ExecutionOutcome, OutputStream};
use crate::fleet::Instance;
use crate::provider::{
    Capability, LifecycleAdapter, PollSettings, ProviderError, ProviderRegistry, SIZE_FIELD,
};
use crate::readiness::{ReadinessError, ReadinessPoller};
use crate::store::{FleetStore, StoreError};

/// Lifecycle change applied to every matched instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LifecycleOperation {
    /// Power on.
    Boot,
    /// Power off.
    Shutdown,
    /// Restart.
    Reboot,
    /// Delete at the provider and drop from the store.
    Destroy,
    /// Change size, stopping first when needed.
    Resize {
        /// Provider size or commercial type.
        size: String,
        /// Leave the instance stopped afterwards.
        skip_boot: bool,
    },
}

impl LifecycleOperation {
    /// Capability the provider must advertise.
    #[must_use]
    pub const fn capability(&self) -> Capability {
        match self {
            Self::Boot => Capability::Boot,
            Self::Shutdown => Capability::Shutdown,
            Self::Reboot => Capability::Reboot,
            Self::Destroy => Capability::Destroy,
            Self::Resize { .. } => Capability::Resize,
        }
    }

    /// Returns `true` when the instance ends up running and should accept SSH.
    #[must_use]
    pub const fn leaves_running(&self) -> bool {
        matches!(
            self,
            Self::Boot | Self::Reboot | Self::Resize { skip_boot: false, .. }
        )
    }
}

impl fmt::Display for LifecycleOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boot => f.write_str("boot"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::Reboot => f.write_str("reboot"),
            Self::Destroy => f.write_str("destroy"),
            Self::Resize { size, .. } => write!(f, "resize to {size}"),
        }
    }
}

/// Errors that end one instance's lifecycle task.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LifecycleError {
    /// Provider lookup, capability, or API failure.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The refreshed record could not be written back.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The instance never accepted SSH before the deadline.
    #[error(transparent)]
    Readiness(#[from] ReadinessError),
}

/// Applies one [`LifecycleOperation`] per dispatched instance.
#[derive(Debug)]
pub struct LifecycleTask<S: FleetStore, R: CommandRunner> {
    operation: LifecycleOperation,
    registry: ProviderRegistry,
    poll: PollSettings,
    store: Arc<S>,
    readiness: Option<ReadinessPoller<R>>,
}

impl<S: FleetStore, R: CommandRunner> LifecycleTask<S, R> {
    /// Creates a task that does not wait for SSH afterwards.
    #[must_use]
    pub const fn new(
        operation: LifecycleOperation,
        registry: ProviderRegistry,
        poll: PollSettings,
        store: Arc<S>,
    ) -> Self {
        Self {
            operation,
            registry,
            poll,
            store,
            readiness: None,
        }
    }

    /// Waits for SSH with `poller` after operations that leave the instance
    /// running.
    #[must_use]
    pub fn with_readiness(mut self, poller: ReadinessPoller<R>) -> Self {
        self.readiness = Some(poller);
        self
    }

    async fn apply(&self, instance: &Instance, ctx: &TaskContext) -> Result<(), LifecycleError> {
        let adapter = LifecycleAdapter::new(self.registry.for_instance(instance)?, self.poll);
        adapter.require(self.operation.capability())?;
        if ctx.dry_run {
            ctx.output.line(
                OutputStream::Stdout,
                &format!("would {} via {}", self.operation, adapter.provider_name()),
            );
            return Ok(());
        }

        let updated = match self.operation {
            LifecycleOperation::Boot => adapter.boot(instance).await?,
            LifecycleOperation::Shutdown => adapter.shutdown(instance).await?,
            LifecycleOperation::Reboot => adapter.reboot(instance).await?,
            LifecycleOperation::Destroy => {
                adapter.destroy(instance).await?;
                self.store
                    .update(&mut |clusters| clusters.remove(&instance.name).map(drop))?;
                ctx.output.line(OutputStream::Stdout, "destroyed");
                return Ok(());
            }
            LifecycleOperation::Resize {
                ref size,
                skip_boot,
            } => {
                let mut resized = adapter.resize(instance, size, skip_boot).await?;
                resized.provider = resized
                    .provider
                    .take()
                    .map(|metadata| metadata.with_field(SIZE_FIELD, size.as_str()));
                resized
            }
        };

        self.store
            .update(&mut |clusters| clusters.replace(updated.clone()))?;
        info!(instance = %updated.name, operation = %self.operation, "lifecycle change applied");
        ctx.output
            .line(OutputStream::Stdout, &format!("{} complete", self.operation));

        if self.operation.leaves_running()
            && let Some(ref poller) = self.readiness
        {
            let readiness = poller.wait(&updated).await?;
            ctx.output.line(
                OutputStream::Stdout,
                &format!("ready after {:.1}s", readiness.elapsed.as_secs_f64()),
            );
        }
        Ok(())
    }
}

impl<S, R> InstanceTask for LifecycleTask<S, R>
where
    S: FleetStore + 'static,
    R: CommandRunner + 'static,
{
    fn execute<'a>(&'a self, instance: &'a Instance, ctx: &'a TaskContext) -> TaskFuture<'a> {
        Box::pin(async move {
            self.apply(instance, ctx).await.map_or_else(
                |err| ExecutionOutcome::Errored(err.to_string()),
                |()| ExecutionOutcome::Success,
            )
        })
    }
}
