//! Shared lifecycle flows built on provider primitives.

use std::sync::Arc;

use tracing::info;

use crate::fleet::Instance;

use super::{
    Capability, InstanceSpec, InstanceStatus, LifecycleRequest, PollSettings, PowerAction,
    PowerState, Provider, ProviderError, poll_until,
};

/// Drives one provider through create, power, destroy, and resize flows.
#[derive(Clone)]
pub struct LifecycleAdapter {
    provider: Arc<dyn Provider>,
    poll: PollSettings,
}

impl std::fmt::Debug for LifecycleAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleAdapter")
            .field("provider", &self.provider.name())
            .field("poll", &self.poll)
            .finish()
    }
}

impl LifecycleAdapter {
    /// Wraps `provider` with the given polling settings.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, poll: PollSettings) -> Self {
        Self { provider, poll }
    }

    /// Returns the wrapped provider's name.
    #[must_use]
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Fails unless the provider supports `capability`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Unsupported`].
    pub fn require(&self, capability: Capability) -> Result<(), ProviderError> {
        if self.provider.capabilities().contains(capability) {
            return Ok(());
        }
        Err(ProviderError::Unsupported {
            provider: self.provider.name().to_owned(),
            capability,
        })
    }

    /// Provisions an instance and waits until it is running with an address.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the capability is missing or any
    /// provider call fails.
    pub async fn create(&self, spec: &InstanceSpec) -> Result<Instance, ProviderError> {
        self.require(Capability::Create)?;
        let mut instance = self.provider.submit_create(spec).await?;
        info!(instance = %instance.name, provider = self.provider.name(), "create submitted");
        let status = self
            .wait_for(&instance, PowerState::Running, InstanceStatus::is_reachable)
            .await?;
        status.apply_to(&mut instance);
        Ok(instance)
    }

    /// Powers on and waits until running.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the capability is missing or any
    /// provider call fails.
    pub async fn boot(&self, instance: &Instance) -> Result<Instance, ProviderError> {
        self.power(instance, PowerAction::Boot).await
    }

    /// Powers off and waits until stopped.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the capability is missing or any
    /// provider call fails.
    pub async fn shutdown(&self, instance: &Instance) -> Result<Instance, ProviderError> {
        self.power(instance, PowerAction::Shutdown).await
    }

    /// Restarts and waits until running.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the capability is missing or any
    /// provider call fails.
    pub async fn reboot(&self, instance: &Instance) -> Result<Instance, ProviderError> {
        self.power(instance, PowerAction::Reboot).await
    }

    /// Requests deletion. No polling: success of the call is the confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the capability is missing or the
    /// provider call fails.
    pub async fn destroy(&self, instance: &Instance) -> Result<(), ProviderError> {
        self.require(Capability::Destroy)?;
        self.provider.submit_destroy(instance).await?;
        info!(instance = %instance.name, provider = self.provider.name(), "destroy confirmed");
        Ok(())
    }

    /// Stops the instance unless already stopped, changes its size, then
    /// boots it again unless `skip_boot` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when a required capability is missing or
    /// any provider call fails.
    pub async fn resize(
        &self,
        instance: &Instance,
        size: &str,
        skip_boot: bool,
    ) -> Result<Instance, ProviderError> {
        self.require(Capability::Resize)?;
        let mut current = instance.clone();
        let status = self.provider.describe(&current).await?;
        if status.state != PowerState::Stopped {
            current = self.shutdown(&current).await?;
        }
        self.provider.submit_resize(&current, size).await?;
        info!(instance = %current.name, size, "resize submitted");
        if skip_boot {
            return Ok(current);
        }
        self.boot(&current).await
    }

    async fn power(&self, instance: &Instance, action: PowerAction) -> Result<Instance, ProviderError> {
        self.require(action.capability())?;
        self.provider.submit_power(instance, action).await?;
        info!(instance = %instance.name, ?action, "power change submitted");
        let target = action.target_state();
        let status = self
            .wait_for(instance, target, move |status: &InstanceStatus| {
                status.state == target
            })
            .await?;
        let mut updated = instance.clone();
        status.apply_to(&mut updated);
        Ok(updated)
    }

    async fn wait_for<P>(
        &self,
        instance: &Instance,
        target: PowerState,
        done: P,
    ) -> Result<InstanceStatus, ProviderError>
    where
        P: Fn(&InstanceStatus) -> bool,
    {
        let request = LifecycleRequest {
            instance: instance.name.clone(),
            target_state: target,
            timeout: self.poll.timeout,
        };
        let outcome = poll_until(
            self.poll,
            &format!("{} -> {}", request.instance, request.target_state),
            || self.provider.describe(instance),
            done,
        )
        .await?;
        if outcome.timed_out() {
            info!(
                instance = %request.instance,
                state = %request.target_state,
                timeout_secs = request.timeout.as_secs(),
                "assuming target state after timeout"
            );
        }
        Ok(outcome.into_value())
    }
}
