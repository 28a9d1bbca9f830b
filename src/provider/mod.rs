//! Provider abstraction for instance lifecycle management.
//!
//! A [`Provider`] exposes asynchronous primitives (submit a change, describe
//! current state) plus an explicit [`Capabilities`] set. The shared
//! [`LifecycleAdapter`] composes those primitives into create, power, destroy,
//! and resize flows that poll until the provider reports the target state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::fleet::{Instance, ProviderMetadata};

mod adapter;
pub mod multipass;
mod poll;
pub mod scaleway;

pub use adapter::LifecycleAdapter;
pub use poll::{
    DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT, PollOutcome, PollSettings, poll_until,
};

/// Metadata key recording the size an instance was created or resized to.
pub const SIZE_FIELD: &str = "size";

/// Future returned by provider primitives.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Operation a provider may support.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Capability {
    /// Provision a new instance.
    Create,
    /// Power on.
    Boot,
    /// Power off.
    Shutdown,
    /// Restart.
    Reboot,
    /// Delete permanently.
    Destroy,
    /// Change the instance size.
    Resize,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Create => "create",
            Self::Boot => "boot",
            Self::Shutdown => "shutdown",
            Self::Reboot => "reboot",
            Self::Destroy => "destroy",
            Self::Resize => "resize",
        };
        f.write_str(label)
    }
}

/// Set of [`Capability`] values a provider implements.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    /// Every capability.
    #[must_use]
    pub fn all() -> Self {
        Self::from_iter([
            Capability::Create,
            Capability::Boot,
            Capability::Shutdown,
            Capability::Reboot,
            Capability::Destroy,
            Capability::Resize,
        ])
    }

    /// No capability.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Returns a copy without `capability`.
    #[must_use]
    pub fn without(mut self, capability: Capability) -> Self {
        self.0.remove(&capability);
        self
    }

    /// Returns `true` when `capability` is supported.
    #[must_use]
    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Power transition requested from a provider.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerAction {
    /// Power on.
    Boot,
    /// Power off.
    Shutdown,
    /// Restart.
    Reboot,
}

impl PowerAction {
    /// State the provider should report once the action has completed.
    #[must_use]
    pub const fn target_state(self) -> PowerState {
        match self {
            Self::Boot | Self::Reboot => PowerState::Running,
            Self::Shutdown => PowerState::Stopped,
        }
    }

    /// Capability required to request the action.
    #[must_use]
    pub const fn capability(self) -> Capability {
        match self {
            Self::Boot => Capability::Boot,
            Self::Shutdown => Capability::Shutdown,
            Self::Reboot => Capability::Reboot,
        }
    }
}

/// Normalised power state reported by a provider.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerState {
    /// Transitioning or provisioning.
    Pending,
    /// Powered on.
    Running,
    /// Powered off.
    Stopped,
    /// No longer known to the provider.
    Gone,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Gone => "gone",
        };
        f.write_str(label)
    }
}

/// Snapshot returned by [`Provider::describe`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceStatus {
    /// Current power state.
    pub state: PowerState,
    /// Address reachable over SSH, once assigned.
    pub ip: Option<String>,
    /// SSH port, when the provider maps one.
    pub ssh_port: Option<u16>,
    /// Refreshed provider metadata.
    pub metadata: Option<ProviderMetadata>,
}

impl InstanceStatus {
    /// Status with only a power state.
    #[must_use]
    pub const fn new(state: PowerState) -> Self {
        Self {
            state,
            ip: None,
            ssh_port: None,
            metadata: None,
        }
    }

    /// Adds an address.
    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Returns `true` when running with a usable address.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.state == PowerState::Running && self.ip.as_deref().is_some_and(|ip| !ip.is_empty())
    }

    /// Copies reported connection details and metadata onto `instance`.
    pub fn apply_to(&self, instance: &mut Instance) {
        if let Some(ref ip) = self.ip
            && !ip.is_empty()
        {
            instance.ip.clone_from(ip);
        }
        if let Some(port) = self.ssh_port {
            instance.ssh_port = port;
        }
        if let Some(ref metadata) = self.metadata {
            instance.provider = Some(metadata.clone());
        }
    }
}

/// Parameters for provisioning a new instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceSpec {
    /// Fleet-wide unique name.
    pub name: String,
    /// Cluster the instance joins.
    pub cluster: String,
    /// Provider size or commercial type.
    pub size: Option<String>,
    /// Provider image label.
    pub image: Option<String>,
    /// Provider region or zone.
    pub region: Option<String>,
    /// Private key recorded for SSH access.
    pub ssh_key: Option<Utf8PathBuf>,
    /// Public key installed on the instance, when the provider supports it.
    pub ssh_public_key: Option<Utf8PathBuf>,
    /// Login user, when the provider image does not use `root`.
    pub user: Option<String>,
}

/// One polling loop's target, built by the adapter and never persisted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LifecycleRequest {
    /// Instance being driven.
    pub instance: String,
    /// State that ends the loop.
    pub target_state: PowerState,
    /// Upper bound before failing open.
    pub timeout: Duration,
}

/// Errors raised by providers and the lifecycle adapter.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when a provider lacks a capability.
    #[error("provider {provider} does not support {capability}")]
    Unsupported {
        /// Provider name.
        provider: String,
        /// Missing capability.
        capability: Capability,
    },
    /// Raised when the provider API call fails or returns garbage.
    #[error("{provider} request failed: {message}")]
    Api {
        /// Provider name.
        provider: String,
        /// Error text.
        message: String,
    },
    /// Raised when provider configuration is missing or invalid.
    #[error("provider configuration error: {0}")]
    Config(String),
    /// Raised when an instance names a provider nobody registered.
    #[error("unknown provider {0}")]
    UnknownProvider(String),
    /// Raised when an instance has no provider metadata.
    #[error("instance {instance} is not managed by a provider")]
    NotManaged {
        /// Instance name.
        instance: String,
    },
    /// Raised when provider metadata lacks a required field.
    #[error("instance {instance} is missing provider field {field}")]
    MissingMetadata {
        /// Instance name.
        instance: String,
        /// Missing field.
        field: String,
    },
}

/// Provider-specific lifecycle primitives.
///
/// Primitives return once the provider has accepted the request; waiting is
/// the adapter's job. Unimplemented primitives report
/// [`ProviderError::Unsupported`].
pub trait Provider: Send + Sync {
    /// Provider identifier matching [`ProviderMetadata::name`].
    fn name(&self) -> &str;

    /// Operations this provider implements.
    fn capabilities(&self) -> Capabilities;

    /// Reports the current state of `instance`.
    fn describe<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, InstanceStatus>;

    /// Requests a new instance and returns its initial record.
    fn submit_create<'a>(&'a self, _spec: &'a InstanceSpec) -> ProviderFuture<'a, Instance> {
        unsupported(self.name(), Capability::Create)
    }

    /// Requests a power transition.
    fn submit_power<'a>(
        &'a self,
        _instance: &'a Instance,
        action: PowerAction,
    ) -> ProviderFuture<'a, ()> {
        unsupported(self.name(), action.capability())
    }

    /// Requests deletion.
    fn submit_destroy<'a>(&'a self, _instance: &'a Instance) -> ProviderFuture<'a, ()> {
        unsupported(self.name(), Capability::Destroy)
    }

    /// Requests a size change. The instance is stopped when this is called.
    fn submit_resize<'a>(
        &'a self,
        _instance: &'a Instance,
        _size: &'a str,
    ) -> ProviderFuture<'a, ()> {
        unsupported(self.name(), Capability::Resize)
    }
}

fn unsupported<'a, T: Send + 'a>(provider: &str, capability: Capability) -> ProviderFuture<'a, T> {
    let err = ProviderError::Unsupported {
        provider: provider.to_owned(),
        capability,
    };
    Box::pin(async move { Err(err) })
}

/// Returns a required metadata field of a provider-managed instance.
///
/// # Errors
///
/// Returns [`ProviderError::NotManaged`] or [`ProviderError::MissingMetadata`].
pub fn metadata_field<'a>(instance: &'a Instance, field: &str) -> Result<&'a str, ProviderError> {
    let metadata = instance
        .provider
        .as_ref()
        .ok_or_else(|| ProviderError::NotManaged {
            instance: instance.name.clone(),
        })?;
    metadata
        .field(field)
        .ok_or_else(|| ProviderError::MissingMetadata {
            instance: instance.name.clone(),
            field: field.to_owned(),
        })
}

/// Providers available to the engine, keyed by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
    unavailable: BTreeMap<String, String>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("unavailable", &self.unavailable)
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` under its own name, replacing any previous entry.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.unavailable.remove(provider.name());
        self.providers.insert(provider.name().to_owned(), provider);
    }

    /// Records that `name` is known but could not be set up, so lookups
    /// report `reason` instead of an unknown provider.
    pub fn mark_unavailable(&mut self, name: &str, reason: impl Into<String>) {
        if !self.providers.contains_key(name) {
            self.unavailable.insert(name.to_owned(), reason.into());
        }
    }

    /// Looks up a provider by name.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] for a provider marked unavailable
    /// and [`ProviderError::UnknownProvider`] when nothing is registered.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        if let Some(provider) = self.providers.get(name) {
            return Ok(Arc::clone(provider));
        }
        Err(self.unavailable.get(name).map_or_else(
            || ProviderError::UnknownProvider(name.to_owned()),
            |reason| ProviderError::Config(format!("{name}: {reason}")),
        ))
    }

    /// Returns the provider managing `instance`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NotManaged`] for imported instances, or
    /// [`ProviderError::UnknownProvider`].
    pub fn for_instance(&self, instance: &Instance) -> Result<Arc<dyn Provider>, ProviderError> {
        let name = instance
            .provider_name()
            .ok_or_else(|| ProviderError::NotManaged {
                instance: instance.name.clone(),
            })?;
        self.get(name)
    }

    /// Names of registered providers.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}
