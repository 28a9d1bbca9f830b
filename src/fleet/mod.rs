//! Fleet data model: named clusters of named instances.
//!
//! The store document maps cluster names to clusters, and each cluster maps
//! instance names to [`Instance`] records carrying SSH connection details and
//! optional provider metadata. Instance names are unique across the whole
//! fleet; [`Clusters::validate`] and [`Clusters::insert`] enforce that before
//! anything is written back.

mod matcher;

use std::collections::BTreeMap;
use std::fmt::Write as _;

use camino::Utf8PathBuf;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use matcher::{ALL_TOKEN, glob_to_regex, match_instances};

/// SSH port assumed when an instance record omits one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Remote user assumed when an instance record omits one.
pub const DEFAULT_SSH_USER: &str = "root";

const fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_ssh_user() -> String {
    DEFAULT_SSH_USER.to_owned()
}

/// Provider specific metadata attached to an instance.
///
/// Only `name` is interpreted by the engine (to pick the lifecycle adapter);
/// every other field belongs to the provider.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProviderMetadata {
    /// Provider identifier, for example `scaleway` or `multipass`.
    pub name: String,
    /// Opaque provider fields such as remote identifiers or zones.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ProviderMetadata {
    /// Creates metadata for `name` with no extra fields.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Map::new(),
        }
    }

    /// Adds a string field.
    #[must_use]
    pub fn with_field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields
            .insert(key.to_owned(), Value::String(value.into()));
        self
    }

    /// Returns a string field when present.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// One remote or local machine reachable over SSH.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Instance {
    /// Fleet-wide unique name.
    pub name: String,
    /// Address used for SSH. Empty until a provider reports one.
    #[serde(default)]
    pub ip: String,
    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// Private key used for authentication when no password is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<Utf8PathBuf>,
    /// Remote login user.
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// Password for password-based authentication. Disables key auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Provider metadata; absent for manually imported machines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderMetadata>,
}

impl Instance {
    /// Creates an instance with default port and user.
    #[must_use]
    pub fn new(name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            ssh_port: DEFAULT_SSH_PORT,
            ssh_key: None,
            user: default_ssh_user(),
            password: None,
            provider: None,
        }
    }

    /// Returns the provider name, if the instance is provider managed.
    #[must_use]
    pub fn provider_name(&self) -> Option<&str> {
        self.provider.as_ref().map(|meta| meta.name.as_str())
    }

    /// Returns `user@ip`.
    #[must_use]
    pub fn ssh_target(&self) -> String {
        format!("{}@{}", self.user, self.ip)
    }
}

/// A named grouping of instances.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Cluster {
    /// Instances keyed by name, in document order.
    #[serde(default)]
    pub instances: IndexMap<String, Instance>,
}

/// The full fleet document: clusters keyed by name.
///
/// Clusters and instances keep the order they have in `clusters.json`, and
/// that order survives a write back. New entries are appended.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Clusters(IndexMap<String, Cluster>);

/// Errors raised when the fleet document would violate its invariants.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FleetError {
    /// Raised when an instance name appears in more than one place.
    #[error("instance name {name} is used in both cluster {first} and cluster {second}")]
    DuplicateInstance {
        /// Offending instance name.
        name: String,
        /// Cluster that already holds the name.
        first: String,
        /// Cluster where the duplicate was found or requested.
        second: String,
    },
    /// Raised when an instance record's name differs from its key.
    #[error("instance stored under key {key} is named {name}")]
    NameMismatch {
        /// Map key in the document.
        key: String,
        /// Name inside the record.
        name: String,
    },
    /// Raised when an operation targets an instance that is not stored.
    #[error("no instance named {name}")]
    UnknownInstance {
        /// Requested name.
        name: String,
    },
    /// Raised when a wildcard token cannot be compiled.
    #[error("invalid pattern {token}: {message}")]
    Pattern {
        /// Token supplied by the caller.
        token: String,
        /// Compiler error.
        message: String,
    },
}

impl Clusters {
    /// Creates an empty fleet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Iterates clusters in document order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Cluster)> {
        self.0.iter().map(|(name, cluster)| (name.as_str(), cluster))
    }

    /// Iterates every instance with the name of its cluster, in store order.
    pub fn instances(&self) -> impl Iterator<Item = (&str, &Instance)> {
        self.0.iter().flat_map(|(cluster, entry)| {
            entry
                .instances
                .values()
                .map(move |instance| (cluster.as_str(), instance))
        })
    }

    /// Returns the named cluster.
    #[must_use]
    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.0.get(name)
    }

    /// Finds an instance and its cluster by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<(&str, &Instance)> {
        self.instances()
            .find(|(_, instance)| instance.name == name)
    }

    /// Returns `true` when no cluster holds any instance.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|cluster| cluster.instances.is_empty())
    }

    /// Checks fleet-wide name uniqueness and key/name agreement.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::DuplicateInstance`] or
    /// [`FleetError::NameMismatch`] for the first violation found.
    pub fn validate(&self) -> Result<(), FleetError> {
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for (cluster, entry) in &self.0 {
            for (key, instance) in &entry.instances {
                if key != &instance.name {
                    return Err(FleetError::NameMismatch {
                        key: key.clone(),
                        name: instance.name.clone(),
                    });
                }
                if let Some(first) = seen.insert(key.as_str(), cluster.as_str()) {
                    return Err(FleetError::DuplicateInstance {
                        name: key.clone(),
                        first: first.to_owned(),
                        second: cluster.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Adds `instance` to `cluster`, creating the cluster when needed.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::DuplicateInstance`] when the name is already in
    /// use anywhere in the fleet.
    pub fn insert(&mut self, cluster: &str, instance: Instance) -> Result<(), FleetError> {
        if let Some((existing, _)) = self.find(&instance.name) {
            return Err(FleetError::DuplicateInstance {
                name: instance.name,
                first: existing.to_owned(),
                second: cluster.to_owned(),
            });
        }
        self.0
            .entry(cluster.to_owned())
            .or_default()
            .instances
            .insert(instance.name.clone(), instance);
        Ok(())
    }

    /// Replaces the stored record with the same name, wherever it lives.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::UnknownInstance`] when no record has that name.
    pub fn replace(&mut self, instance: Instance) -> Result<(), FleetError> {
        for entry in self.0.values_mut() {
            if let Some(slot) = entry.instances.get_mut(&instance.name) {
                *slot = instance;
                return Ok(());
            }
        }
        Err(FleetError::UnknownInstance {
            name: instance.name,
        })
    }

    /// Removes an instance by name, dropping its cluster when it empties.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::UnknownInstance`] when no record has that name.
    pub fn remove(&mut self, name: &str) -> Result<Instance, FleetError> {
        let mut removed = None;
        for entry in self.0.values_mut() {
            if let Some(instance) = entry.instances.shift_remove(name) {
                removed = Some(instance);
                break;
            }
        }
        self.0.retain(|_, entry| !entry.instances.is_empty());
        removed.ok_or_else(|| FleetError::UnknownInstance {
            name: name.to_owned(),
        })
    }

    /// Renders a human-readable listing of the fleet.
    #[must_use]
    pub fn listing(&self) -> String {
        if self.is_empty() {
            return String::from("No clusters found.\n");
        }
        let mut out = String::new();
        for (cluster, entry) in &self.0 {
            writeln!(out, "{cluster}").ok();
            for instance in entry.instances.values() {
                let provider = instance.provider_name().unwrap_or("-");
                writeln!(
                    out,
                    "  {} ({}:{}, {provider})",
                    instance.name,
                    instance.ssh_target(),
                    instance.ssh_port
                )
                .ok();
            }
        }
        out
    }
}
