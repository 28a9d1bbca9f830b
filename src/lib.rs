//! Core library for the overcast fleet execution engine.
//!
//! The crate resolves name tokens against a stored fleet of SSH-reachable
//! instances and fans one logical operation out across the matches, either
//! one instance at a time or all at once. Operations are remote commands and
//! scripts, file transfers, and provider lifecycle changes (create, boot,
//! shutdown, reboot, destroy, resize) that poll until the provider reports
//! the target state and then wait for SSH.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod exec;
pub mod fleet;
pub mod lifecycle;
pub mod provider;
pub mod readiness;
pub mod store;
pub mod test_support;

pub use config::{ConfigError, EngineConfig};
pub use dispatch::{DispatchContext, FleetDispatcher, FleetMode, FleetReport, FleetState};
pub use engine::{Created, Engine};
pub use error::EngineError;
pub use exec::{CommandRunner, ExecutionOutcome, ProcessCommandRunner};
pub use fleet::{Cluster, Clusters, Instance, match_instances};
pub use lifecycle::LifecycleOperation;
pub use provider::{Provider, ProviderRegistry};
pub use store::{FleetStore, JsonFleetStore};
