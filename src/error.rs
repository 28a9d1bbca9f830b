//! Engine-level error taxonomy.
//!
//! Module errors convert into [`EngineError`] so the binary can map every
//! failure to one message and exit code 1. Invariant violations and missing
//! capabilities are configuration problems; provider API failures and store
//! I/O keep their own variants.

use thiserror::Error;

use crate::config::ConfigError;
use crate::dispatch::{FleetReport, FleetState};
use crate::fleet::FleetError;
use crate::provider::ProviderError;
use crate::readiness::ReadinessError;
use crate::store::StoreError;

/// Errors surfaced by [`crate::engine::Engine`] operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum EngineError {
    /// Missing or invalid settings, credentials, capabilities, or fleet
    /// invariants. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The name token matched nothing.
    #[error("no instance or cluster matches {token}")]
    NotFound {
        /// Token supplied by the operator.
        token: String,
        /// Rendered fleet listing shown to the operator.
        listing: String,
    },
    /// At least one instance failed; `summary` lists each failure.
    #[error("fleet operation {state}: {failed} instance(s) failed")]
    TerminalInstance {
        /// Terminal state of the operation.
        state: FleetState,
        /// Number of failed instances.
        failed: usize,
        /// Per-instance failure summary.
        summary: String,
    },
    /// A provider API call failed or returned garbage.
    #[error(transparent)]
    Provider(ProviderError),
    /// The fleet store could not be read or written.
    #[error("fleet store error: {0}")]
    Store(#[source] StoreError),
    /// The instance never became reachable before the deadline.
    #[error(transparent)]
    Readiness(#[from] ReadinessError),
}

impl EngineError {
    /// Builds the error for a failed fleet report.
    #[must_use]
    pub fn from_report(report: &FleetReport) -> Self {
        Self::TerminalInstance {
            state: report.state,
            failed: report.failures().count(),
            summary: report.summary(),
        }
    }
}

impl From<ProviderError> for EngineError {
    fn from(value: ProviderError) -> Self {
        match value {
            ProviderError::Api { .. } => Self::Provider(value),
            other => Self::Configuration(other.to_string()),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Invalid(err) => Self::from(err),
            other => Self::Store(other),
        }
    }
}

impl From<FleetError> for EngineError {
    fn from(value: FleetError) -> Self {
        Self::Configuration(value.to_string())
    }
}

impl From<ConfigError> for EngineError {
    fn from(value: ConfigError) -> Self {
        Self::Configuration(value.to_string())
    }
}
